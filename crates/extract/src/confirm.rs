//! Confirmation of candidate entity merges by an external oracle.
//!
//! The oracle answers in free text that should contain a Python-style list of booleans.
//! [`parse_confirmation`] extracts and validates that list independently of any model call.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

static BRACKETED_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?\]").expect("valid list pattern"));

/// Entity context shown to the oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct PairEntity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

/// Two entities that may refer to the same real-world thing.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePair {
    pub left: PairEntity,
    pub right: PairEntity,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleParseError {
    #[error("no bracketed list found in oracle response")]
    NoList,

    #[error("invalid literal '{0}' in oracle list")]
    InvalidLiteral(String),

    #[error("oracle returned {got} answers for {expected} pairs")]
    LengthMismatch { expected: usize, got: usize },
}

/// Decides, for each pair in a batch, whether both entities are the same.
#[async_trait]
pub trait ConfirmationOracle: Send + Sync {
    async fn confirm_pairs(&self, batch: &[CandidatePair]) -> Result<Vec<bool>>;
}

/// Pull the boolean list out of an oracle response.
///
/// A single-line `[...]` match is tried first; only when none exists is the text between
/// the first `[` and the next `]` used, which also covers lists broken across lines.
pub fn extract_list(response: &str) -> Option<&str> {
    if let Some(found) = BRACKETED_LIST.find(response) {
        return Some(found.as_str());
    }

    let start = response.find('[')?;
    let end = response[start..].find(']')? + start;
    Some(&response[start..=end])
}

/// Parse a list of `True`/`False` literals, e.g. `[True, False]`.
pub fn parse_bool_literals(list: &str) -> Result<Vec<bool>, OracleParseError> {
    let inner = list
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or(OracleParseError::NoList)?;

    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    let tokens: Vec<&str> = inner.split(',').map(str::trim).collect();
    let last = tokens.len() - 1;

    let mut values = Vec::with_capacity(tokens.len());
    for (idx, token) in tokens.into_iter().enumerate() {
        match token {
            "True" => values.push(true),
            "False" => values.push(false),
            "" if idx == last && idx > 0 => {} // trailing comma
            other => return Err(OracleParseError::InvalidLiteral(other.to_string())),
        }
    }
    Ok(values)
}

pub fn parse_confirmation(response: &str, expected: usize) -> Result<Vec<bool>, OracleParseError> {
    let list = extract_list(response).ok_or(OracleParseError::NoList)?;
    let values = parse_bool_literals(list)?;

    if values.len() != expected {
        return Err(OracleParseError::LengthMismatch {
            expected,
            got: values.len(),
        });
    }
    Ok(values)
}
