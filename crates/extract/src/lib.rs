pub mod schema;
pub mod parser;
pub mod prompt;
pub mod confirm;
pub mod llm;
pub mod resolver;

pub use schema::{ChunkGraph, DocumentGraph, Entity, Relationship, TypeTag};
pub use parser::{ExtractionParser, ParseFailure, ParsedChunk, RawChunk};
pub use confirm::{CandidatePair, ConfirmationOracle, OracleParseError, PairEntity};
pub use llm::{ChunkExtractor, OllamaClient};
pub use resolver::{Embedder, EntityResolver, MergeTable, ResolutionReport};
