use crate::confirm::CandidatePair;

pub const TUPLE_DELIMITER: &str = " : ";
pub const RECORD_DELIMITER: &str = "##";
pub const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

pub fn build_extraction_prompt(chunk_text: &str) -> String {
    format!(
        r#"Extract entities and relationships from the following text to build a knowledge graph.

STEPS:
1. Identify every concept with independent significance as an entity
   (people, events, locations, organizations, periods, treaties, concepts, ...).
   For each entity output:
   ("entity"{td}"<entity_name>"{td}"<entity_type>"{td}"<entity_description>")
2. From those entities, identify every pair that is clearly related. For each output:
   ("relationship"{td}"<source_entity>"{td}"<relationship_type>"{td}"<target_entity>"{td}"<relationship_description>"{td}<relationship_strength>)

RULES:
- entity_name must appear in the text or be clearly inferred from it
- entity_type is free-form; pick the most precise type that fits
- source_entity and target_entity must be names from step 1, unchanged
- relationship_strength is a non-negative number
- Write every record on its own line and separate records with {rd}
- When finished, output {cd}

EXAMPLE:
("entity"{td}"Taylor"{td}"person"{td}"Taylor shows reverence towards a device."){rd}
("entity"{td}"The Device"{td}"technology"{td}"The Device could change the game."){rd}
("relationship"{td}"Taylor"{td}"study"{td}"The Device"{td}"Taylor studies the device closely."{td}9){cd}

TEXT:
{text}

OUTPUT:"#,
        td = TUPLE_DELIMITER,
        rd = RECORD_DELIMITER,
        cd = COMPLETION_DELIMITER,
        text = chunk_text
    )
}

pub fn build_confirmation_prompt(pairs: &[CandidatePair]) -> String {
    let formatted_pairs: Vec<String> = pairs
        .iter()
        .enumerate()
        .map(|(idx, pair)| {
            format!(
                r#"{}. Entity 1: "{}" (details: {}; {}) | Entity 2: "{}" (details: {}; {})"#,
                idx + 1,
                pair.left.name,
                pair.left.entity_type,
                pair.left.description,
                pair.right.name,
                pair.right.entity_type,
                pair.right.description,
            )
        })
        .collect();

    format!(
        r#"You are an entity resolution expert. For each pair below, decide whether both
entities refer to the same real-world entity, using their names, types and descriptions.

PAIRS:
{}

RULES:
1. Return a single Python list of booleans (True or False).
2. The list must contain exactly one value per pair, in the same order.
3. Output nothing except the list: no explanation, no prefix.

EXAMPLE:
1. Entity 1: "苹果公司" (details: Company; maker of the iPhone) | Entity 2: "Apple Inc." (details: Company; American technology company)
2. Entity 1: "Amazon" (details: Company; online retailer) | Entity 2: "Amazon River" (details: Location; river in South America)
Output:
[True, False]

OUTPUT:"#,
        formatted_pairs.join("\n")
    )
}
