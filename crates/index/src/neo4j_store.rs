use anyhow::{Context, Result};
use async_trait::async_trait;
use ingest::SourceDocument;
use neo4rs::{Graph, Query};
use serde::Serialize;
use tracing::{debug, info};

use crate::graph_document::GraphDocument;
use crate::store::GraphStore;

/// `MERGE` on `Entity.id` and `Document.chunk_id` runs from several transactions at once;
/// only a uniqueness constraint makes Neo4j lock the key so no duplicates appear.
const SCHEMA_STATEMENTS: [(&str, &str); 3] = [
    (
        "Entity.id",
        "CREATE CONSTRAINT entity_id_unique IF NOT EXISTS FOR (e:Entity) REQUIRE e.id IS UNIQUE",
    ),
    (
        "Document.chunk_id",
        "CREATE CONSTRAINT placeholder_chunk_unique IF NOT EXISTS FOR (d:Document) REQUIRE d.chunk_id IS UNIQUE",
    ),
    ("__Chunk__.id", "CREATE INDEX chunk_id_index IF NOT EXISTS FOR (c:`__Chunk__`) ON (c.id)"),
];

pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .with_context(|| format!("Failed to connect to Neo4j at {}", uri))?;
        Ok(Self::new(graph))
    }

    /// Initialize schema: uniqueness constraints for keys written by concurrent batches,
    /// a plain index for chunk lookups
    pub async fn init_schema(&self) -> Result<()> {
        info!("Creating Neo4j constraints and indexes");

        for (target, statement) in SCHEMA_STATEMENTS {
            self.graph
                .run(Query::new(statement.to_string()))
                .await
                .with_context(|| format!("Failed to create schema on {}", target))?;
        }

        info!("Neo4j schema ready");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.graph
            .run(neo4rs::query("RETURN 1"))
            .await
            .context("Neo4j did not answer")?;
        Ok(())
    }

    /// Get graph statistics
    pub async fn get_stats(&self) -> Result<GraphStats> {
        Ok(GraphStats {
            entity_count: self.count("MATCH (e:Entity) RETURN count(e) as count").await?,
            relation_count: self.count("MATCH ()-[r:RELATION]->() RETURN count(r) as count").await?,
            chunk_count: self.count("MATCH (c:`__Chunk__`) RETURN count(c) as count").await?,
        })
    }

    async fn count(&self, statement: &str) -> Result<usize> {
        let mut result = self.graph
            .execute(Query::new(statement.to_string()))
            .await
            .context("Failed to run count query")?;
        let count = match result.next().await? {
            Some(row) => row.get::<i64>("count").unwrap_or(0) as usize,
            None => 0,
        };
        Ok(count)
    }

    async fn run_in_transaction(&self, queries: Vec<Query>) -> Result<()> {
        let mut txn = self.graph
            .start_txn()
            .await
            .context("Failed to start transaction")?;
        txn.run_queries(queries)
            .await
            .context("Failed to run queries")?;
        txn.commit()
            .await
            .context("Failed to commit transaction")?;
        Ok(())
    }
}

fn document_queries(doc: &GraphDocument) -> Vec<Query> {
    let chunk_id = doc.source.chunk_id.clone();
    let mut queries = Vec::with_capacity(1 + doc.nodes.len() + doc.relationships.len());

    queries.push(
        Query::new(
            r#"
            MERGE (d:Document {chunk_id: $chunk_id})
            SET d.text = $text
            "#.to_string()
        )
        .param("chunk_id", chunk_id.clone())
        .param("text", doc.source.text.clone()),
    );

    for node in &doc.nodes {
        queries.push(
            Query::new(
                r#"
                MERGE (e:Entity {id: $id})
                SET e.type = $type,
                    e.description = $description,
                    e.title = $title,
                    e.doc_id = $doc_id
                WITH e
                MATCH (d:Document {chunk_id: $chunk_id})
                MERGE (d)-[:MENTIONS]->(e)
                "#.to_string()
            )
            .param("id", node.id.clone())
            .param("type", node.node_type.clone())
            .param("description", node.description.clone())
            .param("title", node.title.clone())
            .param("doc_id", node.doc_id.clone())
            .param("chunk_id", chunk_id.clone()),
        );
    }

    for rel in &doc.relationships {
        queries.push(
            Query::new(
                r#"
                MATCH (source:Entity {id: $source_id})
                MATCH (target:Entity {id: $target_id})
                MERGE (source)-[r:RELATION {type: $rel_type}]->(target)
                SET r.description = $description,
                    r.weight = $weight
                "#.to_string()
            )
            .param("source_id", rel.source.id.clone())
            .param("target_id", rel.target.id.clone())
            .param("rel_type", rel.rel_type.clone())
            .param("description", rel.description.clone())
            .param("weight", rel.weight),
        );
    }

    queries
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn write_chunk_structure(&self, document: &SourceDocument) -> Result<Vec<String>> {
        let mut queries = Vec::with_capacity(1 + document.chunks.len() * 2);

        queries.push(
            Query::new(
                r#"
                MERGE (d:`__Document__` {fileName: $file_name})
                SET d.doc_id = $doc_id
                "#.to_string()
            )
            .param("file_name", document.filename.clone())
            .param("doc_id", document.doc_id.clone()),
        );

        for chunk in &document.chunks {
            queries.push(
                Query::new(
                    r#"
                    MERGE (c:`__Chunk__` {id: $id})
                    SET c.text = $text,
                        c.title = $title,
                        c.position = $position,
                        c.fileName = $file_name
                    WITH c
                    MATCH (d:`__Document__` {fileName: $file_name})
                    MERGE (c)-[:PART_OF]->(d)
                    "#.to_string()
                )
                .param("id", chunk.chunk_id.clone())
                .param("text", chunk.text.clone())
                .param("title", chunk.title.clone())
                .param("position", chunk.position as i64)
                .param("file_name", document.filename.clone()),
            );
        }

        for pair in document.chunks.windows(2) {
            queries.push(
                Query::new(
                    r#"
                    MATCH (a:`__Chunk__` {id: $previous}), (b:`__Chunk__` {id: $next})
                    MERGE (a)-[:NEXT_CHUNK]->(b)
                    "#.to_string()
                )
                .param("previous", pair[0].chunk_id.clone())
                .param("next", pair[1].chunk_id.clone()),
            );
        }

        self.run_in_transaction(queries)
            .await
            .with_context(|| format!("Failed to write chunk structure for {}", document.filename))?;

        debug!(file_name = %document.filename, chunks = document.chunks.len(), "Chunk structure written");
        Ok(document.chunks.iter().map(|c| c.chunk_id.clone()).collect())
    }

    async fn add_graph_documents(&self, documents: &[GraphDocument]) -> Result<()> {
        let queries: Vec<Query> = documents.iter().flat_map(document_queries).collect();
        self.run_in_transaction(queries)
            .await
            .with_context(|| format!("Failed to write {} graph documents", documents.len()))
    }

    async fn merge_chunk_containers(&self, chunk_ids: &[String]) -> Result<()> {
        let query = Query::new(
            r#"
            UNWIND $chunk_ids AS chunk_id
            MATCH (c:`__Chunk__` {id: chunk_id}), (d:Document {chunk_id: chunk_id})
            WITH c, d
            MATCH (d)-[r:MENTIONS]->(e)
            MERGE (c)-[newR:MENTIONS]->(e)
            ON CREATE SET newR += properties(r)
            DETACH DELETE d
            "#.to_string()
        )
        .param("chunk_ids", chunk_ids.to_vec());

        self.graph.run(query)
            .await
            .with_context(|| format!("Failed to merge {} chunk containers", chunk_ids.len()))?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
    pub chunk_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrently_merged_keys_are_unique_constraints() {
        for key in ["Entity.id", "Document.chunk_id"] {
            let (_, statement) = SCHEMA_STATEMENTS
                .iter()
                .find(|(target, _)| *target == key)
                .unwrap();
            assert!(statement.starts_with("CREATE CONSTRAINT"), "{key}: {statement}");
            assert!(statement.ends_with("IS UNIQUE"), "{key}: {statement}");
        }
    }

    #[test]
    fn test_schema_statements_are_idempotent() {
        assert!(SCHEMA_STATEMENTS.iter().all(|(_, s)| s.contains("IF NOT EXISTS")));
    }
}
