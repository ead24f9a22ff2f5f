pub mod embeddings;
pub mod graph_document;
pub mod store;
pub mod neo4j_store;
pub mod writer;

pub use embeddings::EmbeddingClient;
pub use graph_document::{GraphDocument, GraphNode, GraphRelationship, NodeCache, SourceRef};
pub use store::GraphStore;
pub use neo4j_store::{GraphStats, Neo4jStore};
pub use writer::{GraphWriter, WriteReport};
