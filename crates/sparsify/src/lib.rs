pub mod provenance;
pub mod pruning;

pub use provenance::ProvenanceMap;
pub use pruning::{PruningPolicy, SparsityReport, UnknownPolicy};
