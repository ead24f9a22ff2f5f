pub mod cache;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod retry;

pub use cache::{CacheStats, CachedEmbedder, ResponseCache};
pub use config::AppConfig;
pub use metrics::{BuildMetrics, BuildStats, MetricsSnapshot, TimedOperation};
pub use pipeline::GraphBuilder;
pub use retry::RetryPolicy;
