//! Infrastructure layer: store backends, configuration, timed writers.

pub mod config;
pub mod context;
pub mod scenario;
pub mod scheduler;
pub mod store;

pub use config::{Backend, StoreConfig};
pub use context::WatchContext;
pub use scenario::{InsertFeedReport, LowStockReport, ScenarioSettings};
pub use scheduler::{BatchReport, ScheduledBatch, WriteOutcome, WriteScheduler, WriteStatus};
pub use store::InMemoryStore;
#[cfg(feature = "mongo")]
pub use store::MongoStore;
