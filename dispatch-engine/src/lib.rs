pub mod engine;
pub mod health;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use engine::DispatchEngine;
pub use health::HealthMonitor;
pub use retry::{AttemptClass, RetryPolicy};
pub use store::{InsertOutcome, MemoryRecordStore, PgRecordStore, RecordStore};
