pub mod aggregator;
pub mod backoff;
pub mod changes;
pub mod differ;
pub mod engine;
pub mod fingerprint;
pub mod fingerprint_db;
pub mod roots;
pub mod runner;
pub mod tree_watcher;

pub use engine::{CycleOutcome, EngineError, EngineOptions, SyncEngine};
pub use runner::{CycleFailure, StartError, SyncHandle, SyncOptions, start_sync};
