//! Ingestion run orchestration: bounded per-file workers and the merge step

pub mod coordinator;
pub mod scheduler;
pub mod worker;

pub use coordinator::{Coordinator, IngestConfigBuilder};
