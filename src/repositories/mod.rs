//! # Repository Layer
//!
//! Repositories encapsulate the SeaORM queries for connections, sync jobs and
//! external mappings, with tenant-aware lookups.

pub mod connection;
pub mod mapping;
pub mod sync_job;

pub use connection::ConnectionRepository;
pub use mapping::{MappingRepository, UpsertOutcome, snapshot_quantity};
pub use sync_job::{JobCounts, JobFilter, SyncJobRepository};
