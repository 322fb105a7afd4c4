//! Job and pipeline persistence.
//!
//! - `r#trait`: the [`JobStore`] abstraction and the polling claim helper
//! - `in_memory`: lock-guarded store for tests/dev
//! - `postgres`: durable store using `FOR UPDATE SKIP LOCKED` claims

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{BULK_CREATE_BATCH_SIZE, Claim, JobStore, JobStoreError, claim_for_processing};
