//! Shared building blocks for the differential testing pipeline: the data
//! model, the document store and job queue every process coordinates
//! through, and the retry and start-up plumbing around them.

pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod queue;
pub mod reliability;
pub mod store;
pub mod types;

pub use config::{init_tracing, PipelineArgs};
pub use context::{ephemeral_backing, PipelineContext};
pub use error::{QueueError, StoreError};
pub use queue::{Delivery, JobQueue, SqliteQueue};
pub use reliability::{retry_with_backoff, RetryError, RetryPolicy, Transient};
pub use store::{DocumentStore, SqliteStore};
pub use types::*;
