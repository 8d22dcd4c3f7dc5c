//! Narrow interfaces to external infrastructure.
//!
//! The lifecycle core only ever touches object storage and the dispatch
//! queue through the traits defined here; production backends (S3, SQS, ...)
//! live behind them and are deployment concerns. The in-memory
//! implementations carry the full observable semantics the core relies on -
//! artifact metadata on upload, visibility timeouts on receive - so the
//! whole lifecycle is testable in-process.

pub mod object_store;
pub mod queue;
pub mod s3;
pub mod sqs;

pub use object_store::{
    artifact_key, ArtifactMetadata, InMemoryObjectStore, ObjectStore, ObjectStoreError,
};
pub use queue::{DispatchMessage, DispatchQueue, InMemoryDispatchQueue, QueueError, QueuedMessage};
pub use s3::{S3ObjectStore, S3ObjectStoreConfig};
pub use sqs::{SqsDispatchQueue, SqsDispatchQueueConfig};
