//! TaskGrid 客户端
//!
//! ```no_run
//! use taskgrid_client::{GridClient, Job};
//! use taskgrid_core::models::TaskEnvelope;
//!
//! # async fn run() -> taskgrid_core::GridResult<()> {
//! let client = GridClient::connect("127.0.0.1:11111").await?;
//! let job = Job::new("hello")
//!     .with_task(TaskEnvelope::new("echo", b"hello".to_vec()))
//!     .with_task(TaskEnvelope::new("echo", b"world".to_vec()));
//! let results = client.submit(&job).await?.await_results().await?;
//! assert_eq!(results.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod job;
pub mod persistence;

pub use client::{GridClient, JobHandle};
pub use job::Job;
pub use persistence::{JobPersistence, MemoryJobPersistence, PersistedJob};
