//! Shared Tidemark model types.
//!
//! Pure data types for job specifications, extraction windows, run records,
//! and compute-job manifests. Kept free of I/O so the state and engine
//! crates can share them without circular dependencies.

pub mod error;
pub mod job;
pub mod manifest;
pub mod run;
pub mod source;
pub mod target;

pub use error::RunError;
pub use job::{BehaviorSpec, JobName, JobSpec, RetryPolicy};
pub use run::{RunRecord, RunState, Window};
pub use source::{TaskSpec, WindowExpansion};
pub use target::{LoadMethod, TargetSpec};
