//! Watermark and run-history persistence for the Tidemark engine.
//!
//! Provides the [`WatermarkStore`] trait and a [`SqliteWatermarkStore`]
//! implementation. Watermarks are the per-job incremental cursors; they are
//! read before each run and advanced, monotonically, only after a run fully
//! commits.

#![warn(clippy::pedantic)]

pub mod error;
pub mod sqlite;
pub mod store;

pub use error::StateError;
pub use sqlite::SqliteWatermarkStore;
pub use store::{RunRow, Watermark, WatermarkStore};
