//! tm-db: persistence layer for jobs.
//!
//! This crate provides SQLite-backed storage with connection pooling,
//! embedded migrations, row mapping, and the [`JobStore`] trait the engine
//! talks to, implemented by [`SqliteJobStore`].

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use store::{JobPatch, JobStore, NewJob, SqliteJobStore};
