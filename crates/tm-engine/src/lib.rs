//! tm-engine: the job lifecycle engine.
//!
//! Admission, queueing, worker dispatch under concurrency and rate limits,
//! weighted per-file progress, retry with backoff, and the liveness and
//! retention sweep. [`Engine`] wires the pieces together with an explicit
//! start/shutdown lifecycle.

pub mod admission;
pub mod command;
pub mod engine;
pub mod limiter;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod sweeper;
pub mod tools;
pub mod worker;

pub use admission::{AdmissionPolicy, AdmissionRequest, CallerUsage};
pub use engine::{Engine, EngineConfig, Submission, Upload};
pub use queue::{JobQueue, QueueEntry};
pub use storage::{LocalStorage, Storage, StorageScope};
pub use tools::{ProgressSink, ToolHandler, ToolInput, ToolOutput, ToolRegistry};
