//! Processing pipeline: state machine, orchestration, retries and the
//! worker pool.

mod orchestrator;
mod rematch;
mod retry;
pub mod state;
mod worker;

pub use orchestrator::{Orchestrator, Outcome, extractor_timeout};
pub use rematch::{Selection, reset, select};
pub use retry::{Backoff, CancelFlag};
pub use worker::{RunSummary, WorkerPool};
