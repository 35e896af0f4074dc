//! Execution contexts that evaluate shell work away from the caller.

pub mod worker;

pub use worker::{Control, EvaluationWorker, WorkerReply};
