//! Scheduler module
//!
//! The dispatch loop and the retry delay policy it applies.

mod dispatcher;
mod retry;

pub use dispatcher::{DispatchSettings, Dispatcher, JobOutcome, TickOutcome};
pub use retry::{ParseRetryPolicyError, RetryPolicy};
