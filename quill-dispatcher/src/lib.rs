//! Quill Dispatcher
//!
//! Claims jobs from the shared store, resumes them from their checkpoints and
//! drives them through the registered step handlers.
//!
//! - Handler: the step handler contract, registry and remote handler
//! - Scheduler: the dispatch loop and retry policy
//! - Config: environment-driven settings for the dispatcher binary

pub mod config;
pub mod handler;
pub mod scheduler;

pub use config::{Config, StoreBackend};
pub use handler::{HandlerError, HandlerRegistry, StepContext, StepHandler};
pub use scheduler::{DispatchSettings, Dispatcher, RetryPolicy, TickOutcome};
