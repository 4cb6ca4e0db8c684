pub mod config;
pub mod error;
pub mod executor;
pub mod request;
pub mod response;

pub use config::{EngineConfig, RateLimitConfig};
pub use error::{ExecutorFailure, GateError};
pub use executor::{executor_fn, Executor, FnExecutor};
pub use request::{Priority, Request};
pub use response::{Completion, Response};

pub mod telemetry;

/// Outcome of one logical execution, shared by every party awaiting it.
pub type Outcome = Result<Response, GateError>;
