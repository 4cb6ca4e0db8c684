pub mod queue;
pub mod rate_limiter;
pub mod stats;

pub use queue::{AdmissionQueue, Ticket};
pub use rate_limiter::{RateLimiters, TokenBucket};
pub use stats::{QueueStats, RollingWindow, ROLLING_WINDOW};
