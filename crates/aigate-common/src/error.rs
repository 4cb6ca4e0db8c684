use std::fmt;
use std::sync::Arc;

/// Errors that escape to callers of the engine.
///
/// Cache outages and rate-limit exhaustion are absorbed internally and never
/// show up here. The type is `Clone` because one settled execution fans its
/// outcome out to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// The request was still queued when its timeout elapsed.
    #[error("request timed out after {waited_ms}ms in the admission queue")]
    QueueTimeout { waited_ms: u64 },

    /// The request was still queued when the engine shut down.
    #[error("engine is shutting down")]
    Shutdown,

    /// The provider executor failed. Display and source are the executor's own.
    #[error(transparent)]
    Executor(ExecutorFailure),

    /// The shared execution outlived the dedup staleness threshold.
    #[error("shared execution went stale after {age_ms}ms")]
    StaleDedup { age_ms: u64 },

    /// The shared execution ended without publishing an outcome.
    #[error("shared execution ended without a result")]
    Abandoned,
}

impl GateError {
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::QueueTimeout { .. } => "queue_timeout",
            GateError::Shutdown => "shutdown",
            GateError::Executor(_) => "executor",
            GateError::StaleDedup { .. } => "stale_dedup",
            GateError::Abandoned => "abandoned",
        }
    }

    /// The executor's original error, if this is an executor failure.
    pub fn executor_error(&self) -> Option<&anyhow::Error> {
        match self {
            GateError::Executor(failure) => Some(failure.inner()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        GateError::Executor(ExecutorFailure::from(err))
    }
}

/// A shareable handle to an executor's error.
#[derive(Clone)]
pub struct ExecutorFailure(Arc<anyhow::Error>);

impl ExecutorFailure {
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for ExecutorFailure {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Debug for ExecutorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ExecutorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for ExecutorFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct ProviderDown(u16);

    impl fmt::Display for ProviderDown {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "provider returned {}", self.0)
        }
    }

    impl std::error::Error for ProviderDown {}

    #[test]
    fn test_executor_error_is_not_rewrapped() {
        let err: GateError = anyhow::Error::new(ProviderDown(503)).into();
        assert_eq!(err.to_string(), "provider returned 503");
        assert_eq!(err.kind(), "executor");

        let cloned = err.clone();
        let GateError::Executor(failure) = cloned else {
            panic!("expected executor failure");
        };
        assert_eq!(failure.downcast_ref::<ProviderDown>().map(|e| e.0), Some(503));
    }

    #[test]
    fn test_queue_timeout_message() {
        let err = GateError::QueueTimeout { waited_ms: 250 };
        assert_eq!(
            err.to_string(),
            "request timed out after 250ms in the admission queue"
        );
        assert!(err.executor_error().is_none());
    }
}
