use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{Completion, Request};

/// Performs the actual provider call for one request.
///
/// The engine treats it as opaque, possibly slow and possibly failing work.
/// Retries and transport timeouts are the implementation's business.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: Request) -> anyhow::Result<Completion>;

    /// Human-readable name for logging.
    fn name(&self) -> &'static str {
        "executor"
    }
}

/// Executor backed by an async closure.
pub struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Completion>> + Send,
{
    async fn execute(&self, request: Request) -> anyhow::Result<Completion> {
        (self.f)(request).await
    }

    fn name(&self) -> &'static str {
        "fn"
    }
}

/// Wrap an async closure as a shareable executor.
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn Executor>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Completion>> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_executor_fn_runs_closure() {
        let exec = executor_fn(|req: Request| async move {
            Ok(Completion::new(format!("echo: {}", req.prompt)).with_tokens(2, 3))
        });
        let out = exec
            .execute(Request::new("claude", "m1", "hi"))
            .await
            .unwrap();
        assert_eq!(out.content, "echo: hi");
        assert_eq!(out.output_tokens, 3);
        assert_eq!(exec.name(), "fn");
    }
}
