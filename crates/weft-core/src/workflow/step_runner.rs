//! The contract between the engine and external step implementations.
//!
//! Leaf steps (`python`, `agent`, `generate`) and validate stages are handed
//! to a [`StepExecutor`] registered under the component name. The engine
//! owns everything else: templating, timeouts, retries and checkpointing.
//!
//! Follows the usual RPITIT + boxed-wrapper split:
//! 1. `StepExecutor` is the ergonomic trait implementors write against
//! 2. `StepExecutorDyn` is its object-safe twin, blanket-implemented
//! 3. `BoxStepExecutor` is the cloneable handle stored in the registry

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invocation and errors
// ---------------------------------------------------------------------------

/// Everything an executor is told about one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepInvocation {
    pub run_id: Uuid,
    /// Step name as written in the definition.
    pub step: String,
    /// Namespaced checkpoint key, e.g. `fanout[2]/fetch`.
    pub step_key: String,
    /// Step kind tag (`python`, `agent`, `generate`, or `validate` for stages).
    pub kind: &'static str,
    /// Registered component name (action, agent or generator).
    pub component: String,
    /// Rendered arguments (`args` or `context`).
    pub arguments: Value,
    /// 1-based attempt number; only validate steps go past 1.
    pub attempt: u32,
    /// The failure being corrected, set for `on_failure` steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Errors an executor may return.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    /// The executor observed cancellation and stopped.
    #[error("cancelled")]
    Cancelled,

    /// Rendered with its whole context chain, outermost first.
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// An external step implementation.
///
/// The returned value is stored verbatim as the step output. Long-running
/// executors should watch `cancel` and return [`StepError::Cancelled`].
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        invocation: StepInvocation,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        invocation: StepInvocation,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        invocation: StepInvocation,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(self.execute(invocation, cancel))
    }
}

/// Type-erased, cheaply cloneable executor handle.
#[derive(Clone)]
pub struct BoxStepExecutor {
    inner: Arc<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub async fn execute(
        &self,
        invocation: StepInvocation,
        cancel: CancellationToken,
    ) -> Result<Value, StepError> {
        self.inner.execute_boxed(invocation, cancel).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxStepExecutor")
    }
}

// ---------------------------------------------------------------------------
// Closure adapter
// ---------------------------------------------------------------------------

/// Adapts an async closure into a [`StepExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> StepExecutor for FnExecutor<F>
where
    F: Fn(StepInvocation, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    fn execute(
        &self,
        invocation: StepInvocation,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, StepError>> + Send {
        (self.f)(invocation, cancel)
    }
}

/// Box an async closure as an executor.
///
/// ```ignore
/// let echo = executor_fn(|inv, _cancel| async move { Ok(inv.arguments["text"].clone()) });
/// ```
pub fn executor_fn<F, Fut>(f: F) -> BoxStepExecutor
where
    F: Fn(StepInvocation, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    BoxStepExecutor::new(FnExecutor { f })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(arguments: Value) -> StepInvocation {
        StepInvocation {
            run_id: Uuid::now_v7(),
            step: "hello".to_string(),
            step_key: "hello".to_string(),
            kind: "python",
            component: "echo".to_string(),
            arguments,
            attempt: 1,
            last_error: None,
        }
    }

    struct Upper;

    impl StepExecutor for Upper {
        async fn execute(
            &self,
            invocation: StepInvocation,
            _cancel: CancellationToken,
        ) -> Result<Value, StepError> {
            let text = invocation.arguments["text"]
                .as_str()
                .ok_or_else(|| StepError::failed("text must be a string"))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_boxed_struct_executor() {
        let executor = BoxStepExecutor::new(Upper);
        let out = executor
            .execute(invocation(json!({"text": "ava"})), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!("AVA"));

        let err = executor
            .execute(invocation(json!({"text": 1})), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "text must be a string");
    }

    #[tokio::test]
    async fn test_closure_executor() {
        let echo = executor_fn(|inv, _cancel| async move { Ok(inv.arguments["text"].clone()) });
        let out = echo
            .execute(invocation(json!({"text": "Ava"})), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!("Ava"));
    }

    #[tokio::test]
    async fn test_closure_observes_cancellation() {
        let waiter = executor_fn(|_inv, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err(StepError::Cancelled)
        });
        let token = CancellationToken::new();
        token.cancel();
        let err = waiter.execute(invocation(json!({})), token).await.unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
    }

    #[test]
    fn test_anyhow_error_converts() {
        let err: StepError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");

        let err: StepError = anyhow::anyhow!("disk full").context("write failed").into();
        assert_eq!(err.to_string(), "write failed: disk full");
    }
}
