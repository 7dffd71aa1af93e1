//! In-process executors: [`EchoExecutor`] and [`FnExecutor`].

use super::{ExecutionContext, ExecutionError, ExecutionOutput, ThoughtExecutor};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Returns its bound inputs as a JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl ThoughtExecutor for EchoExecutor {
    async fn run(&self, ctx: ExecutionContext) -> Result<ExecutionOutput, ExecutionError> {
        Ok(ExecutionOutput::value(Value::Object(ctx.inputs)))
    }
}

type Handler =
    Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<ExecutionOutput, ExecutionError>> + Send + Sync>;

/// Routes body references to registered async closures.
///
/// # Example
///
/// ```rust
/// use thought_orchestrator::sandbox::{ExecutionOutput, FnExecutor};
/// use serde_json::json;
///
/// let executor = FnExecutor::new().with_handler("upper", |ctx| async move {
///     let text = ctx.inputs.get("text").and_then(|v| v.as_str()).unwrap_or_default();
///     Ok(ExecutionOutput::value(json!({ "text": text.to_uppercase() })))
/// });
/// assert!(executor.handles("upper"));
/// ```
#[derive(Clone, Default)]
pub struct FnExecutor {
    handlers: HashMap<String, Handler>,
}

impl fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bodies: Vec<&String> = self.handlers.keys().collect();
        bodies.sort();
        f.debug_struct("FnExecutor").field("bodies", &bodies).finish()
    }
}

impl FnExecutor {
    /// An executor with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for body reference `body`, replacing any previous one.
    pub fn with_handler<F, Fut>(mut self, body: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionOutput, ExecutionError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.insert(body.into(), handler);
        self
    }

    /// Whether a handler exists for `body`.
    pub fn handles(&self, body: &str) -> bool {
        self.handlers.contains_key(body)
    }
}

#[async_trait]
impl ThoughtExecutor for FnExecutor {
    async fn run(&self, ctx: ExecutionContext) -> Result<ExecutionOutput, ExecutionError> {
        let Some(handler) = self.handlers.get(&ctx.body).cloned() else {
            return Err(ExecutionError::Permanent(format!(
                "no handler for body '{}'",
                ctx.body
            )));
        };
        handler(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeId, RunId};
    use crate::sandbox::{CancelSignal, SandboxGrant};
    use crate::thought::ThoughtId;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn ctx(body: &str) -> ExecutionContext {
        let thought = ThoughtId::new("t", 1);
        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(2));
        ExecutionContext {
            run_id: RunId::new(),
            node: NodeId::new("n"),
            thought: thought.clone(),
            body: body.to_string(),
            inputs,
            attempt: 1,
            grant: SandboxGrant::new(thought, [], Duration::from_secs(1)),
            cancel: CancelSignal::never(),
        }
    }

    #[tokio::test]
    async fn test_echo_returns_inputs() {
        let out = EchoExecutor.run(ctx("any")).await.expect("echo");
        assert_eq!(out.value, json!({"x": 2}));
        assert!(out.proposals.is_empty());
    }

    #[tokio::test]
    async fn test_fn_executor_routes_by_body() {
        let executor = FnExecutor::new()
            .with_handler("double", |ctx| async move {
                let x = ctx.inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
                Ok(ExecutionOutput::value(json!({"y": x * 2})))
            })
            .with_handler("fail", |_| async { Err(ExecutionError::Transient("flaky".into())) });
        assert_eq!(
            executor.run(ctx("double")).await.expect("double").value,
            json!({"y": 4})
        );
        assert_eq!(
            executor.run(ctx("fail")).await.unwrap_err(),
            ExecutionError::Transient("flaky".into())
        );
    }

    #[tokio::test]
    async fn test_fn_executor_unknown_body_is_permanent() {
        let err = FnExecutor::new().run(ctx("nope")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Permanent(_)));
    }
}
