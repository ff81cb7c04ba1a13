//! Request handlers.
//!
//! The bridge hands every accepted request to one `RouteHandler`. The
//! usual handler is an `IntentRouter`, which maps `intent` names to the
//! handlers registered for them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use flexmidi_core::{CommandEnvelope, Reply};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no route for intent {0:?}")]
    NotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },
}

/// Handles one request and produces its final reply.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, env: &CommandEnvelope) -> Result<Reply, DispatchError>;
}

/// Dispatches by `intent`.
#[derive(Default, Clone)]
pub struct IntentRouter {
    routes: HashMap<String, Arc<dyn RouteHandler>>,
}

impl IntentRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration for the same intent replaces
    /// the earlier one.
    pub fn register(&mut self, intent: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        let intent = intent.into();
        if self.routes.insert(intent.clone(), handler).is_some() {
            tracing::debug!(intent = %intent, "route replaced");
        }
    }

    pub fn route(mut self, intent: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        self.register(intent, handler);
        self
    }

    pub fn intents(&self) -> Vec<&str> {
        let mut intents: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        intents.sort_unstable();
        intents
    }
}

#[async_trait]
impl RouteHandler for IntentRouter {
    async fn handle(&self, env: &CommandEnvelope) -> Result<Reply, DispatchError> {
        let Some(handler) = self.routes.get(&env.intent) else {
            return Err(DispatchError::NotFound(env.intent.clone()));
        };
        handler.handle(env).await
    }
}

/// Adapts an async closure into a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> RouteHandler for FnHandler<F>
where
    F: Fn(CommandEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Reply, DispatchError>> + Send,
{
    async fn handle(&self, env: &CommandEnvelope) -> Result<Reply, DispatchError> {
        (self.0)(env.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RouteHandler>
where
    F: Fn(CommandEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, DispatchError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Replies success to anything.
pub struct PingHandler;

#[async_trait]
impl RouteHandler for PingHandler {
    async fn handle(&self, env: &CommandEnvelope) -> Result<Reply, DispatchError> {
        tracing::debug!(corr = %env.corr, "ping");
        Ok(Reply::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexmidi_core::JsonValue;

    fn env(intent: &str) -> CommandEnvelope {
        CommandEnvelope::new("c1", intent, JsonValue::Null)
    }

    #[tokio::test]
    async fn router_dispatches_by_intent() {
        let router = IntentRouter::new()
            .route("ping", Arc::new(PingHandler))
            .route(
                "fail",
                handler_fn(|_| async { Err(DispatchError::InvalidParams("missing model".into())) }),
            );

        assert_eq!(router.handle(&env("ping")).await, Ok(Reply::success()));
        assert_eq!(
            router.handle(&env("fail")).await,
            Err(DispatchError::InvalidParams("missing model".into()))
        );
        assert_eq!(router.intents(), vec!["fail", "ping"]);
    }

    #[tokio::test]
    async fn unknown_intent_is_not_found() {
        let router = IntentRouter::new();
        let err = router.handle(&env("llm.chat")).await.unwrap_err();
        assert_eq!(err, DispatchError::NotFound("llm.chat".into()));
        assert_eq!(err.to_string(), "no route for intent \"llm.chat\"");
    }

    #[tokio::test]
    async fn closure_handler_sees_body() {
        let echo = handler_fn(|env: CommandEnvelope| async move {
            match env.body.get("n").and_then(JsonValue::as_f64) {
                Some(n) => Ok(Reply::success().with_progress(n)),
                None => Err(DispatchError::Server {
                    code: 500,
                    message: "no n".into(),
                }),
            }
        });
        let body = JsonValue::object([("n", JsonValue::from(1u64))]);
        let reply = echo
            .handle(&CommandEnvelope::new("c", "echo", body))
            .await
            .unwrap();
        assert_eq!(reply.progress, Some(1.0));
    }
}
