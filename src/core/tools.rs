//! Tool-call dispatch.
//!
//! The session never runs tool logic; it surfaces `ToolCall` batches and
//! expects one `send_tool_response` per batch. [`ToolDispatcher`] is the
//! application-side registry that turns a batch into that response.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::session::{FunctionCall, FunctionResponse};

/// A function the model can call.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Name the function is declared under.
    fn name(&self) -> &str;

    /// Run the function. `Err` is reported back to the model as
    /// `{"error": message}`.
    async fn call(&self, args: Value) -> Result<Value, String>;
}

#[derive(Default, Clone)]
pub struct ToolDispatcher {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register<H: ToolHandler + 'static>(&mut self, handler: H) -> &mut Self {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!("Replacing tool handler '{}'", name);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every call concurrently. Responses come back in call order.
    pub async fn dispatch(&self, calls: Vec<FunctionCall>) -> Vec<FunctionResponse> {
        let futures = calls.into_iter().map(|call| {
            let handler = self.handlers.get(&call.name).cloned();
            async move {
                let Some(handler) = handler else {
                    warn!("No handler for tool '{}'", call.name);
                    return FunctionResponse::error(
                        &call,
                        format!("unknown function: {}", call.name),
                    );
                };
                debug!("Calling tool '{}' ({})", call.name, call.id);
                match handler.call(call.args.clone()).await {
                    Ok(result) => FunctionResponse::result(&call, result),
                    Err(message) => {
                        warn!("Tool '{}' failed: {}", call.name, message);
                        FunctionResponse::error(&call, message)
                    }
                }
            }
        });
        join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(&self, args: Value) -> Result<Value, String> {
            Ok(args)
        }
    }

    /// Sleeps for `args.ms` before answering.
    struct Slow;

    #[async_trait]
    impl ToolHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn call(&self, args: Value) -> Result<Value, String> {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn call(&self, _args: Value) -> Result<Value, String> {
            Err("backend unavailable".to_string())
        }
    }

    fn call(id: &str, name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_keep_call_order() {
        let mut dispatcher = ToolDispatcher::new();
        dispatcher.register(Slow);

        let responses = dispatcher
            .dispatch(vec![
                call("a", "slow", json!({"ms": 300})),
                call("b", "slow", json!({"ms": 10})),
            ])
            .await;

        let ids: Vec<_> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(responses[0].response, json!({"result": 300}));
    }

    #[tokio::test]
    async fn test_errors_become_error_payloads() {
        let mut dispatcher = ToolDispatcher::new();
        dispatcher.register(Echo).register(Failing);
        assert_eq!(dispatcher.len(), 2);

        let responses = dispatcher
            .dispatch(vec![
                call("1", "echo", json!({"q": "rust"})),
                call("2", "failing", Value::Null),
                call("3", "missing", Value::Null),
            ])
            .await;

        assert_eq!(responses[0].response, json!({"result": {"q": "rust"}}));
        assert!(!responses[0].is_error());
        assert_eq!(responses[1].response, json!({"error": "backend unavailable"}));
        assert!(responses[2].is_error());
        assert_eq!(responses[2].name, "missing");
    }
}
