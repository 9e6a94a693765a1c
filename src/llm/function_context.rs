//! Function-calling (tool) definitions and execution.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A function call requested by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallInfo {
    /// Provider-assigned id linking the call to its result.
    pub tool_call_id: String,
    /// Function name.
    pub name: String,
    /// Raw JSON argument string as received.
    pub raw_arguments: String,
    /// Parsed arguments.
    pub arguments: serde_json::Value,
}

/// The outcome of executing one requested function call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalledFunction {
    /// The call that was executed.
    pub call_info: FunctionCallInfo,
    /// Returned value, when the function succeeded and produced one.
    pub result: Option<serde_json::Value>,
    /// Error description, when user code failed.
    pub error: Option<String>,
}

impl CalledFunction {
    /// Whether this call produced neither a value nor an error.
    ///
    /// Such calls are skipped when building tool-result messages.
    pub fn is_void(&self) -> bool {
        self.result.is_none() && self.error.is_none()
    }
}

/// Async handler backing an [`AiFunction`].
pub type FunctionHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<Option<serde_json::Value>, String>>
        + Send
        + Sync,
>;

/// A callable function the LLM may invoke.
#[derive(Clone)]
pub struct AiFunction {
    /// Function name as presented to the LLM.
    pub name: String,
    /// Description steering when the LLM calls it.
    pub description: String,
    /// JSON Schema of the arguments.
    pub parameters: serde_json::Value,
    handler: FunctionHandler,
}

impl AiFunction {
    /// Define a function.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        handler: FunctionHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler,
        }
    }
}

impl fmt::Debug for AiFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiFunction")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Registry of functions available to the LLM for one conversation.
#[derive(Debug, Clone, Default)]
pub struct FunctionContext {
    functions: HashMap<String, AiFunction>,
}

impl FunctionContext {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function, replacing any previous one with the same name.
    pub fn register(&mut self, function: AiFunction) -> &mut Self {
        self.functions.insert(function.name.clone(), function);
        self
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&AiFunction> {
        self.functions.get(name)
    }

    /// All registered functions, for building provider tool definitions.
    pub fn functions(&self) -> impl Iterator<Item = &AiFunction> {
        self.functions.values()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether no functions are registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Execute one requested call.
    ///
    /// User-code failures are captured in the returned [`CalledFunction`],
    /// never propagated; execution of remaining tools continues at the call
    /// site.
    pub async fn execute(&self, call: &FunctionCallInfo) -> CalledFunction {
        debug!(function = %call.name, "executing ai function");
        let Some(function) = self.functions.get(&call.name) else {
            return CalledFunction {
                call_info: call.clone(),
                result: None,
                error: Some(format!("unknown function '{}'", call.name)),
            };
        };

        match (function.handler)(call.arguments.clone()).await {
            Ok(result) => CalledFunction {
                call_info: call.clone(),
                result,
                error: None,
            },
            Err(error) => CalledFunction {
                call_info: call.clone(),
                result: None,
                error: Some(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: serde_json::Value) -> FunctionCallInfo {
        FunctionCallInfo {
            tool_call_id: "call_1".into(),
            name: name.into(),
            raw_arguments: args.to_string(),
            arguments: args,
        }
    }

    fn echo_function() -> AiFunction {
        AiFunction::new(
            "echo",
            "Echo the input back",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            Arc::new(|args| Box::pin(async move { Ok(Some(args)) })),
        )
    }

    #[tokio::test]
    async fn executes_registered_function() {
        let mut ctx = FunctionContext::new();
        ctx.register(echo_function());

        let executed = ctx.execute(&call("echo", json!({"text": "hi"}))).await;
        assert_eq!(executed.result, Some(json!({"text": "hi"})));
        assert!(executed.error.is_none());
    }

    #[tokio::test]
    async fn unknown_function_reports_error() {
        let ctx = FunctionContext::new();
        let executed = ctx.execute(&call("missing", json!({}))).await;
        assert!(executed.result.is_none());
        assert!(executed.error.is_some());
    }

    #[tokio::test]
    async fn user_code_error_is_captured() {
        let mut ctx = FunctionContext::new();
        ctx.register(AiFunction::new(
            "boom",
            "Always fails",
            json!({}),
            Arc::new(|_| Box::pin(async { Err("exploded".to_string()) })),
        ));
        let executed = ctx.execute(&call("boom", json!({}))).await;
        assert_eq!(executed.error.as_deref(), Some("exploded"));
        assert!(!executed.is_void());
    }

    #[tokio::test]
    async fn void_results_are_marked() {
        let mut ctx = FunctionContext::new();
        ctx.register(AiFunction::new(
            "fire_and_forget",
            "Returns nothing",
            json!({}),
            Arc::new(|_| Box::pin(async { Ok(None) })),
        ));
        let executed = ctx.execute(&call("fire_and_forget", json!({}))).await;
        assert!(executed.is_void());
    }
}
