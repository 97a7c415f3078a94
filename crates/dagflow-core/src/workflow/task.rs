//! Task handler trait, object-safe wrapper, and the name-indexed registry.
//!
//! Every step type the engine does not handle itself is delegated to a
//! `TaskHandler` registered under that type tag. Handlers see a read-only
//! `TaskContext` and return a `TaskOutcome`; `success = false` is treated
//! exactly like an `Err` for retry purposes.
//!
//! Follows the RPITIT + blanket-impl pattern:
//! 1. `TaskHandler` uses `impl Future` returns
//! 2. `TaskHandlerDyn` is the object-safe twin with boxed futures
//! 3. `BoxTaskHandler` wraps `Box<dyn TaskHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use dagflow_types::retry::ErrorKind;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::retry::{RetryableError, classify_message};

// ---------------------------------------------------------------------------
// Outcome and error
// ---------------------------------------------------------------------------

/// What a task handler reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    /// Opaque state persisted by the engine and handed back on re-run.
    pub conversation_state: Option<Value>,
}

impl TaskOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            conversation_state: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            conversation_state: None,
        }
    }

    pub fn with_conversation_state(mut self, state: Value) -> Self {
        self.conversation_state = Some(state);
        self
    }
}

/// A failed step attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify the kind from the message text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_message(&message),
            message,
        }
    }

    pub fn timeout(step_id: &str, secs: f64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("step '{step_id}' timed out after {secs}s"),
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }
}

impl RetryableError for TaskError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn message(&self) -> String {
        self.message.clone()
    }
}

// ---------------------------------------------------------------------------
// Context view
// ---------------------------------------------------------------------------

/// Read-only view of the execution handed to a task handler.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
    pub step_type: String,
    /// Outputs of steps finished so far, keyed by step ID.
    pub step_outputs: HashMap<String, Value>,
    pub variables: Map<String, Value>,
    pub trigger_payload: Option<Value>,
    pub loop_item: Option<Value>,
    pub loop_index: Option<usize>,
    /// State this handler returned on a previous run of the same step.
    pub conversation_state: Option<Value>,
    /// 0-based attempt number within the current retry sequence.
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// TaskHandler
// ---------------------------------------------------------------------------

/// Externally implemented unit of work for one step type.
pub trait TaskHandler: Send + Sync {
    fn execute(
        &self,
        config: &Value,
        context: &TaskContext,
    ) -> impl Future<Output = Result<TaskOutcome, TaskError>> + Send;
}

/// Object-safe version of [`TaskHandler`] with boxed futures.
pub trait TaskHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        config: &'a Value,
        context: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome, TaskError>> + Send + 'a>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        config: &'a Value,
        context: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome, TaskError>> + Send + 'a>> {
        Box::pin(self.execute(config, context))
    }
}

/// Type-erased task handler.
pub struct BoxTaskHandler {
    inner: Box<dyn TaskHandlerDyn + Send + Sync>,
}

impl BoxTaskHandler {
    pub fn new<T: TaskHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn execute(
        &self,
        config: &Value,
        context: &TaskContext,
    ) -> Result<TaskOutcome, TaskError> {
        self.inner.execute_boxed(config, context).await
    }
}

/// Adapts a closure into a [`TaskHandler`].
///
/// The closure receives owned copies so the returned future can be `'static`.
pub struct FnTask<F>(pub F);

impl<F, Fut> TaskHandler for FnTask<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskOutcome, TaskError>> + Send,
{
    fn execute(
        &self,
        config: &Value,
        context: &TaskContext,
    ) -> impl Future<Output = Result<TaskOutcome, TaskError>> + Send {
        (self.0)(config.clone(), context.clone())
    }
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// Registry of task handlers, indexed by step type.
pub struct TaskRegistry {
    handlers: HashMap<String, BoxTaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a step type, replacing any existing one.
    pub fn register<T: TaskHandler + 'static>(&mut self, step_type: impl Into<String>, handler: T) {
        self.handlers
            .insert(step_type.into(), BoxTaskHandler::new(handler));
    }

    /// Look up the handler for a step type.
    pub fn lookup(&self, step_type: &str) -> Option<&BoxTaskHandler> {
        self.handlers.get(step_type)
    }

    /// All registered step types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
