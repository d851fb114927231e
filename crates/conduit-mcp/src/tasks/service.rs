//! Serves the `tasks/*` methods from a [`TaskManager`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::manager::TaskManager;
use super::types::{ListTasksParams, TaskEnvelope, TaskIdParams};
use crate::error::McpError;
use crate::protocol::{JsonRpcError, Message, encode_params, methods};

/// How long `tasks/result` blocks before answering with a timeout error.
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Request handler for `tasks/get`, `tasks/result`, `tasks/list` and `tasks/cancel`.
#[derive(Debug, Clone)]
pub struct TaskService {
    manager: TaskManager,
    result_timeout: Duration,
}

impl TaskService {
    pub fn new(manager: TaskManager) -> Self {
        Self {
            manager,
            result_timeout: DEFAULT_RESULT_TIMEOUT,
        }
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Whether `method` is one of the task methods.
    pub fn handles(method: &str) -> bool {
        matches!(
            method,
            methods::TASKS_GET | methods::TASKS_RESULT | methods::TASKS_LIST | methods::TASKS_CANCEL
        )
    }

    /// Answer a request. Returns `None` for anything that is not a task method request.
    pub async fn handle(&self, request: &Message) -> Option<Message> {
        let method = request.method.as_deref()?;
        if !Self::handles(method) || request.id.is_none() {
            return None;
        }

        let reply = match self.call(method, request.params.clone()).await {
            Ok(result) => Message::response(request.id.clone(), result),
            Err(error) => Message::from_error(request.id.clone(), error),
        };
        Some(reply)
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            methods::TASKS_GET => {
                let p: TaskIdParams = parse_params(params)?;
                let task = self.manager.get_metadata(&p.task_id).map_err(to_rpc_error)?;
                encode(&TaskEnvelope { task })
            }
            methods::TASKS_CANCEL => {
                let p: TaskIdParams = parse_params(params)?;
                let task = self.manager.cancel_task(&p.task_id).map_err(to_rpc_error)?;
                encode(&TaskEnvelope { task })
            }
            methods::TASKS_LIST => {
                let p: ListTasksParams = match params {
                    Some(_) => parse_params(params)?,
                    None => ListTasksParams::default(),
                };
                let page = self
                    .manager
                    .list_tasks(p.cursor.as_deref(), p.limit)
                    .map_err(to_rpc_error)?;
                encode(&page)
            }
            methods::TASKS_RESULT => {
                let p: TaskIdParams = parse_params(params)?;
                match self
                    .manager
                    .wait_for_result(&p.task_id, self.result_timeout)
                    .await
                {
                    Ok(value) => Ok(value),
                    // Tool-reported failures travel as a flagged result, not a protocol error.
                    Err(McpError::TaskFailed {
                        message,
                        tool_error: true,
                        ..
                    }) => Ok(json!({
                        "isError": true,
                        "error": message,
                        "content": [{"type": "text", "text": message}],
                    })),
                    Err(e) => Err(to_rpc_error(e)),
                }
            }
            other => Err(JsonRpcError::new(
                JsonRpcError::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| {
        JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("invalid params: {e}"))
    })
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    encode_params(value).map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
}

/// Map a task error onto a JSON-RPC error object.
pub fn to_rpc_error(err: McpError) -> JsonRpcError {
    let code = match &err {
        McpError::TaskNotFound(_)
        | McpError::TaskTerminal { .. }
        | McpError::InvalidTransition { .. }
        | McpError::Protocol(_) => JsonRpcError::INVALID_PARAMS,
        _ => JsonRpcError::INTERNAL_ERROR,
    };
    JsonRpcError::new(code, err.to_string())
}
