//! Tool-call surface: one `shell` tool with an `action` discriminator.

use std::collections::HashMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use shellpool_sandbox::Sandbox;
use tokio_util::sync::CancellationToken;

use crate::error::ShellError;
use crate::executor::{ExecOutcome, ExecRequest, ShellExecutor};
use crate::handlers::{KillOutcome, SendOutcome, WaitOutcome};

pub const TOOL_ID: &str = "shell";

const TOOL_DESCRIPTION: &str = "Run commands in persistent shell sessions. \
`exec` runs a command and waits up to timeout_secs; a command still running \
afterwards keeps running and can be resumed with `wait`. `send` types input or \
a control key (C-c, C-d, C-z, escape, enter, tab, up, down) into a running \
command. `kill` ends a session.";

/// Structured tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub tool_id: String,
    pub params: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ToolDef {
    pub id: &'static str,
    pub description: &'static str,
    pub schema: schemars::Schema,
}

fn default_newline() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ShellAction {
    /// Run a command in a persistent session.
    Exec {
        command: String,
        /// Seconds to wait before returning with `timed_out`; the command keeps running.
        #[serde(default)]
        timeout_secs: Option<u64>,
        /// Session label; sessions with the same label share shell state.
        #[serde(default)]
        session: Option<String>,
    },
    /// Wait for the command still running in a session.
    Wait {
        session_id: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Send text or a named control key to the running command.
    Send {
        session_id: String,
        input: String,
        #[serde(default = "default_newline")]
        newline: bool,
    },
    /// Terminate a session and everything running in it.
    Kill { session_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    pub error: bool,
    pub kind: &'static str,
    pub message: String,
}

impl From<&ShellError> for ErrorReply {
    fn from(e: &ShellError) -> Self {
        Self {
            error: true,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ShellReply {
    Exec(ExecOutcome),
    Wait(WaitOutcome),
    Send(SendOutcome),
    Kill(KillOutcome),
    Error(ErrorReply),
}

impl ShellReply {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "error": true, "kind": "internal", "message": e.to_string() })
        })
    }
}

fn deserialize_params(params: &HashMap<String, serde_json::Value>) -> Result<ShellAction, ShellError> {
    let obj =
        serde_json::Value::Object(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    serde_json::from_value(obj).map_err(|e| ShellError::InvalidParams {
        message: e.to_string(),
    })
}

/// The `shell` tool. Failures are reported as [`ErrorReply`] values, never raised.
pub struct ShellTool<S> {
    executor: Arc<ShellExecutor<S>>,
}

impl<S> std::fmt::Debug for ShellTool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellTool")
            .field("executor", &self.executor)
            .finish()
    }
}

impl<S: Sandbox> ShellTool<S> {
    #[must_use]
    pub fn new(executor: Arc<ShellExecutor<S>>) -> Self {
        Self { executor }
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<ShellExecutor<S>> {
        &self.executor
    }

    #[must_use]
    pub fn definition() -> ToolDef {
        ToolDef {
            id: TOOL_ID,
            description: TOOL_DESCRIPTION,
            schema: schemars::schema_for!(ShellAction),
        }
    }

    /// Execute a structured tool call. Calls for other tools are rejected as
    /// invalid parameters.
    pub async fn execute_tool_call(&self, call: &ToolCall, cancel: &CancellationToken) -> ShellReply {
        if call.tool_id != TOOL_ID {
            return ShellReply::Error(ErrorReply::from(&ShellError::InvalidParams {
                message: format!("unknown tool: {}", call.tool_id),
            }));
        }
        match deserialize_params(&call.params) {
            Ok(action) => self.dispatch(action, cancel).await,
            Err(e) => ShellReply::Error(ErrorReply::from(&e)),
        }
    }

    pub async fn dispatch(&self, action: ShellAction, cancel: &CancellationToken) -> ShellReply {
        let result = match action {
            ShellAction::Exec {
                command,
                timeout_secs,
                session,
            } => {
                let request = ExecRequest {
                    command,
                    timeout_secs,
                    session,
                };
                self.executor.exec(&request, cancel).await.map(ShellReply::Exec)
            }
            ShellAction::Wait {
                session_id,
                timeout_secs,
            } => self
                .executor
                .wait(&session_id, timeout_secs, cancel)
                .await
                .map(ShellReply::Wait),
            ShellAction::Send {
                session_id,
                input,
                newline,
            } => self
                .executor
                .send(&session_id, &input, newline)
                .await
                .map(ShellReply::Send),
            ShellAction::Kill { session_id } => {
                self.executor.kill(&session_id).await.map(ShellReply::Kill)
            }
        };
        result.unwrap_or_else(|e| {
            tracing::debug!(kind = e.kind(), "shell tool call failed: {e}");
            ShellReply::Error(ErrorReply::from(&e))
        })
    }
}

#[cfg(test)]
mod tests {
    use shellpool_sandbox::MockSandbox;

    use super::*;
    use crate::config::Config;
    use crate::guardrail::GuardrailChecker;
    use crate::registry::SessionRegistry;

    fn tool(sandbox: &MockSandbox) -> ShellTool<MockSandbox> {
        let mut config = Config::default();
        config.shell.poll_interval_ms = 5;
        config.shell.settle_delay_ms = 20;
        let registry =
            SessionRegistry::new("scope", Arc::new(sandbox.clone()), &config).unwrap();
        let executor =
            ShellExecutor::new(Arc::new(registry), GuardrailChecker::with_defaults(), &config);
        ShellTool::new(Arc::new(executor))
    }

    fn call(params: serde_json::Value) -> ToolCall {
        serde_json::from_value(serde_json::json!({ "tool_id": "shell", "params": params }))
            .unwrap()
    }

    #[test]
    fn actions_deserialize() {
        let action: ShellAction =
            serde_json::from_value(serde_json::json!({"action": "send", "session_id": "1", "input": "y"}))
                .unwrap();
        assert_eq!(
            action,
            ShellAction::Send {
                session_id: "1".into(),
                input: "y".into(),
                newline: true,
            }
        );
        let action: ShellAction =
            serde_json::from_value(serde_json::json!({"action": "exec", "command": "ls"})).unwrap();
        assert!(matches!(action, ShellAction::Exec { timeout_secs: None, session: None, .. }));
    }

    #[test]
    fn definition_schema_names_actions() {
        let def = ShellTool::<MockSandbox>::definition();
        assert_eq!(def.id, "shell");
        let schema = serde_json::to_string(&def.schema).unwrap();
        for action in ["exec", "wait", "send", "kill"] {
            assert!(schema.contains(&format!("\"{action}\"")), "missing {action}");
        }
    }

    #[tokio::test]
    async fn exec_reply_shape() {
        let sandbox = MockSandbox::interactive_shell();
        let tool = tool(&sandbox);
        let reply = tool
            .execute_tool_call(
                &call(serde_json::json!({"action": "exec", "command": "echo hi", "timeout_secs": 5})),
                &CancellationToken::new(),
            )
            .await;
        let json = reply.to_json();
        assert_eq!(json["output"], "hi");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["timed_out"], false);
        assert_eq!(json["aborted"], false);
        assert!(json.get("note").is_none());
    }

    #[tokio::test]
    async fn blocked_command_becomes_error_reply() {
        let sandbox = MockSandbox::interactive_shell();
        let tool = tool(&sandbox);
        let reply = tool
            .execute_tool_call(
                &call(serde_json::json!({"action": "exec", "command": "rm -rf /"})),
                &CancellationToken::new(),
            )
            .await;
        assert!(reply.is_error());
        let json = reply.to_json();
        assert_eq!(json["error"], true);
        assert_eq!(json["kind"], "guardrail_blocked");
        assert!(sandbox.calls().is_empty());
    }

    #[tokio::test]
    async fn bad_params_become_error_reply() {
        let sandbox = MockSandbox::interactive_shell();
        let tool = tool(&sandbox);
        let reply = tool
            .execute_tool_call(
                &call(serde_json::json!({"action": "teleport"})),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(reply.to_json()["kind"], "invalid_params");

        let other = ToolCall {
            tool_id: "read".into(),
            params: HashMap::new(),
        };
        let reply = tool.execute_tool_call(&other, &CancellationToken::new()).await;
        assert_eq!(reply.to_json()["kind"], "invalid_params");
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let sandbox = MockSandbox::interactive_shell();
        let tool = tool(&sandbox);
        let reply = tool
            .dispatch(
                ShellAction::Kill {
                    session_id: "4711".into(),
                },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(reply.to_json()["kind"], "session_not_found");
    }
}
