//! Persistent shell sessions over native PTYs or tmux, with sentinel-based
//! completion detection.

pub mod audit;
pub mod background;
pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod guardrail;
pub mod handlers;
pub mod pid;
pub mod registry;
pub mod retry;
pub mod sanitize;
pub mod sentinel;
pub mod session;
pub mod terminate;
pub mod tool;

pub use audit::{AuditEntry, AuditLogger, AuditResult};
pub use background::{BackgroundProcessRecord, BackgroundTracker};
pub use backend::{AnyBackend, BackendKind, ControlKey, SendInput, SessionHandle, ShellBackend};
pub use config::{
    AuditConfig, BackendChoice, Config, GuardrailConfig, RetryConfig, ShellConfig,
    TerminateConfig,
};
pub use error::ShellError;
pub use event::{ShellEvent, ShellEventTx};
pub use executor::{ExecOutcome, ExecRequest, ShellExecutor};
pub use guardrail::{GuardrailChecker, GuardrailPolicy, Verdict};
pub use handlers::{KillOutcome, SendOutcome, WaitOutcome};
pub use registry::SessionRegistry;
pub use session::{SessionInfo, SessionState};
pub use terminate::{ProcessTerminator, Strategy, Termination};
pub use tool::{ShellAction, ShellReply, ShellTool, ToolCall, ToolDef};
