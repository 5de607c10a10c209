//! Execution environment abstraction: one-shot shell commands and native PTY sessions.

pub mod error;
#[cfg(feature = "mock")]
mod fake_shell;
pub mod local;
#[cfg(feature = "mock")]
pub mod mock;
mod pty;

use std::time::Duration;

pub use error::{Result, SandboxError};
pub use local::LocalSandbox;
#[cfg(feature = "mock")]
pub use mock::{MockSandbox, SandboxCall};

/// Receives raw output chunks of a one-shot command as they are produced.
pub type ChunkTx = tokio::sync::mpsc::UnboundedSender<String>;

/// Byte stream pushed by a native PTY. Closed when the PTY process exits.
pub type PtyStream = tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>;

#[derive(Debug, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub on_stdout: Option<ChunkTx>,
    pub on_stderr: Option<ChunkTx>,
    /// Detach the command and return as soon as it has been started.
    pub background: bool,
}

impl RunOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct PtyOptions {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl PtyOptions {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cols: 200,
            rows: 50,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug)]
pub struct PtyHandle {
    pub pid: u32,
    pub output: PtyStream,
}

/// Environment in which shell commands and interactive sessions run.
///
/// `run` is the one primitive every sandbox must offer. The `pty_*` family is
/// optional; callers check `supports_pty` before relying on it.
pub trait Sandbox: Send + Sync + 'static {
    fn run(
        &self,
        command: &str,
        options: RunOptions,
    ) -> impl Future<Output = Result<RunOutput>> + Send;

    fn supports_pty(&self) -> bool {
        false
    }

    fn pty_create(&self, _options: PtyOptions) -> impl Future<Output = Result<PtyHandle>> + Send {
        std::future::ready(Err(SandboxError::Unsupported))
    }

    /// Subscribe to a PTY that is already running. The stream starts with the
    /// recent output the PTY produced before the subscription.
    /// Returns `None` when no PTY with that pid exists.
    fn pty_connect(&self, _pid: u32) -> impl Future<Output = Result<Option<PtyStream>>> + Send {
        std::future::ready(Err(SandboxError::Unsupported))
    }

    fn pty_send(&self, _pid: u32, _data: &[u8]) -> impl Future<Output = Result<()>> + Send {
        std::future::ready(Err(SandboxError::Unsupported))
    }

    /// Terminate the PTY process. Returns `false` if it was already gone.
    fn pty_kill(&self, _pid: u32) -> impl Future<Output = Result<bool>> + Send {
        std::future::ready(Err(SandboxError::Unsupported))
    }

    /// Best-effort kill for teardown paths that cannot await. Returns `false`
    /// when nothing was killed.
    fn pty_kill_now(&self, _pid: u32) -> bool {
        false
    }
}
