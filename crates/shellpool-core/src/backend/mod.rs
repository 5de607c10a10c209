//! Uniform create/send/capture/kill contract over native PTYs and tmux.

mod buffer;
pub mod multiplexer;
pub mod native;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shellpool_sandbox::Sandbox;

pub use buffer::OutputBuffer;
pub use multiplexer::MultiplexerBackend;
pub use native::NativePtyBackend;

use crate::config::{BackendChoice, RetryConfig, ShellConfig};
use crate::error::ShellError;
use crate::retry::RetryPolicy;
use crate::sentinel::{Sentinel, extract_completion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Native,
    Multiplexer,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::Multiplexer => "multiplexer",
        })
    }
}

/// Named keys a caller can send instead of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    Interrupt,
    Eof,
    Suspend,
    Escape,
    Enter,
    Tab,
    Up,
    Down,
}

impl ControlKey {
    /// Recognize `C-c`, `ctrl-c`, `^C`, `interrupt` and the like. Case-insensitive.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let key = input.trim().to_ascii_lowercase();
        let key = key
            .strip_prefix("ctrl-")
            .or_else(|| key.strip_prefix("ctrl+"))
            .or_else(|| key.strip_prefix("c-"))
            .or_else(|| key.strip_prefix('^'))
            .map_or(key.clone(), |k| format!("ctrl:{k}"));
        Some(match key.as_str() {
            "ctrl:c" | "interrupt" | "sigint" => Self::Interrupt,
            "ctrl:d" | "eof" => Self::Eof,
            "ctrl:z" | "suspend" => Self::Suspend,
            "escape" | "esc" => Self::Escape,
            "enter" | "return" => Self::Enter,
            "tab" => Self::Tab,
            "up" => Self::Up,
            "down" => Self::Down,
            _ => return None,
        })
    }

    /// Bytes a terminal sends for this key.
    #[must_use]
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Self::Interrupt => b"\x03",
            Self::Eof => b"\x04",
            Self::Suspend => b"\x1a",
            Self::Escape => b"\x1b",
            Self::Enter => b"\r",
            Self::Tab => b"\t",
            Self::Up => b"\x1b[A",
            Self::Down => b"\x1b[B",
        }
    }

    /// Key name understood by `tmux send-keys`.
    #[must_use]
    pub fn tmux_name(self) -> &'static str {
        match self {
            Self::Interrupt => "C-c",
            Self::Eof => "C-d",
            Self::Suspend => "C-z",
            Self::Escape => "Escape",
            Self::Enter => "Enter",
            Self::Tab => "Tab",
            Self::Up => "Up",
            Self::Down => "Down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendInput {
    Text { text: String, newline: bool },
    Key(ControlKey),
}

impl SendInput {
    #[must_use]
    pub fn line(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            newline: true,
        }
    }
}

/// Backend-side identity of one interactive shell.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Pid for native PTYs, session name for tmux.
    pub id: String,
    pub kind: BackendKind,
    pub shell_pid: Option<u32>,
    pub(crate) stream: Option<Arc<OutputBuffer>>,
}

impl SessionHandle {
    /// Output buffer fed by a push stream, if the backend has one.
    #[must_use]
    pub fn stream(&self) -> Option<&Arc<OutputBuffer>> {
        self.stream.as_ref()
    }
}

/// Full scrollback as currently visible, and whether the shell has gone away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub text: String,
    pub ended: bool,
}

pub trait ShellBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start and bootstrap a shell for `label` in the conversation `scope`.
    fn create(
        &self,
        scope: &str,
        label: &str,
    ) -> impl Future<Output = Result<SessionHandle, ShellError>> + Send;

    /// Attach to a shell that already exists on the backend without disturbing it.
    fn attach(
        &self,
        scope: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<Option<SessionHandle>, ShellError>> + Send;

    fn send(
        &self,
        handle: &SessionHandle,
        input: &SendInput,
    ) -> impl Future<Output = Result<(), ShellError>> + Send;

    fn capture(
        &self,
        handle: &SessionHandle,
    ) -> impl Future<Output = Result<Capture, ShellError>> + Send;

    /// Drop accumulated scrollback so a new command starts from a clean baseline.
    fn rebase(&self, handle: &SessionHandle) -> impl Future<Output = Result<(), ShellError>> + Send;

    /// Terminate the shell. Returns `false` if it no longer existed.
    fn kill(&self, handle: &SessionHandle) -> impl Future<Output = Result<bool, ShellError>> + Send;
}

/// Generates a match over all `AnyBackend` variants, binding the inner backend
/// and evaluating the given expression for each arm.
macro_rules! delegate_backend {
    ($self:expr, |$b:ident| $expr:expr) => {
        match $self {
            AnyBackend::Native($b) => $expr,
            AnyBackend::Multiplexer($b) => $expr,
        }
    };
}

pub enum AnyBackend<S> {
    Native(NativePtyBackend<S>),
    Multiplexer(MultiplexerBackend<S>),
}

impl<S> std::fmt::Debug for AnyBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(b) => f.debug_tuple("Native").field(b).finish(),
            Self::Multiplexer(b) => f.debug_tuple("Multiplexer").field(b).finish(),
        }
    }
}

impl<S: Sandbox> AnyBackend<S> {
    /// Pick the backend once, from configuration and sandbox capabilities.
    ///
    /// # Errors
    ///
    /// Returns `ShellError::BackendUnavailable` if a native backend is forced
    /// on a sandbox without PTY support.
    pub fn select(
        sandbox: Arc<S>,
        shell: &ShellConfig,
        retry: &RetryConfig,
    ) -> Result<Self, ShellError> {
        let retry = RetryPolicy::from(retry);
        let native = match shell.backend {
            BackendChoice::Native if !sandbox.supports_pty() => {
                return Err(ShellError::BackendUnavailable {
                    message: "native backend requested but the sandbox has no PTY support".into(),
                });
            }
            BackendChoice::Native => true,
            BackendChoice::Multiplexer => false,
            BackendChoice::Auto => sandbox.supports_pty(),
        };
        let backend = if native {
            Self::Native(NativePtyBackend::new(sandbox, shell, retry))
        } else {
            Self::Multiplexer(MultiplexerBackend::new(sandbox, shell, retry))
        };
        tracing::info!(backend = %backend.kind(), "shell backend selected");
        Ok(backend)
    }
}

impl<S: Sandbox> ShellBackend for AnyBackend<S> {
    fn kind(&self) -> BackendKind {
        delegate_backend!(self, |b| b.kind())
    }

    async fn create(&self, scope: &str, label: &str) -> Result<SessionHandle, ShellError> {
        delegate_backend!(self, |b| b.create(scope, label).await)
    }

    async fn attach(
        &self,
        scope: &str,
        session_id: &str,
    ) -> Result<Option<SessionHandle>, ShellError> {
        delegate_backend!(self, |b| b.attach(scope, session_id).await)
    }

    async fn send(&self, handle: &SessionHandle, input: &SendInput) -> Result<(), ShellError> {
        delegate_backend!(self, |b| b.send(handle, input).await)
    }

    async fn capture(&self, handle: &SessionHandle) -> Result<Capture, ShellError> {
        delegate_backend!(self, |b| b.capture(handle).await)
    }

    async fn rebase(&self, handle: &SessionHandle) -> Result<(), ShellError> {
        delegate_backend!(self, |b| b.rebase(handle).await)
    }

    async fn kill(&self, handle: &SessionHandle) -> Result<bool, ShellError> {
        delegate_backend!(self, |b| b.kill(handle).await)
    }
}

/// Send a bootstrap line followed by a sentinel and wait for the shell to answer.
pub(crate) async fn bootstrap<B: ShellBackend>(
    backend: &B,
    handle: &SessionHandle,
    setup: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), ShellError> {
    let (command, sentinel) = crate::sentinel::build_command(setup);
    backend.send(handle, &SendInput::line(command)).await?;
    if wait_for_sentinel(backend, handle, &sentinel, timeout, poll_interval).await? {
        return Ok(());
    }
    Err(ShellError::BackendUnavailable {
        message: format!(
            "shell in session {} did not become ready within {}s",
            handle.id,
            timeout.as_secs()
        ),
    })
}

async fn wait_for_sentinel<B: ShellBackend>(
    backend: &B,
    handle: &SessionHandle,
    sentinel: &Sentinel,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<bool, ShellError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let capture = backend.capture(handle).await?;
        if extract_completion(&capture.text, sentinel).is_some() {
            return Ok(true);
        }
        if capture.ended || tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".into()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Lines run once in every new shell: no history expansion, no pagers, no
/// control-character echo.
pub(crate) const SHELL_SETUP: &str =
    "set +H 2>/dev/null; stty -echoctl -ixon 2>/dev/null; export PAGER=cat GIT_PAGER=cat HISTFILE=/dev/null";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_key_names() {
        for (input, key) in [
            ("C-c", ControlKey::Interrupt),
            ("ctrl-c", ControlKey::Interrupt),
            ("^C", ControlKey::Interrupt),
            ("interrupt", ControlKey::Interrupt),
            ("c-d", ControlKey::Eof),
            ("EOF", ControlKey::Eof),
            ("ctrl+z", ControlKey::Suspend),
            ("escape", ControlKey::Escape),
            ("Enter", ControlKey::Enter),
            ("tab", ControlKey::Tab),
            ("up", ControlKey::Up),
            ("down", ControlKey::Down),
        ] {
            assert_eq!(ControlKey::parse(input), Some(key), "{input}");
        }
        assert_eq!(ControlKey::parse("y"), None);
        assert_eq!(ControlKey::parse("ls -la"), None);
        assert_eq!(ControlKey::parse("C-q"), None);
    }

    #[test]
    fn control_key_encodings() {
        assert_eq!(ControlKey::Interrupt.bytes(), b"\x03");
        assert_eq!(ControlKey::Eof.tmux_name(), "C-d");
        assert_eq!(ControlKey::Up.bytes(), b"\x1b[A");
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn backend_kind_display() {
        assert_eq!(BackendKind::Native.to_string(), "native");
        assert_eq!(
            serde_json::to_string(&BackendKind::Multiplexer).unwrap(),
            "\"multiplexer\""
        );
    }
}
