use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shellpool_sandbox::{PtyOptions, PtyStream, Sandbox, SandboxError};

use super::{
    BackendKind, Capture, OutputBuffer, SHELL_SETUP, SendInput, SessionHandle, ShellBackend,
    bootstrap,
};
use crate::config::ShellConfig;
use crate::error::ShellError;
use crate::retry::{RetryPolicy, retry_when, with_backoff};

/// Shells running directly on a sandbox PTY, with output pushed into a buffer.
pub struct NativePtyBackend<S> {
    sandbox: Arc<S>,
    shell: String,
    retry: RetryPolicy,
    bootstrap_timeout: Duration,
    poll_interval: Duration,
}

impl<S> std::fmt::Debug for NativePtyBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePtyBackend")
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

pub(crate) fn is_bash(shell: &str) -> bool {
    Path::new(shell)
        .file_name()
        .is_some_and(|name| name == "bash")
}

async fn pump(mut output: PtyStream, buffer: Arc<OutputBuffer>) {
    while let Some(chunk) = output.recv().await {
        buffer.push(&chunk);
    }
    buffer.close();
}

fn session_pid(handle: &SessionHandle) -> Result<u32, ShellError> {
    handle
        .shell_pid
        .ok_or_else(|| ShellError::SessionNotFound {
            session_id: handle.id.clone(),
        })
}

fn map_missing(e: SandboxError, handle: &SessionHandle) -> ShellError {
    match e {
        SandboxError::PtyNotFound { .. } => ShellError::SessionNotFound {
            session_id: handle.id.clone(),
        },
        other => other.into(),
    }
}

impl<S: Sandbox> NativePtyBackend<S> {
    #[must_use]
    pub fn new(sandbox: Arc<S>, shell: &ShellConfig, retry: RetryPolicy) -> Self {
        Self {
            sandbox,
            shell: shell.shell.clone(),
            retry,
            bootstrap_timeout: shell.bootstrap_timeout(),
            poll_interval: shell.poll_interval(),
        }
    }

    fn pty_options(&self) -> PtyOptions {
        let mut options = PtyOptions::new(&self.shell);
        if is_bash(&self.shell) {
            options = options
                .arg("--noprofile")
                .arg("--norc")
                .arg("--noediting");
        }
        options
            .arg("-i")
            .env("PS1", "")
            .env("PS2", "")
            .env("PROMPT_COMMAND", "")
            .env("TERM", "xterm-256color")
    }

    fn wrap(pid: u32, output: PtyStream) -> SessionHandle {
        let buffer = Arc::new(OutputBuffer::default());
        tokio::spawn(pump(output, Arc::clone(&buffer)));
        SessionHandle {
            id: pid.to_string(),
            kind: BackendKind::Native,
            shell_pid: Some(pid),
            stream: Some(buffer),
        }
    }
}

impl<S: Sandbox> ShellBackend for NativePtyBackend<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn create(&self, _scope: &str, label: &str) -> Result<SessionHandle, ShellError> {
        let pty = with_backoff(&self.retry, "pty_create", || async move {
            self.sandbox
                .pty_create(self.pty_options())
                .await
                .map_err(ShellError::from)
        })
        .await?;
        let pid = pty.pid;
        let handle = Self::wrap(pid, pty.output);
        tracing::info!(pid, label, "native shell started");

        if let Err(e) = bootstrap(
            self,
            &handle,
            SHELL_SETUP,
            self.bootstrap_timeout,
            self.poll_interval,
        )
        .await
        {
            if let Err(kill_err) = self.sandbox.pty_kill(pid).await {
                tracing::warn!(pid, "failed to kill shell after bootstrap failure: {kill_err}");
            }
            return Err(e);
        }
        self.rebase(&handle).await?;
        Ok(handle)
    }

    async fn attach(
        &self,
        _scope: &str,
        session_id: &str,
    ) -> Result<Option<SessionHandle>, ShellError> {
        let Ok(pid) = session_id.parse::<u32>() else {
            return Ok(None);
        };
        let stream = with_backoff(&self.retry, "pty_connect", || async move {
            self.sandbox.pty_connect(pid).await.map_err(ShellError::from)
        })
        .await?;
        Ok(stream.map(|output| {
            tracing::info!(pid, "reattached to native shell");
            Self::wrap(pid, output)
        }))
    }

    async fn send(&self, handle: &SessionHandle, input: &SendInput) -> Result<(), ShellError> {
        let pid = session_pid(handle)?;
        let bytes = match input {
            SendInput::Text { text, newline } => {
                let mut bytes = text.as_bytes().to_vec();
                if *newline {
                    bytes.push(b'\r');
                }
                bytes
            }
            SendInput::Key(key) => key.bytes().to_vec(),
        };
        let bytes = bytes.as_slice();
        retry_when(&self.retry, "pty_send", ShellError::is_undelivered, || async move {
            self.sandbox
                .pty_send(pid, bytes)
                .await
                .map_err(|e| map_missing(e, handle))
        })
        .await
    }

    async fn capture(&self, handle: &SessionHandle) -> Result<Capture, ShellError> {
        let buffer = handle
            .stream()
            .ok_or_else(|| ShellError::SessionNotFound {
                session_id: handle.id.clone(),
            })?;
        Ok(Capture {
            text: buffer.snapshot(),
            ended: buffer.is_closed(),
        })
    }

    async fn rebase(&self, handle: &SessionHandle) -> Result<(), ShellError> {
        if let Some(buffer) = handle.stream() {
            buffer.clear();
        }
        Ok(())
    }

    async fn kill(&self, handle: &SessionHandle) -> Result<bool, ShellError> {
        let pid = session_pid(handle)?;
        let killed = match self.sandbox.pty_kill(pid).await {
            Ok(killed) => killed,
            Err(SandboxError::PtyNotFound { .. }) => false,
            Err(e) => return Err(e.into()),
        };
        tracing::info!(pid, killed, "native shell terminated");
        Ok(killed)
    }
}
