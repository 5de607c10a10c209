use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::pty::PtyTable;
use crate::{ChunkTx, PtyHandle, PtyOptions, PtyStream, Result, RunOptions, RunOutput, Sandbox};

/// Sandbox backed by the local machine: `sh -c` for one-shot commands and
/// `portable-pty` for interactive sessions.
#[derive(Clone)]
pub struct LocalSandbox {
    shell: String,
    ptys: PtyTable,
}

impl std::fmt::Debug for LocalSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSandbox")
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl LocalSandbox {
    #[must_use]
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            ptys: PtyTable::default(),
        }
    }
}

fn pump_lines<R>(reader: R, sink: Option<ChunkTx>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut collected = String::new();
        let mut buf = String::new();
        while reader.read_line(&mut buf).await.unwrap_or(0) > 0 {
            if let Some(ref tx) = sink {
                let _ = tx.send(buf.clone());
            }
            collected.push_str(&buf);
            buf.clear();
        }
        collected
    })
}

impl Sandbox for LocalSandbox {
    async fn run(&self, command: &str, options: RunOptions) -> Result<RunOutput> {
        if options.background {
            let mut child = Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Ok(RunOutput::default());
        }

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().map(|r| pump_lines(r, options.on_stdout));
        let stderr = child.stderr.take().map(|r| pump_lines(r, options.on_stderr));

        let status = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(crate::SandboxError::TimedOut {
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
            None => child.wait().await?,
        };

        let stdout = match stdout {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(RunOutput {
            stdout,
            stderr,
            // killed by a signal
            exit_code: status.code().unwrap_or(-1),
        })
    }

    fn supports_pty(&self) -> bool {
        true
    }

    async fn pty_create(&self, options: PtyOptions) -> Result<PtyHandle> {
        self.ptys.spawn(&options)
    }

    async fn pty_connect(&self, pid: u32) -> Result<Option<PtyStream>> {
        Ok(self.ptys.subscribe(pid))
    }

    async fn pty_send(&self, pid: u32, data: &[u8]) -> Result<()> {
        let ptys = self.ptys.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || ptys.write(pid, &data))
            .await
            .map_err(|e| crate::SandboxError::Pty(e.to_string()))?
    }

    async fn pty_kill(&self, pid: u32) -> Result<bool> {
        self.ptys.kill(pid)
    }

    fn pty_kill_now(&self, pid: u32) -> bool {
        self.ptys.kill(pid).unwrap_or_else(|e| {
            tracing::warn!(pid, "failed to kill pty: {e}");
            false
        })
    }
}
