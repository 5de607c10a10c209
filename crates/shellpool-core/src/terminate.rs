//! Escalating termination: backend kill, then control keys, then signals by pid.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shellpool_sandbox::{RunOptions, Sandbox};

use crate::backend::{AnyBackend, ControlKey, SendInput, SessionHandle, ShellBackend};
use crate::config::TerminateConfig;
use crate::pid::{PS_COMMAND, descendants, kill_command, parse_process_table, select_targets};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    DirectKill,
    ControlKeys,
    SignalPid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// Last strategy that was delivered, if any.
    pub strategy: Option<Strategy>,
    pub may_still_run: bool,
}

impl Termination {
    fn stopped(strategy: Strategy) -> Self {
        Self {
            strategy: Some(strategy),
            may_still_run: false,
        }
    }
}

pub struct ProcessTerminator<S> {
    sandbox: Arc<S>,
    interrupt_delay: Duration,
}

impl<S> std::fmt::Debug for ProcessTerminator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTerminator")
            .field("interrupt_delay", &self.interrupt_delay)
            .finish_non_exhaustive()
    }
}

impl<S: Sandbox> ProcessTerminator<S> {
    #[must_use]
    pub fn new(sandbox: Arc<S>, config: &TerminateConfig) -> Self {
        Self {
            sandbox,
            interrupt_delay: config.interrupt_delay(),
        }
    }

    /// End a whole session. Falls back to stopping the foreground and typing
    /// `exit` when the backend cannot kill the shell directly.
    pub async fn terminate_session(
        &self,
        backend: &AnyBackend<S>,
        handle: &SessionHandle,
        command: Option<&str>,
    ) -> Termination {
        match backend.kill(handle).await {
            Ok(true) => return Termination::stopped(Strategy::DirectKill),
            Ok(false) => {
                return Termination {
                    strategy: None,
                    may_still_run: false,
                };
            }
            Err(e) => {
                tracing::warn!(session_id = %handle.id, "direct kill failed, escalating: {e}");
            }
        }
        let termination = self.terminate_foreground(backend, handle, command, &[]).await;
        if let Err(e) = backend.send(handle, &SendInput::line("exit")).await {
            tracing::warn!(session_id = %handle.id, "failed to send exit: {e}");
        }
        termination
    }

    /// Stop whatever runs in the session's foreground, leaving the shell alive.
    /// Pids in `exclude` (tracked background jobs) are never signalled.
    pub async fn terminate_foreground(
        &self,
        backend: &AnyBackend<S>,
        handle: &SessionHandle,
        command: Option<&str>,
        exclude: &[u32],
    ) -> Termination {
        let mut strategy = None;

        if backend
            .send(handle, &SendInput::Key(ControlKey::Interrupt))
            .await
            .is_ok()
        {
            strategy = Some(Strategy::ControlKeys);
            tokio::time::sleep(self.interrupt_delay).await;
            match self.foreground_stopped(handle, exclude).await {
                Some(true) => return Termination::stopped(Strategy::ControlKeys),
                // EOF reaches the shell itself once the foreground is gone, so
                // it is only sent when something verifiably still runs.
                Some(false) => {
                    if backend
                        .send(handle, &SendInput::Key(ControlKey::Eof))
                        .await
                        .is_ok()
                    {
                        tokio::time::sleep(self.interrupt_delay).await;
                        if self.foreground_stopped(handle, exclude).await == Some(true) {
                            return Termination::stopped(Strategy::ControlKeys);
                        }
                    }
                }
                None => {}
            }
        }

        if self.signal(handle, command, exclude).await {
            strategy = Some(Strategy::SignalPid);
            tokio::time::sleep(self.interrupt_delay).await;
            if self.foreground_stopped(handle, exclude).await != Some(false) {
                return Termination::stopped(Strategy::SignalPid);
            }
        }

        tracing::warn!(session_id = %handle.id, ?strategy, "foreground process may still be running");
        Termination {
            strategy,
            may_still_run: true,
        }
    }

    async fn process_table(&self) -> Option<Vec<crate::pid::ProcessEntry>> {
        match self
            .sandbox
            .run(PS_COMMAND, RunOptions::with_timeout(LOOKUP_TIMEOUT))
            .await
        {
            Ok(out) if out.success() => Some(parse_process_table(&out.stdout)),
            Ok(out) => {
                tracing::debug!(exit_code = out.exit_code, "process listing failed");
                None
            }
            Err(e) => {
                tracing::debug!("process listing failed: {e}");
                None
            }
        }
    }

    /// `None` when the shell pid is unknown or the process table unavailable.
    pub(crate) async fn foreground_stopped(&self, handle: &SessionHandle, exclude: &[u32]) -> Option<bool> {
        let shell = handle.shell_pid?;
        let table = self.process_table().await?;
        Some(
            descendants(&table, shell)
                .iter()
                .all(|pid| exclude.contains(pid)),
        )
    }

    async fn signal(&self, handle: &SessionHandle, command: Option<&str>, exclude: &[u32]) -> bool {
        let Some(table) = self.process_table().await else {
            return false;
        };
        let Some(target) = select_targets(&table, command, handle.shell_pid) else {
            return false;
        };
        let pids: Vec<u32> = target
            .pids
            .into_iter()
            .filter(|pid| !exclude.contains(pid))
            .collect();
        if pids.is_empty() {
            return false;
        }
        tracing::info!(session_id = %handle.id, ?pids, kind = ?target.kind, "signalling foreground processes");
        match self
            .sandbox
            .run(&kill_command(&pids), RunOptions::with_timeout(LOOKUP_TIMEOUT))
            .await
        {
            Ok(out) => out.success(),
            Err(e) => {
                tracing::warn!("kill failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use shellpool_sandbox::{MockSandbox, RunOutput, SandboxCall};

    use super::*;
    use crate::config::Config;

    fn backend(sandbox: &MockSandbox) -> AnyBackend<MockSandbox> {
        let mut config = Config::default();
        config.shell.poll_interval_ms = 5;
        AnyBackend::select(Arc::new(sandbox.clone()), &config.shell, &config.retry).unwrap()
    }

    fn terminator(sandbox: &MockSandbox) -> ProcessTerminator<MockSandbox> {
        ProcessTerminator::new(
            Arc::new(sandbox.clone()),
            &TerminateConfig {
                interrupt_delay_ms: 1,
            },
        )
    }

    fn sent_keys(sandbox: &MockSandbox) -> Vec<Vec<u8>> {
        sandbox
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SandboxCall::PtySend(_, data) if data.len() == 1 => Some(data),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn session_kill_is_direct() {
        let sandbox = MockSandbox::interactive_shell();
        let backend = backend(&sandbox);
        let handle = backend.create("scope", "main").await.unwrap();

        let result = terminator(&sandbox)
            .terminate_session(&backend, &handle, None)
            .await;
        assert_eq!(result, Termination::stopped(Strategy::DirectKill));
        assert!(sandbox.live_ptys().is_empty());

        let again = terminator(&sandbox)
            .terminate_session(&backend, &handle, None)
            .await;
        assert_eq!(again.strategy, None);
    }

    #[tokio::test]
    async fn interrupt_is_enough_when_foreground_exits() {
        let sandbox = MockSandbox::interactive_shell();
        let backend = backend(&sandbox);
        let handle = backend.create("scope", "main").await.unwrap();
        sandbox.clear_calls();

        let result = terminator(&sandbox)
            .terminate_foreground(&backend, &handle, Some("sleep 30"), &[])
            .await;
        assert_eq!(result, Termination::stopped(Strategy::ControlKeys));
        assert_eq!(sent_keys(&sandbox), vec![b"\x03".to_vec()]);
    }

    #[tokio::test]
    async fn escalates_to_signal_for_stubborn_process() {
        let killed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&killed);
        let sandbox = MockSandbox::interactive_shell().with_run_handler(move |cmd| {
            if cmd.starts_with("kill -9") {
                flag.store(true, Ordering::SeqCst);
                return Ok(RunOutput::default());
            }
            let stdout = if flag.load(Ordering::SeqCst) {
                "1000 1 bash -i\n".to_owned()
            } else {
                "1000 1 bash -i\n1001 1000 python3 server.py\n4242 1000 sleep 100\n".to_owned()
            };
            Ok(RunOutput {
                stdout,
                ..RunOutput::default()
            })
        });
        let backend = backend(&sandbox);
        let handle = backend.create("scope", "main").await.unwrap();

        let result = terminator(&sandbox)
            .terminate_foreground(&backend, &handle, Some("python3 server.py"), &[4242])
            .await;
        assert_eq!(result, Termination::stopped(Strategy::SignalPid));
        assert_eq!(sent_keys(&sandbox), vec![b"\x03".to_vec(), b"\x04".to_vec()]);
        assert!(sandbox.run_commands().contains(&"kill -9 1001".to_owned()));
    }

    #[tokio::test]
    async fn unverifiable_foreground_may_still_run() {
        let sandbox = MockSandbox::interactive_shell().with_run_handler(|_| {
            Ok(RunOutput {
                exit_code: 1,
                ..RunOutput::default()
            })
        });
        let backend = backend(&sandbox);
        let handle = backend.create("scope", "main").await.unwrap();
        sandbox.clear_calls();

        let result = terminator(&sandbox)
            .terminate_foreground(&backend, &handle, Some("sleep 30"), &[])
            .await;
        assert_eq!(result.strategy, Some(Strategy::ControlKeys));
        assert!(result.may_still_run);
        assert_eq!(sent_keys(&sandbox), vec![b"\x03".to_vec()]);
    }
}
