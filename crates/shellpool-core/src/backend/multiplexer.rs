use std::sync::Arc;
use std::time::Duration;

use shellpool_sandbox::{RunOptions, RunOutput, Sandbox};
use tokio::sync::OnceCell;

use super::native::is_bash;
use super::{
    BackendKind, Capture, SHELL_SETUP, SendInput, SessionHandle, ShellBackend, bootstrap,
    shell_quote,
};
use crate::config::ShellConfig;
use crate::error::ShellError;
use crate::retry::{RetryPolicy, retry_when, with_backoff};

const TMUX_TIMEOUT: Duration = Duration::from_secs(30);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const PANE_COLS: u16 = 200;
const PANE_ROWS: u16 = 50;

const INSTALL_SCRIPT: &str = r#"command -v tmux >/dev/null 2>&1 && exit 0
SUDO=""
if [ "$(id -u)" != 0 ] && command -v sudo >/dev/null 2>&1; then SUDO="sudo -n"; fi
if command -v apt-get >/dev/null 2>&1; then
  $SUDO apt-get update -qq && $SUDO env DEBIAN_FRONTEND=noninteractive apt-get install -y -qq tmux
elif command -v apk >/dev/null 2>&1; then
  $SUDO apk add --no-cache tmux
elif command -v dnf >/dev/null 2>&1; then
  $SUDO dnf install -y tmux
elif command -v yum >/dev/null 2>&1; then
  $SUDO yum install -y tmux
else
  echo "no supported package manager" >&2
  exit 127
fi
command -v tmux >/dev/null 2>&1"#;

/// Shells hosted in detached tmux sessions, polled with `capture-pane`.
pub struct MultiplexerBackend<S> {
    sandbox: Arc<S>,
    shell: String,
    history_limit: u32,
    retry: RetryPolicy,
    bootstrap_timeout: Duration,
    poll_interval: Duration,
    installed: OnceCell<()>,
}

impl<S> std::fmt::Debug for MultiplexerBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexerBackend")
            .field("shell", &self.shell)
            .field("installed", &self.installed.initialized())
            .finish_non_exhaustive()
    }
}

/// FNV-1a; stable across processes so names survive a restart.
fn scope_digest(scope: &str) -> u64 {
    scope.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn name_prefix(scope: &str) -> String {
    format!("sp-{:012x}-", scope_digest(scope) & 0xffff_ffff_ffff)
}

/// Deterministic tmux session name for `label` within `scope`.
#[must_use]
pub fn session_name(scope: &str, label: &str) -> String {
    let label: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let label = if label.is_empty() { "main" } else { &label };
    format!("{}{label}", name_prefix(scope))
}

fn session_target(name: &str) -> String {
    shell_quote(&format!("={name}"))
}

fn pane_target(name: &str) -> String {
    shell_quote(&format!("={name}:"))
}

fn is_missing_session(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["can't find", "no server running", "session not found", "error connecting"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

fn failure(out: &RunOutput, handle: &SessionHandle) -> ShellError {
    if is_missing_session(&out.stderr) {
        ShellError::SessionNotFound {
            session_id: handle.id.clone(),
        }
    } else {
        ShellError::Multiplexer {
            message: out.stderr.trim().to_owned(),
        }
    }
}

impl<S: Sandbox> MultiplexerBackend<S> {
    #[must_use]
    pub fn new(sandbox: Arc<S>, shell: &ShellConfig, retry: RetryPolicy) -> Self {
        Self {
            sandbox,
            shell: shell.shell.clone(),
            history_limit: shell.history_limit,
            retry,
            bootstrap_timeout: shell.bootstrap_timeout(),
            poll_interval: shell.poll_interval(),
            installed: OnceCell::new(),
        }
    }

    async fn tmux(&self, operation: &str, script: &str) -> Result<RunOutput, ShellError> {
        self.tmux_when(operation, script, ShellError::is_transient).await
    }

    async fn tmux_when(
        &self,
        operation: &str,
        script: &str,
        retryable: fn(&ShellError) -> bool,
    ) -> Result<RunOutput, ShellError> {
        retry_when(&self.retry, operation, retryable, || async move {
            self.sandbox
                .run(script, RunOptions::with_timeout(TMUX_TIMEOUT))
                .await
                .map_err(ShellError::from)
        })
        .await
    }

    /// Verify tmux exists, installing it on first use if needed.
    async fn ensure_installed(&self) -> Result<(), ShellError> {
        self.installed
            .get_or_try_init(|| async {
                let out = with_backoff(&self.retry, "tmux_install", || async move {
                    self.sandbox
                        .run(INSTALL_SCRIPT, RunOptions::with_timeout(INSTALL_TIMEOUT))
                        .await
                        .map_err(ShellError::from)
                })
                .await?;
                if out.success() {
                    tracing::debug!("tmux available");
                    Ok(())
                } else {
                    Err(ShellError::BackendUnavailable {
                        message: format!(
                            "tmux is not installed and could not be installed: {}",
                            out.stderr.trim()
                        ),
                    })
                }
            })
            .await
            .map(|_| ())
    }

    fn shell_command(&self) -> String {
        if is_bash(&self.shell) {
            shell_quote(&format!("{} --noprofile --norc", self.shell))
        } else {
            shell_quote(&self.shell)
        }
    }

    fn shell_name(&self) -> &str {
        self.shell.rsplit('/').next().unwrap_or(&self.shell)
    }

    fn handle(name: &str, shell_pid: Option<u32>) -> SessionHandle {
        SessionHandle {
            id: name.to_owned(),
            kind: BackendKind::Multiplexer,
            shell_pid,
            stream: None,
        }
    }

    /// Pane pid and foreground command of an existing session.
    async fn inspect(&self, name: &str) -> Result<Option<(Option<u32>, String)>, ShellError> {
        let script = format!(
            "tmux has-session -t {} 2>/dev/null && tmux display-message -p -t {} '#{{pane_pid}} #{{pane_current_command}}'",
            session_target(name),
            pane_target(name),
        );
        let out = self.tmux("tmux_inspect", &script).await?;
        if !out.success() {
            return Ok(None);
        }
        let line = out.stdout.trim();
        let (pid, command) = line.split_once(' ').unwrap_or((line, ""));
        Ok(Some((pid.parse().ok(), command.to_owned())))
    }
}

impl<S: Sandbox> ShellBackend for MultiplexerBackend<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::Multiplexer
    }

    async fn create(&self, scope: &str, label: &str) -> Result<SessionHandle, ShellError> {
        self.ensure_installed().await?;
        let name = session_name(scope, label);

        if let Some((pid, command)) = self.inspect(&name).await? {
            if command == self.shell_name() {
                tracing::info!(session = %name, "reusing idle multiplexer session");
                return Ok(Self::handle(&name, pid));
            }
            tracing::info!(session = %name, command = %command, "multiplexer session exists and is busy");
            return Err(ShellError::SessionBusy { session_id: name });
        }

        let script = format!(
            "tmux start-server \\; set-option -g history-limit {limit} \\; new-session -d -s {session} -x {PANE_COLS} -y {PANE_ROWS} {shell} && tmux display-message -p -t {pane} '#{{pane_pid}}'",
            limit = self.history_limit,
            session = shell_quote(&name),
            shell = self.shell_command(),
            pane = pane_target(&name),
        );
        let out = self.tmux("tmux_new_session", &script).await?;
        if !out.success() {
            return Err(ShellError::Multiplexer {
                message: out.stderr.trim().to_owned(),
            });
        }
        let shell_pid = out.stdout.trim().lines().last().and_then(|l| l.trim().parse().ok());
        if shell_pid.is_none() {
            tracing::warn!(session = %name, "could not read pane pid");
        }
        let handle = Self::handle(&name, shell_pid);
        tracing::info!(session = %name, ?shell_pid, "multiplexer session started");

        let setup = format!("export PS1='$ ' PS2='' PROMPT_COMMAND=''; {SHELL_SETUP}");
        if let Err(e) = bootstrap(
            self,
            &handle,
            &setup,
            self.bootstrap_timeout,
            self.poll_interval,
        )
        .await
        {
            if let Err(kill_err) = self.kill(&handle).await {
                tracing::warn!(session = %name, "failed to remove session after bootstrap failure: {kill_err}");
            }
            return Err(e);
        }
        Ok(handle)
    }

    async fn attach(
        &self,
        scope: &str,
        session_id: &str,
    ) -> Result<Option<SessionHandle>, ShellError> {
        if !session_id.starts_with(&name_prefix(scope)) {
            return Ok(None);
        }
        Ok(self.inspect(session_id).await?.map(|(pid, _)| {
            tracing::info!(session = %session_id, "reattached to multiplexer session");
            Self::handle(session_id, pid)
        }))
    }

    async fn send(&self, handle: &SessionHandle, input: &SendInput) -> Result<(), ShellError> {
        let pane = pane_target(&handle.id);
        let script = match input {
            SendInput::Text { text, newline } => {
                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(format!("tmux send-keys -t {pane} -l -- {}", shell_quote(text)));
                }
                if *newline {
                    parts.push(format!("tmux send-keys -t {pane} Enter"));
                }
                if parts.is_empty() {
                    return Ok(());
                }
                parts.join(" && ")
            }
            SendInput::Key(key) => format!("tmux send-keys -t {pane} {}", key.tmux_name()),
        };
        let out = self
            .tmux_when("tmux_send_keys", &script, ShellError::is_undelivered)
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(failure(&out, handle))
        }
    }

    async fn capture(&self, handle: &SessionHandle) -> Result<Capture, ShellError> {
        let script = format!(
            "tmux capture-pane -p -J -e -S - -t {}",
            pane_target(&handle.id)
        );
        let out = self.tmux("tmux_capture", &script).await?;
        if out.success() {
            return Ok(Capture {
                text: out.stdout.trim_end().to_owned(),
                ended: false,
            });
        }
        match failure(&out, handle) {
            ShellError::SessionNotFound { .. } => Ok(Capture {
                text: String::new(),
                ended: true,
            }),
            e => Err(e),
        }
    }

    async fn rebase(&self, handle: &SessionHandle) -> Result<(), ShellError> {
        let script = format!("tmux clear-history -t {}", pane_target(&handle.id));
        let out = self.tmux("tmux_clear_history", &script).await?;
        if out.success() {
            Ok(())
        } else {
            Err(failure(&out, handle))
        }
    }

    async fn kill(&self, handle: &SessionHandle) -> Result<bool, ShellError> {
        let script = format!("tmux kill-session -t {}", session_target(&handle.id));
        let out = self.tmux("tmux_kill_session", &script).await?;
        if out.success() {
            tracing::info!(session = %handle.id, "multiplexer session killed");
            return Ok(true);
        }
        match failure(&out, handle) {
            ShellError::SessionNotFound { .. } => Ok(false),
            e => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, PoisonError};

    use shellpool_sandbox::MockSandbox;

    use super::*;
    use crate::backend::ControlKey;
    use crate::sentinel::MARKER_PREFIX;

    fn ok(stdout: &str) -> shellpool_sandbox::Result<RunOutput> {
        Ok(RunOutput {
            stdout: stdout.into(),
            ..RunOutput::default()
        })
    }

    fn fail(stderr: &str) -> shellpool_sandbox::Result<RunOutput> {
        Ok(RunOutput {
            stderr: stderr.into(),
            exit_code: 1,
            ..RunOutput::default()
        })
    }

    /// Minimal tmux stand-in: one pane whose content grows with every sentinel line sent.
    fn fake_tmux(existing: Option<&'static str>) -> MockSandbox {
        let pane = Arc::new(Mutex::new(String::new()));
        MockSandbox::without_pty().with_run_handler(move |script| {
            let mut pane = pane.lock().unwrap_or_else(PoisonError::into_inner);
            if script.contains("command -v tmux") {
                ok("")
            } else if script.contains("has-session") {
                existing.map_or_else(|| fail("can't find session"), ok)
            } else if script.contains("new-session") {
                ok("4321\n")
            } else if script.contains("send-keys") && script.contains(MARKER_PREFIX) {
                let start = script.find(MARKER_PREFIX).unwrap_or(0);
                let marker: String = script[start..]
                    .chars()
                    .take_while(|c| *c != '$')
                    .collect();
                pane.push_str(&format!("$ {}\n{marker}0\n$ ", &script[start..]));
                ok("")
            } else if script.contains("send-keys") {
                ok("")
            } else if script.contains("capture-pane") {
                ok(&pane)
            } else if script.contains("clear-history") {
                pane.clear();
                ok("")
            } else if script.contains("kill-session") {
                ok("")
            } else {
                fail("unknown command")
            }
        })
    }

    fn backend(sandbox: &MockSandbox) -> MultiplexerBackend<MockSandbox> {
        let config = ShellConfig {
            bootstrap_timeout_secs: 2,
            poll_interval_ms: 5,
            ..ShellConfig::default()
        };
        MultiplexerBackend::new(Arc::new(sandbox.clone()), &config, RetryPolicy::none())
    }

    #[test]
    fn names_are_stable_and_scoped() {
        let a = session_name("conversation-1", "main");
        assert_eq!(a, session_name("conversation-1", "main"));
        assert_ne!(a, session_name("conversation-2", "main"));
        assert!(a.starts_with("sp-"));
        assert!(a.ends_with("-main"));
        assert!(session_name("c", "a.b:c").ends_with("-a-b-c"));
        assert!(session_name("c", "").ends_with("-main"));
    }

    #[test]
    fn missing_session_detection() {
        assert!(is_missing_session("can't find session: sp-1-main"));
        assert!(is_missing_session("no server running on /tmp/tmux-0/default"));
        assert!(!is_missing_session("unknown option -- z"));
    }

    #[tokio::test]
    async fn create_installs_starts_and_bootstraps() {
        let sandbox = fake_tmux(None);
        let backend = backend(&sandbox);
        let handle = backend.create("scope", "main").await.unwrap();

        assert_eq!(handle.id, session_name("scope", "main"));
        assert_eq!(handle.shell_pid, Some(4321));
        let commands = sandbox.run_commands();
        assert!(commands[0].contains("command -v tmux"));
        assert!(commands[1].contains("has-session"));
        assert!(commands[2].contains("history-limit 50000"));
        assert!(commands[2].contains("-x 200 -y 50"));
        assert!(commands[2].contains("--noprofile --norc"));
        assert!(commands.iter().any(|c| c.contains("PS1='\\''$ '\\''")));

        backend.create("scope", "other").await.unwrap();
        let installs = sandbox
            .run_commands()
            .iter()
            .filter(|c| c.contains("command -v tmux"))
            .count();
        assert_eq!(installs, 1);
    }

    #[tokio::test]
    async fn install_failure_is_backend_unavailable() {
        let sandbox = MockSandbox::without_pty().with_run_handler(|_| fail("E: Unable to locate package tmux"));
        let backend = backend(&sandbox);
        let err = backend.create("scope", "main").await.unwrap_err();
        assert!(matches!(err, ShellError::BackendUnavailable { .. }));
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Unable to locate package"));
    }

    #[tokio::test]
    async fn existing_idle_session_is_reused() {
        let sandbox = fake_tmux(Some("777 bash"));
        let backend = backend(&sandbox);
        let handle = backend.create("scope", "main").await.unwrap();
        assert_eq!(handle.shell_pid, Some(777));
        assert!(!sandbox.run_commands().iter().any(|c| c.contains("new-session")));
    }

    #[tokio::test]
    async fn existing_busy_session_is_reported() {
        let sandbox = fake_tmux(Some("777 sleep"));
        let backend = backend(&sandbox);
        assert!(matches!(
            backend.create("scope", "main").await,
            Err(ShellError::SessionBusy { .. })
        ));
    }

    #[tokio::test]
    async fn send_uses_literal_keys_then_enter() {
        let sandbox = fake_tmux(None);
        let backend = backend(&sandbox);
        let handle = MultiplexerBackend::<MockSandbox>::handle("sp-x-main", Some(1));

        backend
            .send(&handle, &SendInput::line("echo 'hi'"))
            .await
            .unwrap();
        backend
            .send(&handle, &SendInput::Key(ControlKey::Interrupt))
            .await
            .unwrap();
        let commands = sandbox.run_commands();
        assert_eq!(
            commands[0],
            "tmux send-keys -t '=sp-x-main:' -l -- 'echo '\\''hi'\\''' && tmux send-keys -t '=sp-x-main:' Enter"
        );
        assert_eq!(commands[1], "tmux send-keys -t '=sp-x-main:' C-c");
    }

    #[tokio::test]
    async fn keys_are_not_resent_after_late_reset() {
        let sandbox = fake_tmux(None);
        let retry = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let backend = MultiplexerBackend::new(
            Arc::new(sandbox.clone()),
            &ShellConfig::default(),
            retry,
        );
        let handle = MultiplexerBackend::<MockSandbox>::handle("sp-x-main", Some(1));

        sandbox.fail_after_delivery(1);
        assert!(backend.send(&handle, &SendInput::line("rm -r build")).await.is_err());
        assert_eq!(sandbox.run_commands().len(), 1);

        sandbox.fail_after_delivery(1);
        assert!(backend.capture(&handle).await.is_ok());
        assert_eq!(sandbox.run_commands().len(), 3);
    }

    #[tokio::test]
    async fn capture_of_vanished_session_reports_end() {
        let sandbox =
            MockSandbox::without_pty().with_run_handler(|_| fail("can't find pane: =sp-x-main:"));
        let backend = backend(&sandbox);
        let handle = MultiplexerBackend::<MockSandbox>::handle("sp-x-main", None);
        let capture = backend.capture(&handle).await.unwrap();
        assert!(capture.ended);
        assert!(!backend.kill(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn attach_ignores_foreign_scopes() {
        let sandbox = fake_tmux(Some("777 bash"));
        let backend = backend(&sandbox);
        let own = session_name("scope", "main");
        let foreign = session_name("other", "main");
        assert!(backend.attach("scope", &own).await.unwrap().is_some());
        assert!(backend.attach("scope", &foreign).await.unwrap().is_none());
    }
}
