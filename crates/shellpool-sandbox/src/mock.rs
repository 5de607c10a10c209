//! Test-only scripted sandbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::{PtyHandle, PtyOptions, PtyStream, Result, RunOptions, RunOutput, Sandbox, SandboxError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxCall {
    Run(String),
    PtyCreate { program: String },
    PtyConnect(u32),
    PtySend(u32, Vec<u8>),
    PtyKill(u32),
}

type RunHandler = Arc<dyn Fn(&str) -> Result<RunOutput> + Send + Sync>;
type PtyResponder = Arc<dyn Fn(u32, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct MockPty {
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    replay: Vec<u8>,
}

impl MockPty {
    fn push(&mut self, data: &[u8]) {
        self.replay.extend_from_slice(data);
        self.subscribers.retain(|tx| tx.send(data.to_vec()).is_ok());
    }

    fn subscribe(&mut self) -> PtyStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.replay.is_empty() {
            let _ = tx.send(self.replay.clone());
        }
        self.subscribers.push(tx);
        rx
    }
}

#[derive(Clone)]
pub struct MockSandbox {
    calls: Arc<Mutex<Vec<SandboxCall>>>,
    run_handler: RunHandler,
    pty_responder: Option<PtyResponder>,
    pty_enabled: bool,
    ptys: Arc<Mutex<HashMap<u32, MockPty>>>,
    next_pid: Arc<AtomicU32>,
    transient_failures: Arc<AtomicUsize>,
    late_failures: Arc<AtomicUsize>,
    stalls: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MockSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSandbox")
            .field("pty_enabled", &self.pty_enabled)
            .finish_non_exhaustive()
    }
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            run_handler: Arc::new(|_| Ok(RunOutput::default())),
            pty_responder: None,
            pty_enabled: true,
            ptys: Arc::new(Mutex::new(HashMap::new())),
            next_pid: Arc::new(AtomicU32::new(1000)),
            transient_failures: Arc::new(AtomicUsize::new(0)),
            late_failures: Arc::new(AtomicUsize::new(0)),
            stalls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockSandbox {
    /// Sandbox without native PTY support.
    #[must_use]
    pub fn without_pty() -> Self {
        Self {
            pty_enabled: false,
            ..Self::default()
        }
    }

    /// PTY sandbox whose shells run a small scripted interpreter.
    #[must_use]
    pub fn interactive_shell() -> Self {
        let shells = Arc::new(crate::fake_shell::FakeShells::default());
        Self::default().with_pty_responder(move |pid, input| shells.respond(pid, input))
    }

    #[must_use]
    pub fn with_run_handler(
        mut self,
        handler: impl Fn(&str) -> Result<RunOutput> + Send + Sync + 'static,
    ) -> Self {
        self.run_handler = Arc::new(handler);
        self
    }

    /// Called with every write to a PTY; returned bytes are pushed back as output.
    #[must_use]
    pub fn with_pty_responder(
        mut self,
        responder: impl Fn(u32, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.pty_responder = Some(Arc::new(responder));
        self
    }

    /// Make the next `n` calls to `run` or `pty_send` fail with a transient error.
    pub fn fail_transiently(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `run` or `pty_send` take effect and then
    /// fail with a connection reset.
    pub fn fail_after_delivery(&self, n: usize) {
        self.late_failures.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<SandboxCall> {
        self.calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn run_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SandboxCall::Run(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Push output into a PTY as if the process had printed it.
    pub fn feed_pty(&self, pid: u32, data: &[u8]) {
        if let Some(pty) = self.ptys.lock().unwrap().get_mut(&pid) {
            pty.push(data);
        }
    }

    /// Simulate the PTY process exiting: its streams close.
    pub fn close_pty(&self, pid: u32) {
        self.ptys.lock().unwrap().remove(&pid);
    }

    #[must_use]
    pub fn live_ptys(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.ptys.lock().unwrap().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    fn record(&self, call: SandboxCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_transient_failure(&self) -> bool {
        Self::take(&self.transient_failures)
    }

    fn late_failure<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_ok() && Self::take(&self.late_failures) {
            return Err(SandboxError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            )));
        }
        result
    }

    /// Make every later `run` whose script contains `needle` hang forever.
    pub fn stall_runs_containing(&self, needle: impl Into<String>) {
        self.stalls.lock().unwrap().push(needle.into());
    }

    fn stalls_on(&self, command: &str) -> bool {
        self.stalls.lock().unwrap().iter().any(|n| command.contains(n.as_str()))
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Sandbox for MockSandbox {
    async fn run(&self, command: &str, _options: RunOptions) -> Result<RunOutput> {
        if self.take_transient_failure() {
            return Err(SandboxError::Transient {
                message: "mock connection reset".into(),
            });
        }
        self.record(SandboxCall::Run(command.to_owned()));
        if self.stalls_on(command) {
            std::future::pending::<()>().await;
        }
        self.late_failure((self.run_handler)(command))
    }

    fn supports_pty(&self) -> bool {
        self.pty_enabled
    }

    async fn pty_create(&self, options: PtyOptions) -> Result<PtyHandle> {
        if !self.pty_enabled {
            return Err(SandboxError::Unsupported);
        }
        self.record(SandboxCall::PtyCreate {
            program: options.program,
        });
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let mut pty = MockPty::default();
        let output = pty.subscribe();
        self.ptys.lock().unwrap().insert(pid, pty);
        Ok(PtyHandle { pid, output })
    }

    async fn pty_connect(&self, pid: u32) -> Result<Option<PtyStream>> {
        self.record(SandboxCall::PtyConnect(pid));
        Ok(self
            .ptys
            .lock()
            .unwrap()
            .get_mut(&pid)
            .map(MockPty::subscribe))
    }

    async fn pty_send(&self, pid: u32, data: &[u8]) -> Result<()> {
        if self.take_transient_failure() {
            return Err(SandboxError::Transient {
                message: "mock connection reset".into(),
            });
        }
        self.record(SandboxCall::PtySend(pid, data.to_vec()));
        if !self.ptys.lock().unwrap().contains_key(&pid) {
            return Err(SandboxError::PtyNotFound { pid });
        }
        if let Some(reply) = self.pty_responder.as_ref().and_then(|r| r(pid, data)) {
            self.feed_pty(pid, &reply);
        }
        self.late_failure(Ok(()))
    }

    async fn pty_kill(&self, pid: u32) -> Result<bool> {
        Ok(self.pty_kill_now(pid))
    }

    fn pty_kill_now(&self, pid: u32) -> bool {
        self.record(SandboxCall::PtyKill(pid));
        self.ptys.lock().unwrap().remove(&pid).is_some()
    }
}
