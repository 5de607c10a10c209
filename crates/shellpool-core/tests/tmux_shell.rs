//! End-to-end runs against a real tmux server. Skipped where tmux is missing.
#![cfg(unix)]

use std::sync::Arc;

use shellpool_core::{
    BackendChoice, BackendKind, Config, ExecRequest, GuardrailChecker, SessionRegistry,
    SessionState, ShellBackend, ShellExecutor,
};
use shellpool_sandbox::LocalSandbox;
use tokio_util::sync::CancellationToken;

fn tmux_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .is_ok_and(|out| out.status.success())
}

fn executor() -> ShellExecutor<LocalSandbox> {
    let mut config = Config::default();
    config.shell.backend = BackendChoice::Multiplexer;
    config.shell.poll_interval_ms = 50;
    config.shell.settle_delay_ms = 300;
    config.terminate.interrupt_delay_ms = 200;
    let sandbox = Arc::new(LocalSandbox::new("bash"));
    let scope = format!("test-{}", uuid::Uuid::new_v4());
    let registry = SessionRegistry::new(scope, sandbox, &config).unwrap();
    ShellExecutor::new(Arc::new(registry), GuardrailChecker::with_defaults(), &config)
}

async fn run(
    executor: &ShellExecutor<LocalSandbox>,
    request: ExecRequest,
) -> shellpool_core::ExecOutcome {
    executor
        .exec(&request, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_share_one_tmux_session() {
    if !tmux_available() {
        return;
    }
    let executor = executor();
    assert_eq!(executor.registry().backend().kind(), BackendKind::Multiplexer);

    let out = run(&executor, ExecRequest::new("echo hi").timeout_secs(10)).await;
    assert_eq!(out.output, "hi");
    assert_eq!(out.exit_code, Some(0));
    assert!(out.session_id.starts_with("sp-"));

    run(&executor, ExecRequest::new("cd /tmp").timeout_secs(10)).await;
    let pwd = run(&executor, ExecRequest::new("pwd").timeout_secs(10)).await;
    assert_eq!(pwd.output, "/tmp");
    assert_eq!(pwd.session_id, out.session_id);

    let failed = run(&executor, ExecRequest::new("(exit 4)").timeout_secs(10)).await;
    assert_eq!(failed.exit_code, Some(4));
    executor.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_tmux_command_is_waited_on() {
    if !tmux_available() {
        return;
    }
    let executor = executor();
    let out = run(&executor, ExecRequest::new("sleep 3; echo slept").timeout_secs(1)).await;
    assert!(out.timed_out);
    assert_eq!(out.exit_code, None);

    let waited = executor
        .wait(&out.session_id, Some(15), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!waited.timed_out);
    assert_eq!(waited.exit_code, Some(0));
    assert_eq!(waited.output, "slept");
    assert_eq!(executor.registry().sessions()[0].state, SessionState::Idle);
    executor.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn long_output_is_captured_whole() {
    if !tmux_available() {
        return;
    }
    let executor = executor();
    let out = run(&executor, ExecRequest::new("seq 300").timeout_secs(10)).await;
    assert_eq!(out.exit_code, Some(0));
    let lines: Vec<&str> = out.output.lines().collect();
    assert_eq!(lines.len(), 300);
    assert_eq!(lines[0], "1");
    assert_eq!(lines[299], "300");

    // scrollback is rebased, so the next command sees only its own output
    let next = run(&executor, ExecRequest::new("echo after").timeout_secs(10)).await;
    assert_eq!(next.output, "after");
    executor.registry().shutdown().await;
}
