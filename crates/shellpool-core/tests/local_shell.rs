//! End-to-end runs against a real `bash` behind a local PTY.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use shellpool_core::{
    BackendChoice, Config, ExecRequest, GuardrailChecker, SessionRegistry, SessionState,
    ShellEvent, ShellExecutor,
};
use shellpool_sandbox::LocalSandbox;
use tokio_util::sync::CancellationToken;

fn executor() -> ShellExecutor<LocalSandbox> {
    let mut config = Config::default();
    config.shell.backend = BackendChoice::Native;
    config.shell.poll_interval_ms = 20;
    config.shell.settle_delay_ms = 300;
    config.terminate.interrupt_delay_ms = 200;
    let sandbox = Arc::new(LocalSandbox::new("bash"));
    let registry = SessionRegistry::new("local", sandbox, &config).unwrap();
    ShellExecutor::new(Arc::new(registry), GuardrailChecker::with_defaults(), &config)
}

async fn run(executor: &ShellExecutor<LocalSandbox>, request: ExecRequest) -> shellpool_core::ExecOutcome {
    executor
        .exec(&request, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_and_exit_codes() {
    let executor = executor();
    let out = run(&executor, ExecRequest::new("echo hi").timeout_secs(5)).await;
    assert_eq!(out.output, "hi");
    assert_eq!(out.exit_code, Some(0));
    assert!(!out.timed_out);

    let out = run(&executor, ExecRequest::new("(exit 3)").timeout_secs(5)).await;
    assert_eq!(out.exit_code, Some(3));

    let out = run(&executor, ExecRequest::new("printf 'a\\nb\\n'; echo c").timeout_secs(5)).await;
    assert_eq!(out.output, "a\nb\nc");
    executor.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn working_directory_persists() {
    let executor = executor();
    run(&executor, ExecRequest::new("cd /tmp").timeout_secs(5)).await;
    let out = run(&executor, ExecRequest::new("pwd").timeout_secs(5)).await;
    assert_eq!(out.output, "/tmp");

    run(&executor, ExecRequest::new("export SP_MARK=42").timeout_secs(5)).await;
    let out = run(&executor, ExecRequest::new("echo $SP_MARK").timeout_secs(5)).await;
    assert_eq!(out.output, "42");
    executor.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_command_survives_timeout() {
    let executor = executor();
    let out = run(&executor, ExecRequest::new("sleep 2; echo done").timeout_secs(1)).await;
    assert!(out.timed_out);
    assert_eq!(out.exit_code, None);

    let waited = executor
        .wait(&out.session_id, Some(15), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!waited.timed_out);
    assert_eq!(waited.exit_code, Some(0));
    assert_eq!(waited.output, "done");
    assert_eq!(executor.registry().sessions()[0].state, SessionState::Idle);
    executor.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_interrupts_foreground() {
    let executor = Arc::new(executor());
    let cancel = CancellationToken::new();
    let started = Instant::now();
    let handle = {
        let executor = Arc::clone(&executor);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            executor
                .exec(&ExecRequest::new("sleep 30").timeout_secs(60), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let out = handle.await.unwrap().unwrap();
    assert!(out.aborted);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(executor.registry().sessions()[0].state, SessionState::Idle);

    let next = run(&executor, ExecRequest::new("echo alive").timeout_secs(5)).await;
    assert_eq!(next.session_id, out.session_id);
    assert_eq!(next.output, "alive");
    executor.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn input_reaches_waiting_program() {
    let executor = executor();
    let out = run(
        &executor,
        ExecRequest::new("read -r name; echo \"hello $name\"").timeout_secs(1),
    )
    .await;
    assert!(out.timed_out);

    let sent = executor.send(&out.session_id, "world", true).await.unwrap();
    let output = match sent.exit_code {
        Some(code) => {
            assert_eq!(code, 0);
            sent.output
        }
        None => {
            let waited = executor
                .wait(&out.session_id, Some(5), &CancellationToken::new())
                .await
                .unwrap();
            format!("{}\n{}", sent.output, waited.output)
        }
    };
    assert!(output.contains("hello world"));
    executor.registry().shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_lines_stream_as_final_text() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let executor = executor().with_event_tx(tx);
    let out = run(
        &executor,
        ExecRequest::new("printf 'progress 10%%\\r'; sleep 0.5; printf 'progress 20%%\\ndone\\n'")
            .timeout_secs(5),
    )
    .await;
    assert_eq!(out.output, "progress 20%\ndone");

    let mut streamed = String::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            ShellEvent::OutputChunk { chunk, .. } => streamed.push_str(&chunk),
            ShellEvent::OutputReset { output, .. } => streamed = output,
            _ => {}
        }
    }
    assert_eq!(streamed, out.output);
    executor.registry().shutdown().await;
}
