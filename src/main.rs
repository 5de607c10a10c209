use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shellpool_core::tool::TOOL_ID;
use shellpool_core::{
    AuditLogger, BackendChoice, Config, GuardrailChecker, SessionRegistry, ShellEvent,
    ShellExecutor, ShellReply, ShellTool, ToolCall,
};
use shellpool_sandbox::LocalSandbox;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Persistent shell sessions for agents. Reads one JSON tool call per line on
/// stdin and answers with one JSON reply per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "shellpool", version, about)]
struct Args {
    /// Config file; `SHELLPOOL_CONFIG` when not given.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scope all sessions belong to; a fresh one per run by default.
    #[arg(long)]
    scope: Option<String>,

    /// Override `shell.backend`: auto, native or multiplexer.
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendChoice>,

    /// Print the tool's JSON schema and exit.
    #[arg(long)]
    schema: bool,
}

fn parse_backend(value: &str) -> Result<BackendChoice, String> {
    serde_json::from_value(serde_json::Value::String(value.to_owned()))
        .map_err(|_| format!("unknown backend `{value}`, expected auto, native or multiplexer"))
}

fn resolve_config_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.config {
        return path.clone();
    }
    if let Ok(path) = std::env::var("SHELLPOOL_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("shellpool.toml")
}

/// Accepts `{"tool_id": .., "params": {..}}` or the bare params object.
fn parse_call(line: &str) -> anyhow::Result<ToolCall> {
    let value: serde_json::Value = serde_json::from_str(line).context("request is not valid JSON")?;
    if value.get("tool_id").is_some() {
        return serde_json::from_value(value).context("malformed tool call");
    }
    match value {
        serde_json::Value::Object(params) => Ok(ToolCall {
            tool_id: TOOL_ID.to_owned(),
            params: params.into_iter().collect(),
        }),
        _ => anyhow::bail!("request must be a JSON object"),
    }
}

fn render_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<ShellEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut stderr = std::io::stderr().lock();
            let _ = match event {
                ShellEvent::Started { session_id, command, .. } => {
                    writeln!(stderr, "[{session_id}] $ {command}")
                }
                ShellEvent::OutputChunk { chunk, .. } => write!(stderr, "{chunk}"),
                ShellEvent::OutputReset { session_id, output, .. } => {
                    write!(stderr, "\n[{session_id}] output rewritten:\n{output}")
                }
                ShellEvent::Completed {
                    session_id,
                    exit_code,
                    timed_out,
                    aborted,
                    ..
                } => match (exit_code, timed_out, aborted) {
                    (Some(code), ..) => writeln!(stderr, "\n[{session_id}] exit {code}"),
                    (None, true, _) => writeln!(stderr, "\n[{session_id}] still running"),
                    (None, _, true) => writeln!(stderr, "\n[{session_id}] aborted"),
                    _ => writeln!(stderr, "\n[{session_id}] ended"),
                },
            };
        }
    });
}

async fn write_reply(stdout: &mut tokio::io::Stdout, reply: &serde_json::Value) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(reply).context("failed to encode reply")?;
    line.push('\n');
    stdout
        .write_all(line.as_bytes())
        .await
        .context("failed to write reply")?;
    stdout.flush().await.context("failed to flush stdout")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.schema {
        let def = ShellTool::<LocalSandbox>::definition();
        let schema = serde_json::to_string_pretty(&def.schema).context("failed to encode schema")?;
        println!("{schema}");
        return Ok(());
    }

    let config_path = resolve_config_path(&args);
    let mut config = Config::load(&config_path)?;
    if let Some(backend) = args.backend {
        config.shell.backend = backend;
    }
    config.validate().context("invalid configuration")?;
    tracing::info!(config = %config_path.display(), backend = ?config.shell.backend, "starting");

    let scope = args
        .scope
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let sandbox = Arc::new(LocalSandbox::new(&config.shell.shell));
    let registry = Arc::new(
        SessionRegistry::new(scope, sandbox, &config).context("no usable shell backend")?,
    );
    let guardrails =
        GuardrailChecker::from_config(&config.guardrails).context("invalid guardrail policies")?;

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    render_events(event_rx);
    let mut executor =
        ShellExecutor::new(Arc::clone(&registry), guardrails, &config).with_event_tx(event_tx);
    if config.audit.enabled {
        let logger = AuditLogger::from_config(&config.audit)
            .await
            .context("failed to open audit log")?;
        executor = executor.with_audit(logger);
    }
    let tool = ShellTool::new(Arc::new(executor));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match parse_call(&line) {
            Ok(call) => run_call(&tool, &call).await,
            Err(e) => serde_json::json!({
                "error": true,
                "kind": "invalid_params",
                "message": format!("{e:#}"),
            }),
        };
        write_reply(&mut stdout, &reply).await?;
    }

    registry.shutdown().await;
    Ok(())
}

/// Run one call; an interrupt aborts it and still yields its partial reply.
async fn run_call(tool: &ShellTool<LocalSandbox>, call: &ToolCall) -> serde_json::Value {
    let cancel = CancellationToken::new();
    let fut = tool.execute_tool_call(call, &cancel);
    tokio::pin!(fut);
    let mut listening = true;
    let reply: ShellReply = loop {
        tokio::select! {
            reply = &mut fut => break reply,
            signal = tokio::signal::ctrl_c(), if listening => {
                listening = false;
                match signal {
                    Ok(()) => {
                        tracing::info!("interrupt received, aborting current call");
                        cancel.cancel();
                    }
                    Err(e) => tracing::error!("failed to listen for ctrl-c: {e:#}"),
                }
            }
        }
    };
    reply.to_json()
}
