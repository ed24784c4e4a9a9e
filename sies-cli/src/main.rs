//! Demonstration entrypoint for SIES: spawns a worker subprocess (itself,
//! re-invoked under a hidden marker argument), drives one `execute()`
//! against it through a `Session`, and prints the streamed `output`/
//! `result`/`error` messages. Not part of the core's contract — a thin
//! driver in the shape of `ahma_http_bridge::main` / `ahma_mcp::shell::bin`.

mod evaluator;
mod worker_mode;

use clap::Parser;
use owo_colors::OwoColorize;
use sies_session::{ProcessSpawner, Session, SessionConfig, SpawnSpec};
use sies_wire::{Message, MessageBody, StreamKind};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Argument this binary re-invokes itself with to act as the worker
/// subprocess instead of the controller (self-reexec, avoiding a second
/// compiled artifact for the demonstration).
const WORKER_MARKER: &str = "--sies-worker-internal";

/// Run a worker subprocess against one piece of code and print what comes
/// back over the wire.
#[derive(Parser, Debug)]
#[command(name = "sies-cli", version, about)]
struct Args {
    /// Code for the toy evaluator: a JSON literal, `input:<prompt>`, or
    /// `sleep:<ms>`.
    code: String,

    /// Path to the worker executable. Defaults to this same binary,
    /// re-invoked under the worker marker.
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// `RUST_LOG`-style filter applied when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Colorize result/error output.
    #[arg(long)]
    colored_output: bool,

    /// How long to wait for the worker's startup `ready` before failing.
    #[arg(long, default_value = "5000")]
    ready_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some(WORKER_MARKER) {
        init_logging("warn");
        return worker_mode::run().await;
    }

    let args = Args::parse();
    init_logging(&args.log_level);
    run_controller(args).await
}

/// Always logs to stderr: the worker's stdout is the framed wire protocol,
/// and keeping the controller's writer consistent avoids two code paths.
fn init_logging(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
    );
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_controller(args: Args) -> anyhow::Result<()> {
    let worker_bin = match args.worker_bin {
        Some(path) => path,
        None => std::env::current_exe()?,
    };

    let spec = SpawnSpec::new(worker_bin).arg(WORKER_MARKER);
    let spawner = Arc::new(ProcessSpawner::new(spec));
    let config = SessionConfig {
        ready_timeout: Duration::from_millis(args.ready_timeout_ms),
        ..SessionConfig::default()
    };

    let session = Session::new(sies_session::SessionId::new(), spawner, config);
    session.start().await?;
    tracing::info!(session_id = %session.id(), "worker session ready");

    let mut stream = session.execute(args.code, None, None).await?;
    use futures::StreamExt;
    while let Some(msg) = stream.next().await {
        print_message(&msg, args.colored_output);
    }
    std::io::stdout().flush().ok();

    session.shutdown().await?;
    Ok(())
}

fn print_message(msg: &Message, colored: bool) {
    match &msg.body {
        MessageBody::Output { stream, data, .. } => match stream {
            StreamKind::Stdout => {
                print!("{data}");
                std::io::stdout().flush().ok();
            }
            StreamKind::Stderr => {
                eprint!("{data}");
            }
        },
        MessageBody::Input { prompt, .. } => {
            eprintln!("(worker requested input, unanswered by this demo: {prompt:?})");
        }
        MessageBody::Result { repr, execution_time_ms, .. } => {
            let line = format!("=> {repr}  ({execution_time_ms} ms)");
            if colored {
                println!("{}", line.green());
            } else {
                println!("{line}");
            }
        }
        MessageBody::Error { exception_type, message, .. } => {
            let line = format!("!! {exception_type}: {message}");
            if colored {
                eprintln!("{}", line.red());
            } else {
                eprintln!("{line}");
            }
        }
        _ => {}
    }
}
