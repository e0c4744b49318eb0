//! Run a periodic task described by a TOML file on the standalone backend.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::info;

use periodic_runtime::{PeriodicTask, TaskConfig, TickErrorPolicy};

#[derive(Debug, Parser)]
#[command(
    name = "periodic-run",
    version,
    about = "Run a periodic task until it stops itself",
    after_help = "Examples:\n  periodic-run task.toml\n  periodic-run task.toml --duration-ms 5000 --period-ms 250"
)]
struct Cli {
    /// Task configuration file with a [task] section.
    config: PathBuf,
    /// Stop the task after this many milliseconds if it is still running.
    #[arg(long)]
    duration_ms: Option<u64>,
    /// Override task.period_ms.
    #[arg(long)]
    period_ms: Option<u64>,
    /// Override task.on_error (continue | halt).
    #[arg(long)]
    on_error: Option<String>,
    /// Print the final report as pretty JSON.
    #[arg(long)]
    pretty: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = TaskConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(period_ms) = cli.period_ms {
        config.period = Duration::from_millis(period_ms);
    }
    if let Some(policy) = cli.on_error.as_deref() {
        config.on_error = TickErrorPolicy::parse(policy)?;
    }
    config.running = false;

    let name = config.name.clone();
    let ticks = Arc::new(AtomicU64::new(0));
    let ticks_cb = ticks.clone();
    let task = PeriodicTask::builder()
        .config(config)
        .callback(move || {
            let tick = ticks_cb.fetch_add(1, Ordering::SeqCst) + 1;
            info!(task = %name, tick, "tick");
            Ok::<(), std::convert::Infallible>(())
        })
        .build()?;
    if task.count().is_none() && task.timeout().is_none() && cli.duration_ms.is_none() {
        anyhow::bail!("task never stops on its own; set task.count, task.timeout_ms or --duration-ms");
    }
    task.start()?;

    let deadline = cli
        .duration_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let poll = task.period().min(Duration::from_millis(50));
    while task.is_running() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!(task = %task.name(), "duration elapsed, stopping");
            task.stop();
            break;
        }
        std::thread::sleep(poll);
    }

    let report = serde_json::json!({
        "ticks": ticks.load(Ordering::SeqCst),
        "task": task.snapshot(),
    });
    let json = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}
