use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use perftap::config::Config;
use perftap::logging::init_logging;
use perftap::task::{MonitoringTask, RunState};

#[derive(Debug, Parser)]
#[command(name = "perftap", version, about = "Stream performance counters to statsd or Graphite")]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, env = "PERFTAP_CONFIG", default_value = "perftap.yaml")]
    config: PathBuf,

    /// Overrides `logging.level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    /// Resolve the counter list, print it and exit without sampling.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging);

    println!();
    println!("╔══════════════════════════════════════════════════╗");
    println!("║   📈  PERFTAP COUNTER STREAM                     ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();

    // ── 1. Resolve counters ──────────────────────────────────────
    let definitions = config.sampling.definitions()?;
    println!(
        "📋 {} counters → {}:{}/{} ({:?})",
        definitions.len(),
        config.publishing.host,
        config.publishing.port,
        config.publishing.protocol,
        config.publishing.format,
    );
    for def in &definitions {
        println!("   {:>6}ms  {}  →  {}", def.interval.as_millis(), def.path, def.metric_name);
    }
    println!();

    if cli.check {
        config.publishing.validate()?;
        println!("   ✓ configuration valid");
        return Ok(());
    }

    // ── 2. Start the run ─────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let handle = MonitoringTask::new(config.sampling, config.publishing)
        .start(shutdown.clone())
        .await?;
    println!("   ✓ sampling (Ctrl+C to stop)");

    // ── 3. Run until Ctrl+C or a fatal error ─────────────────────
    let mut state = handle.subscribe();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for Ctrl+C");
            }
            info!("shutdown requested");
        }
        _ = state.wait_for(|s| *s == RunState::Stopped) => {}
    }

    let summary = handle.stop().await?;
    info!(
        summary = %serde_json::to_string(&summary).unwrap_or_default(),
        "monitoring run finished"
    );
    Ok(())
}
