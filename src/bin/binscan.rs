//! binscan - container image audit CLI
//!
//! ## Usage
//!
//! ```sh
//! binscan [OPTIONS] <IMAGE>...
//! binscan --target-bins sh,bash --target-paths /bin,/usr/bin alpine:3.19
//! binscan --match '{{ mode == "4755" }}' --format '{{ ref }}: {{ found | join(" ") }}' debian
//! ```
//!
//! ## Exit Status
//!
//! - `0` - every reference was attempted; per-image errors are in the output
//! - `1` - startup failure (bad flags or templates, store unavailable)

use binscan::constants::ENV_LOG;
use binscan::matcher::RegexCache;
use binscan::{Cli, Orchestrator, Renderer, RunSummary, store};
use clap::Parser;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging(debug: bool) {
    let level = if debug { LevelFilter::DEBUG } else { LevelFilter::WARN };
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var(ENV_LOG)
        .from_env_lossy();
    if let Ok(directive) = "sqlx=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry().with(layer).with(filter).init();
}

async fn run(cli: Cli) -> binscan::Result<RunSummary> {
    let config = cli.into_config()?;
    debug!(?config, "configuration");

    let cancel = CancellationToken::new();
    let rule = config.build_rule(Arc::new(RegexCache::new()), &cancel)?;
    let renderer = Renderer::new(&config.format)?;

    std::fs::create_dir_all(&config.scratch).map_err(|e| {
        binscan::Error::InvalidConfig(format!("error creating {}: {}", config.scratch.display(), e))
    })?;
    let store = store::open(&config.store).await?;

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling remaining scans");
                cancel.cancel();
            }
        }
    });

    let orchestrator = Orchestrator::new(
        store.service,
        Arc::new(rule),
        Arc::new(renderer),
        config.pull.clone(),
        config.scratch.clone(),
        config.workers,
        cancel,
    );

    let summary = orchestrator
        .run_all(&config.references, |_, line| {
            let mut out = std::io::stdout().lock();
            if let Err(e) = writeln!(out, "{}", line) {
                warn!(error = %e, "error writing result");
            }
        })
        .await;
    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
