//! featurestore-worker — task queue consumer entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Open the task queue
//!   6. Wire collaborators into the store lifecycle and dispatcher
//!   7. Spawn Ctrl-C → shutdown signal watcher
//!   8. Run the dispatcher until shutdown

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use featurestore_worker::dispatch::{QueueNames, TaskDispatcher};
use featurestore_worker::error::AppError;
use featurestore_worker::index::cache::IndexCache;
use featurestore_worker::store::StoreLifecycle;
use featurestore_worker::store::plaintext::{
    DEFAULT_REJECT_THROTTLE, EchoResponder, FixedThresholdTuner, PlainTextIngestor,
};
use featurestore_worker::{config, logger, queue};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    let force_cli_level = args.log_level.is_some();
    logger::parse_level(effective_log_level)?;
    logger::init(effective_log_level, force_cli_level, config.log_file.as_deref())?;

    info!(
        worker = %config.worker_name,
        base_dir = %config.base_dir.display(),
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    std::fs::create_dir_all(&config.base_dir)?;

    let queue = queue::open(&config.queue)?;
    info!(
        backend = ?config.queue.backend,
        path = %config.queue.path.display(),
        namespace = %config.queue.namespace,
        "queue opened"
    );

    let lifecycle = StoreLifecycle::new(
        &config.base_dir,
        &config.template_path,
        config.index.case_insensitive,
        Arc::new(PlainTextIngestor::new(
            config.ingest.chunk_size,
            config.ingest.extensions.clone(),
        )),
        Arc::new(FixedThresholdTuner::new(DEFAULT_REJECT_THROTTLE)),
    );
    let dispatcher = TaskDispatcher::new(
        queue,
        QueueNames::from(&config.queue),
        lifecycle,
        Arc::new(EchoResponder::default()),
        IndexCache::new(config.index.cache_size, config.index.case_insensitive),
    )
    .with_boost_limit(config.index.topk);

    // Shared shutdown token — Ctrl-C cancels it.
    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received — initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    dispatcher.run(shutdown).await?;

    info!("worker stopped");
    Ok(())
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: featurestore-worker [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    CliArgs { log_level: logger::level_for_verbosity(verbosity), config_path }
}
