//! detectd - stream detection daemon
//!
//! This daemon:
//! 1. Loads and validates the pipeline configuration
//! 2. Starts the worker pool, the hook notifier and one source per stream
//! 3. Logs a counter snapshot every `--stats-interval` seconds
//! 4. Stops the pipeline cleanly on Ctrl-C

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use std::path::PathBuf;
use std::time::Duration;

use stream_detect::{PipelineConfig, PipelineError, PipelineSupervisor};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera object detection pipeline")]
struct Args {
    /// Pipeline configuration file (.json or .toml).
    #[arg(long, env = "DETECT_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `stream_detect=debug`. RUST_LOG wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between counter snapshots in the log. 0 disables them.
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    if let Err(err) = run(&args) {
        let code = match err.downcast_ref::<PipelineError>() {
            Some(pipeline) => pipeline.status_code(),
            None => -1,
        };
        log::error!("detectd failed: {:#}", err);
        std::process::exit(code.abs());
    }
}

fn run(args: &Args) -> Result<()> {
    let config =
        PipelineConfig::load(args.config.as_deref()).map_err(PipelineError::Config)?;
    log::info!(
        "detectd {} starting: models={:?} streams={} hook={}",
        env!("CARGO_PKG_VERSION"),
        config.model_ids(),
        config.streams.len(),
        config.hook_http_url
    );

    let supervisor = PipelineSupervisor::new(config);
    supervisor.start()?;

    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("detectd running, waiting for shutdown signal (Ctrl-C)...");
    let interval = match args.stats_interval {
        0 => Duration::MAX,
        secs => Duration::from_secs(secs),
    };
    loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let stats = supervisor.stats();
                match serde_json::to_string(&stats) {
                    Ok(json) => log::info!("stats {}", json),
                    Err(err) => log::warn!("failed to serialize stats: {}", err),
                }
            }
            _ => break,
        }
    }

    log::info!("shutdown signal received, stopping pipeline...");
    supervisor.stop()?;
    let stats = supervisor.stats();
    log::info!(
        "final: delivered={} delivery_failures={} backlog_dropped={}",
        stats.notifier.delivered,
        stats.notifier.failures,
        stats.notifier.backlog_dropped
    );
    Ok(())
}
