//! Volley - network load generator
//!
//! # Usage
//! ```bash
//! volley config.yaml
//! DEBUG=1 volley config.yaml    # verbose logging
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use volley_config::Configuration;
use volley_core::closed::ClosedWorkload;
use volley_core::open::OpenWorkload;
use volley_core::output::OutputPipeline;
use volley_core::{
    BaseWorkload, DummyNib, Nib, NibMaker, ProtoConf, Status, StringIndex, WorkloadMode,
};
use volley_http::{ConnPool, HttpNib};

/// Volley - network load generator
#[derive(Parser, Debug)]
#[command(name = "volley")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    let Some(config_path) = args.config else {
        eprintln!("Missing configuration file path");
        eprintln!();
        let _ = Args::command().print_help();
        std::process::exit(1);
    };

    tracing::info!("Volley v{}", env!("CARGO_PKG_VERSION"));

    let config = Configuration::load_file(&config_path)
        .with_context(|| format!("Failed to load config from {config_path:?}"))?;

    run(config).await
}

fn init_logging() {
    let level = match std::env::var("DEBUG") {
        Ok(v) if !v.is_empty() => "debug",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn run(config: Configuration) -> Result<()> {
    let status = Arc::new(Status::new());
    let reporter = status.start_reporter();

    let out_index = Arc::new(
        StringIndex::new(path_opt(&config.output.strings_file), false)
            .context("Failed to open the output string index")?,
    );
    let OutputPipeline { sender, drainer } = OutputPipeline::start(&config.output, out_index)
        .context("Failed to open the output sinks")?;

    let in_index = Arc::new(
        StringIndex::new(path_opt(&config.input.strings_file), true)
            .context("Failed to open the input string index")?,
    );

    let nib_maker = new_nib_maker(&config.protocol)?;

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    spawn_signal_handler(interrupt_tx);

    let base = BaseWorkload::new(
        nib_maker,
        sender.clone(),
        &config.input,
        &config.workers,
        Arc::clone(&status),
        in_index,
    )
    .context("Failed to open the payload input")?;

    let levels = config.workers.workload_schedule.clone();
    match config.workers.mode {
        WorkloadMode::Open => {
            OpenWorkload::new(
                base,
                levels,
                config.workers.starting_workers,
                config.workers.max_workers,
                interrupt_rx,
            )
            .run()
            .await?
        }
        WorkloadMode::Closed => ClosedWorkload::new(base, levels, interrupt_rx).run().await?,
    }

    // workers are gone; closing our sender lets the drainer finish
    drop(sender);
    drainer
        .await
        .context("Output pipeline died")?
        .context("Output sink failed")?;
    reporter.abort();
    Ok(())
}

fn path_opt(p: &str) -> Option<&std::path::Path> {
    if p.is_empty() {
        None
    } else {
        Some(std::path::Path::new(p))
    }
}

fn new_nib_maker(protocol: &ProtoConf) -> Result<NibMaker> {
    tracing::info!("Client protocol is: {}", protocol.driver);
    match protocol.driver.as_str() {
        "dummy" => Ok(Arc::new(|| Box::new(DummyNib) as Box<dyn Nib>)),
        "http" => {
            let pool = Arc::new(ConnPool::new(
                protocol.max_connections,
                protocol.timeout,
                protocol.tls.clone(),
            ));
            Ok(Arc::new(move || {
                Box::new(HttpNib::new(Arc::clone(&pool))) as Box<dyn Nib>
            }))
        }
        other => anyhow::bail!("Unsupported protocol driver: {other:?}"),
    }
}

/// Route SIGHUP/SIGINT/SIGTERM/SIGQUIT to the driver interrupt, then
/// leave with exit code 2.
fn spawn_signal_handler(interrupt: watch::Sender<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let install = |kind: SignalKind| match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!("Cannot install signal handler: {}", e);
                None
            }
        };
        let (Some(mut hup), Some(mut int), Some(mut term), Some(mut quit)) = (
            install(SignalKind::hangup()),
            install(SignalKind::interrupt()),
            install(SignalKind::terminate()),
            install(SignalKind::quit()),
        ) else {
            return;
        };

        tokio::select! {
            _ = hup.recv() => {}
            _ = int.recv() => {}
            _ = term.recv() => {}
            _ = quit.recv() => {}
        }

        tracing::info!("Got termination signal, interrupting the run");
        let _ = interrupt.send(true);
        std::process::exit(2);
    });
}
