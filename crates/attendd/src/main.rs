use anyhow::{Context, Result};
use attend_core::{DirectorySource, Envelope, Event, Repository};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod transport;

use config::Config;
use engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the event stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load().context("loading configuration")?;
    run(
        std::io::BufReader::new(std::io::stdin()),
        tokio::io::stdout(),
        config,
    )
    .await
}

/// Serve one host connection: inputs from `input`, events to `output`.
///
/// Returns once the input ends, the engine handles `shutdown`, or Ctrl-C arrives.
async fn run<R, W>(input: R, output: W, config: Config) -> Result<()>
where
    R: BufRead + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tracing::info!(
        identity_dir = %config.identity_dir.display(),
        detection_threshold = config.detection_threshold,
        max_distance = config.max_distance,
        min_gap = config.min_gap,
        "attendd starting"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(transport::write_events(events_rx, output));
    let emit = |event: Event| {
        let _ = events_tx.send(Envelope::now(event));
    };

    emit(Event::status("Initializing"));
    let repository = Arc::new(Repository::new(DirectorySource::new(
        &config.identity_dir,
        config.embedding_dim,
    )));
    // Runs before the engine thread exists, so nothing else touches the session yet.
    let repo = Arc::clone(&repository);
    let load = tokio::task::spawn_blocking(move || engine::load_events(&repo))
        .await
        .context("initial identity load")?;
    load.into_iter().for_each(emit);

    let mut engine = Engine::new(&config, repository)
        .start(events_tx.clone())
        .context("starting engine")?;
    emit(Event::status("Engine started"));

    let poller = config.command_file.clone().map(|path| {
        tokio::spawn(transport::poll_command_file(
            path,
            Duration::from_millis(config.command_poll_ms),
            engine.handle(),
        ))
    });

    let input_done =
        transport::spawn_input_reader(input, engine.handle()).context("starting input reader")?;

    tokio::select! {
        res = input_done => match res {
            Ok(Ok(())) => tracing::info!("host closed input"),
            Ok(Err(e)) => tracing::error!(error = %e, "input transport failed"),
            Err(_) => tracing::error!("input reader exited without reporting"),
        },
        _ = engine.exited() => tracing::info!("shutdown requested by host"),
        res = tokio::signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            tracing::info!("interrupted");
        }
    }

    if let Some(poller) = poller {
        poller.abort();
    }
    engine.shutdown().await;

    drop(events_tx);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "event transport failed"),
        Err(e) => tracing::error!(error = %e, "event writer task aborted"),
    }

    tracing::info!("attendd stopped");
    Ok(())
}
