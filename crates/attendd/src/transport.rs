//! Host-facing wire: JSON lines in on stdin, JSON lines out on stdout,
//! plus an optional marker file polled for commands.
//!
//! Transports only parse and enqueue. All state changes happen on the engine thread.

use crate::engine::{EngineError, EngineHandle, EngineInput};
use attend_core::{Command, Envelope, Observation};
use serde::Deserialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Structured inbound line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Observation {
        #[serde(default)]
        embeddings: Observation,
    },
    Command {
        command: String,
    },
}

/// Turn one inbound line into an engine input. Blank lines yield `None`.
///
/// JSON objects are structured messages; anything else is a bare command word.
pub fn parse_line(line: &str) -> Option<EngineInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let word = if line.starts_with('{') {
        match serde_json::from_str::<WireMessage>(line) {
            Ok(WireMessage::Observation { embeddings }) => {
                return Some(EngineInput::Observation(embeddings))
            }
            Ok(WireMessage::Command { command }) => command,
            Err(e) => return Some(EngineInput::Fault(format!("malformed message: {e}"))),
        }
    } else {
        line.to_string()
    };

    Some(command_input(&word))
}

fn command_input(word: &str) -> EngineInput {
    match word.parse::<Command>() {
        Ok(command) => EngineInput::Command(command),
        Err(e) => EngineInput::Unrecognized(e.0),
    }
}

/// Forward every inbound line to the engine until EOF.
///
/// Blocking: runs on its own thread so a pending read never holds up shutdown.
pub fn read_inputs<R: BufRead>(reader: R, engine: &EngineHandle) -> Result<(), TransportError> {
    for line in reader.lines() {
        if let Some(input) = parse_line(&line?) {
            engine.blocking_send(input)?;
        }
    }
    tracing::info!("input stream closed");
    Ok(())
}

/// Read `reader` on a detached thread. The receiver resolves when the stream ends
/// or the engine goes away.
///
/// The thread is never joined; a host that keeps stdin open must not keep the
/// daemon alive after shutdown.
pub fn spawn_input_reader<R>(
    reader: R,
    engine: EngineHandle,
) -> std::io::Result<oneshot::Receiver<Result<(), TransportError>>>
where
    R: BufRead + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("attend-input".into())
        .spawn(move || {
            let _ = done_tx.send(read_inputs(reader, &engine));
        })?;
    Ok(done_rx)
}

/// Write each event as one JSON line, flushing after every event.
pub async fn write_events<W>(
    mut events: mpsc::UnboundedReceiver<Envelope>,
    mut writer: W,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = events.recv().await {
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Poll a marker file for commands: read it, delete it, enqueue each line.
pub async fn poll_command_file(
    path: PathBuf,
    interval: Duration,
    engine: EngineHandle,
) -> Result<(), TransportError> {
    tracing::info!(path = %path.display(), ?interval, "polling command file");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                engine
                    .send(EngineInput::Fault(format!("Command check error: {e}")))
                    .await?;
                continue;
            }
        };
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove command file");
        }

        for word in text.lines().map(str::trim).filter(|w| !w.is_empty()) {
            engine
                .send(EngineInput::Notice(format!("Received command: {word}")))
                .await?;
            engine.send(command_input(word)).await?;
        }
    }
}
