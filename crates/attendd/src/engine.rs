use crate::config::Config;
use attend_core::{
    Command, Envelope, Event, NearestNeighborMatcher, Observation, Repository, SessionMachine,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Inputs are applied strictly in arrival order.
const INPUT_QUEUE_DEPTH: usize = 64;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Everything the engine thread consumes, in one ordered queue.
#[derive(Debug)]
pub enum EngineInput {
    /// One frame's embeddings from the capture service.
    Observation(Observation),
    Command(Command),
    /// A command word nobody recognized. Reported, otherwise ignored.
    Unrecognized(String),
    /// Informational message from a transport, reported as `status`.
    Notice(String),
    /// Transport-level problem, reported as `error`.
    Fault(String),
}

/// Whether the engine loop keeps going after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Clone-safe handle for feeding the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineInput>,
}

impl EngineHandle {
    pub async fn send(&self, input: EngineInput) -> Result<(), EngineError> {
        self.tx
            .send(input)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// For transports running on plain OS threads.
    pub fn blocking_send(&self, input: EngineInput) -> Result<(), EngineError> {
        self.tx
            .blocking_send(input)
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn command(&self, command: Command) -> Result<(), EngineError> {
        self.send(EngineInput::Command(command)).await
    }

    /// Handle backed by a plain channel, for exercising transports without a thread.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<EngineInput>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Reload the repository and describe the outcome as host events.
pub fn load_events(repository: &Repository) -> Vec<Event> {
    match repository.reload() {
        Ok(summary) => {
            let mut events: Vec<Event> = summary
                .skipped
                .iter()
                .map(|s| Event::status(format!("Error loading {s}")))
                .collect();
            events.push(if summary.loaded > 0 {
                Event::status(format!(
                    "Loaded {} identities for recognition",
                    summary.loaded
                ))
            } else {
                Event::status("No identities found with face data")
            });
            events
        }
        Err(e) => vec![Event::error(format!("Failed to load identities: {e}"))],
    }
}

/// The single owner of the sign-in session.
pub struct Engine {
    machine: SessionMachine<NearestNeighborMatcher>,
    repository: Arc<Repository>,
}

impl Engine {
    pub fn new(config: &Config, repository: Arc<Repository>) -> Self {
        Self {
            machine: SessionMachine::new(
                config.session_config(),
                NearestNeighborMatcher::new(config.match_policy()),
            ),
            repository,
        }
    }

    /// Move the engine onto its own OS thread and start consuming inputs.
    pub fn start(
        self,
        events: mpsc::UnboundedSender<Envelope>,
    ) -> Result<RunningEngine, EngineError> {
        let (tx, rx) = mpsc::channel::<EngineInput>(INPUT_QUEUE_DEPTH);
        let (exit_tx, exit_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("attend-engine".into())
            .spawn(move || {
                self.run(rx, &events);
                let _ = exit_tx.send(());
            })?;

        Ok(RunningEngine {
            handle: EngineHandle { tx },
            thread: Some(thread),
            exited: Some(exit_rx),
        })
    }

    fn run(mut self, mut rx: mpsc::Receiver<EngineInput>, events: &mpsc::UnboundedSender<Envelope>) {
        tracing::info!("engine thread started");
        while let Some(input) = rx.blocking_recv() {
            let (produced, flow) = self.apply(input);
            for event in produced {
                // A closed sink means the host is gone; keep the session consistent anyway.
                let _ = events.send(Envelope::now(event));
            }
            if flow == Flow::Exit {
                break;
            }
        }
        tracing::info!("engine thread exiting");
    }

    /// Apply one input and return the events it produced, in order.
    fn apply(&mut self, input: EngineInput) -> (Vec<Event>, Flow) {
        match input {
            EngineInput::Observation(observation) => {
                let snapshot = self.repository.snapshot();
                let events = self.machine.tick(&observation, &snapshot);
                tracing::trace!(feedback = ?self.machine.feedback(&observation), "frame processed");
                (events, Flow::Continue)
            }
            EngineInput::Command(command) => {
                tracing::debug!(%command, "command");
                match command {
                    Command::Start => (self.machine.start(), Flow::Continue),
                    Command::Stop => (self.machine.stop(), Flow::Continue),
                    Command::Confirm => (self.machine.confirm(), Flow::Continue),
                    Command::Reload => (load_events(&self.repository), Flow::Continue),
                    Command::Shutdown => {
                        let mut events = self.machine.stop();
                        events.push(Event::status("Shutting down"));
                        (events, Flow::Exit)
                    }
                }
            }
            EngineInput::Unrecognized(word) => {
                tracing::warn!(command = %word, "unrecognized command ignored");
                (
                    vec![Event::error(format!("unrecognized command: {word}"))],
                    Flow::Continue,
                )
            }
            EngineInput::Notice(message) => (vec![Event::status(message)], Flow::Continue),
            EngineInput::Fault(message) => (vec![Event::error(message)], Flow::Continue),
        }
    }
}

/// A started engine: its input handle plus the thread to join on shutdown.
pub struct RunningEngine {
    handle: EngineHandle,
    thread: Option<std::thread::JoinHandle<()>>,
    exited: Option<oneshot::Receiver<()>>,
}

impl RunningEngine {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Resolves once the engine thread has left its loop (e.g. after `shutdown`).
    pub async fn exited(&mut self) {
        match self.exited.as_mut() {
            Some(rx) => {
                let _ = rx.await;
                self.exited = None;
            }
            None => std::future::pending().await,
        }
    }

    /// Stop the engine thread and wait for it to finish.
    pub async fn shutdown(mut self) {
        // Already-exited engines drop the command; that is fine.
        let _ = self.handle.command(Command::Shutdown).await;
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => tracing::info!("engine stopped"),
                Ok(Err(_)) => tracing::error!("engine thread panicked"),
                Err(e) => tracing::error!(error = %e, "failed to join engine thread"),
            }
        }
    }
}
