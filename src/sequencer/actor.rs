//! Actor wrapper running the [`Sequencer`] on a tokio task.
//!
//! The actor is the single owner of the Sequencer. One `tokio::select!` loop
//! multiplexes three sources:
//!
//! ```text
//! SequencerHandle ──mpsc──┐
//! Transport events ───────┼──> SequencerActor ──broadcast──> subscribers
//! Action timer deadline ──┘
//! ```
//!
//! Host commands carry a oneshot sender for the response. Each command variant
//! has a helper that returns the command together with its receiver:
//!
//! ```rust,ignore
//! let (cmd, rx) = SequencerCommand::run();
//! cmd_tx.send(cmd).await?;
//! rx.await??;
//! ```
//!
//! Most hosts use [`SequencerHandle`] instead of building commands by hand.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::descriptor::Descriptor;
use crate::error::{AppResult, DaveError};
use crate::transport::TransportEvent;

use super::{RunEstimate, Sequencer, SequencerEvent, SequencerStatus};

/// Commands accepted by the [`SequencerActor`].
#[derive(Debug)]
pub enum SequencerCommand {
    /// Replace the queue.
    Load {
        /// Descriptors to build
        descriptors: Vec<Descriptor>,
        /// Estimate for the new queue
        response: oneshot::Sender<AppResult<RunEstimate>>,
    },
    /// Start a run.
    Run {
        /// Result of starting
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Pause at the next boundary.
    Pause {
        /// Result of the request
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Resume a paused run.
    Resume {
        /// Result of resuming
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Abort the run.
    Abort {
        /// Result of aborting
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Toggle dry-run mode.
    SetTestMode {
        /// New mode
        enabled: bool,
        /// Result of the change
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Snapshot the status.
    Status {
        /// Current status
        response: oneshot::Sender<SequencerStatus>,
    },
    /// Estimate for the whole queue.
    Estimate {
        /// Current estimate
        response: oneshot::Sender<RunEstimate>,
    },
    /// Receive lifecycle events.
    Subscribe {
        /// New event receiver
        response: oneshot::Sender<broadcast::Receiver<SequencerEvent>>,
    },
    /// Abort any run and stop the actor.
    Shutdown {
        /// Acknowledgement
        response: oneshot::Sender<()>,
    },
}

impl SequencerCommand {
    /// Create a `Load` command.
    pub fn load(descriptors: Vec<Descriptor>) -> (Self, oneshot::Receiver<AppResult<RunEstimate>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Load {
                descriptors,
                response: tx,
            },
            rx,
        )
    }

    /// Create a `Run` command.
    pub fn run() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Run { response: tx }, rx)
    }

    /// Create a `Pause` command.
    pub fn pause() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Create a `Resume` command.
    pub fn resume() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Create an `Abort` command.
    pub fn abort() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    /// Create a `SetTestMode` command.
    pub fn set_test_mode(enabled: bool) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetTestMode {
                enabled,
                response: tx,
            },
            rx,
        )
    }

    /// Create a `Status` command.
    pub fn status() -> (Self, oneshot::Receiver<SequencerStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::Status { response: tx }, rx)
    }

    /// Create an `Estimate` command.
    pub fn estimate() -> (Self, oneshot::Receiver<RunEstimate>) {
        let (tx, rx) = oneshot::channel();
        (Self::Estimate { response: tx }, rx)
    }

    /// Create a `Subscribe` command.
    pub fn subscribe() -> (Self, oneshot::Receiver<broadcast::Receiver<SequencerEvent>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Subscribe { response: tx }, rx)
    }

    /// Create a `Shutdown` command.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Owner of a [`Sequencer`] running on its own task.
pub struct SequencerActor {
    sequencer: Sequencer,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl SequencerActor {
    /// Create an actor from a Sequencer and its transport's event stream.
    pub fn new(
        sequencer: Sequencer,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            sequencer,
            transport_events,
        }
    }

    /// Spawn the actor and return a handle to it.
    ///
    /// # Arguments
    ///
    /// * `sequencer` - The engine to drive.
    /// * `transport_events` - Receiver fed by the transport the Sequencer owns.
    /// * `command_capacity` - Bound of the command channel.
    pub fn spawn(
        sequencer: Sequencer,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        command_capacity: usize,
    ) -> (SequencerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(command_capacity.max(1));
        let actor = Self::new(sequencer, transport_events);
        let task = tokio::spawn(actor.run(command_rx));
        (SequencerHandle { command_tx }, task)
    }

    /// Run the event loop until `Shutdown` or all handles are dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SequencerCommand>) {
        info!("Sequencer actor started");
        let mut transport_open = true;

        loop {
            let deadline = self.sequencer.next_deadline();
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(SequencerCommand::Shutdown { response }) => {
                            let _ = self.sequencer.abort();
                            let _ = response.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("All sequencer handles dropped");
                            let _ = self.sequencer.abort();
                            break;
                        }
                    }
                }
                event = self.transport_events.recv(), if transport_open => {
                    match event {
                        Some(event) => self.sequencer.handle_event(event),
                        None => {
                            debug!("Transport event stream closed");
                            transport_open = false;
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    self.sequencer.poll_timers(Instant::now());
                }
            }
        }

        info!("Sequencer actor stopped");
    }

    fn handle_command(&mut self, command: SequencerCommand) {
        match command {
            SequencerCommand::Load {
                descriptors,
                response,
            } => {
                let _ = response.send(self.sequencer.load(descriptors));
            }
            SequencerCommand::Run { response } => {
                let _ = response.send(self.sequencer.run());
            }
            SequencerCommand::Pause { response } => {
                let _ = response.send(self.sequencer.pause());
            }
            SequencerCommand::Resume { response } => {
                let _ = response.send(self.sequencer.resume());
            }
            SequencerCommand::Abort { response } => {
                let _ = response.send(self.sequencer.abort());
            }
            SequencerCommand::SetTestMode { enabled, response } => {
                let _ = response.send(self.sequencer.set_test_mode(enabled));
            }
            SequencerCommand::Status { response } => {
                let _ = response.send(self.sequencer.status());
            }
            SequencerCommand::Estimate { response } => {
                let _ = response.send(self.sequencer.estimate());
            }
            SequencerCommand::Subscribe { response } => {
                let _ = response.send(self.sequencer.subscribe());
            }
            SequencerCommand::Shutdown { response } => {
                let _ = response.send(());
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable async front end to a running [`SequencerActor`].
#[derive(Debug, Clone)]
pub struct SequencerHandle {
    command_tx: mpsc::Sender<SequencerCommand>,
}

impl SequencerHandle {
    async fn request<T>(
        &self,
        (command, rx): (SequencerCommand, oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DaveError::ActorClosed)?;
        rx.await.map_err(|_| DaveError::ActorClosed)
    }

    /// Replace the queue.
    pub async fn load(&self, descriptors: Vec<Descriptor>) -> AppResult<RunEstimate> {
        self.request(SequencerCommand::load(descriptors)).await?
    }

    /// Start a run.
    pub async fn run(&self) -> AppResult<()> {
        self.request(SequencerCommand::run()).await?
    }

    /// Pause at the next boundary.
    pub async fn pause(&self) -> AppResult<()> {
        self.request(SequencerCommand::pause()).await?
    }

    /// Resume a paused run.
    pub async fn resume(&self) -> AppResult<()> {
        self.request(SequencerCommand::resume()).await?
    }

    /// Abort the run.
    pub async fn abort(&self) -> AppResult<()> {
        self.request(SequencerCommand::abort()).await?
    }

    /// Toggle dry-run mode.
    pub async fn set_test_mode(&self, enabled: bool) -> AppResult<()> {
        self.request(SequencerCommand::set_test_mode(enabled)).await?
    }

    /// Snapshot the status.
    pub async fn status(&self) -> AppResult<SequencerStatus> {
        self.request(SequencerCommand::status()).await
    }

    /// Estimate for the whole queue, valid Actions only.
    pub async fn estimate(&self) -> AppResult<RunEstimate> {
        self.request(SequencerCommand::estimate()).await
    }

    /// Receive lifecycle events from now on.
    pub async fn subscribe(&self) -> AppResult<broadcast::Receiver<SequencerEvent>> {
        self.request(SequencerCommand::subscribe()).await
    }

    /// Abort any run and stop the actor.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(SequencerCommand::shutdown()).await
    }
}
