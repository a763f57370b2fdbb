//! Serial command queue in front of the controller.
//!
//! Every mutation of the mirrored state happens on the dispatcher task, one
//! command at a time. Callers only hold a [`ControllerHandle`].

mod dispatcher;

pub use dispatcher::ControllerDispatcher;

use crate::error::ControllerError;
use crate::link::LinkProperties;
use crate::snapshot::{AddressInfo, OnMeshPrefixConfig};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Depth of the command queue.
pub const COMMAND_QUEUE_DEPTH: usize = 64;

/// Commands that can be sent to the controller task.
#[derive(Debug)]
pub enum Command {
    UpdateAddresses(Vec<AddressInfo>),
    UpdatePrefixes(Vec<OnMeshPrefixConfig>),
    DaemonDied,
    SetUp {
        up: bool,
        responder: oneshot::Sender<Result<(), ControllerError>>,
    },
    LinkProperties {
        responder: oneshot::Sender<LinkProperties>,
    },
    Destroy {
        responder: oneshot::Sender<()>,
    },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("controller task has stopped")]
    Closed,

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Cloneable sender side of the command queue.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.tx.send(command).await.map_err(|_| ServiceError::Closed)
    }

    pub async fn update_addresses(&self, snapshot: Vec<AddressInfo>) -> Result<(), ServiceError> {
        self.send(Command::UpdateAddresses(snapshot)).await
    }

    pub async fn update_prefixes(
        &self,
        snapshot: Vec<OnMeshPrefixConfig>,
    ) -> Result<(), ServiceError> {
        self.send(Command::UpdatePrefixes(snapshot)).await
    }

    pub async fn daemon_died(&self) -> Result<(), ServiceError> {
        self.send(Command::DaemonDied).await
    }

    pub async fn set_up(&self, up: bool) -> Result<(), ServiceError> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::SetUp { up, responder }).await?;
        rx.await.map_err(|_| ServiceError::Closed)??;
        Ok(())
    }

    /// Snapshot of the mirrored addresses and routes, after every command
    /// queued before this one has been applied.
    pub async fn link_properties(&self) -> Result<LinkProperties, ServiceError> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::LinkProperties { responder }).await?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    pub async fn destroy(&self) -> Result<(), ServiceError> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::Destroy { responder }).await?;
        rx.await.map_err(|_| ServiceError::Closed)
    }
}

/// Create the queue: a handle for callers and the receiver for the dispatcher.
pub fn channel() -> (ControllerHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    (ControllerHandle::new(tx), rx)
}
