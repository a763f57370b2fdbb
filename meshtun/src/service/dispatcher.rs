//! Controller dispatcher - drains the command queue.

use super::Command;
use crate::backend::LinkBackend;
use crate::controller::TunController;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Owns the controller and applies queued commands in order.
pub struct ControllerDispatcher<B: LinkBackend> {
    command_rx: mpsc::Receiver<Command>,
    controller: TunController<B>,
}

impl<B: LinkBackend> ControllerDispatcher<B> {
    pub fn new(command_rx: mpsc::Receiver<Command>, controller: TunController<B>) -> Self {
        Self {
            command_rx,
            controller,
        }
    }

    /// Run until every handle is dropped or a `Destroy` command arrives.
    /// The controller is destroyed on the way out either way.
    pub async fn run(mut self) -> TunController<B> {
        info!("ControllerDispatcher: waiting for commands");

        while let Some(cmd) = self.command_rx.recv().await {
            if !self.handle_command(cmd) {
                break;
            }
        }

        self.controller.destroy();
        info!("ControllerDispatcher: shutting down");
        self.controller
    }

    /// Returns false once the controller has been destroyed.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::UpdateAddresses(snapshot) => {
                debug!(entries = snapshot.len(), "ControllerDispatcher: address snapshot");
                self.controller.update_addresses(&snapshot);
            }
            Command::UpdatePrefixes(snapshot) => {
                debug!(entries = snapshot.len(), "ControllerDispatcher: prefix snapshot");
                self.controller.update_prefixes(&snapshot);
            }
            Command::DaemonDied => {
                self.controller.on_daemon_died();
            }
            Command::SetUp { up, responder } => {
                let _ = responder.send(self.controller.set_interface_up(up));
            }
            Command::LinkProperties { responder } => {
                let _ = responder.send(self.controller.link_properties().clone());
            }
            Command::Destroy { responder } => {
                self.controller.destroy();
                let _ = responder.send(());
                return false;
            }
        }
        true
    }
}
