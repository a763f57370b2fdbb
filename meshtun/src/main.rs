//! meshtun: mesh TUN interface controller daemon.
//!
//! Reads newline-delimited JSON messages from the mesh daemon on stdin:
//!
//! ```text
//! {"addresses":[{"address":[253,0,...],"prefix_length":64,"is_mesh_local":true,"is_preferred":true}]}
//! {"prefixes":[{"prefix":[253,0,13,184,0,0,0,1],"prefix_length":64}]}
//! "daemon_died"
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use meshtun::config::DEFAULT_INTERFACE;
use meshtun::link::MTU;
use meshtun::service::{self, ControllerHandle};
use meshtun::{
    ControllerConfig, ControllerDispatcher, DaemonMessage, SequenceCounter, SystemBackend,
    TunController, TunDevice,
};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Mesh TUN interface controller
#[derive(Parser, Debug)]
#[command(name = "meshtun", version, about)]
struct Args {
    /// Name of the mesh TUN interface
    #[arg(long, default_value = DEFAULT_INTERFACE)]
    interface: String,

    /// Link MTU
    #[arg(long, default_value_t = MTU)]
    mtu: u32,

    /// Already-open TUN descriptor handed over by the host (the device is
    /// created when omitted)
    #[arg(long)]
    tun_fd: Option<RawFd>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshtun=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ControllerConfig::new(&args.interface, args.mtu)?;

    let device = match args.tun_fd {
        Some(fd) => {
            // SAFETY: the host hands this descriptor over to us and does not
            // use or close it afterwards.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            TunDevice::adopt(config.interface_name(), fd)?
        }
        None => TunDevice::create(config.interface_name(), config.mtu())
            .context("Do you have CAP_NET_ADMIN?")?,
    };

    let mut controller = TunController::new(config, SystemBackend, SequenceCounter::new());
    controller.initialize(device)?;
    controller.set_interface_up(true)?;

    let (handle, command_rx) = service::channel();
    let dispatcher = tokio::spawn(ControllerDispatcher::new(command_rx, controller).run());

    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!(interface = %args.interface, "Waiting for mesh daemon snapshots on stdin");
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = dispatch_line(&handle, &line).await {
                        error!(error = %e, "Controller task stopped");
                        break;
                    }
                }
                Ok(None) => {
                    info!("Input closed, shutting down...");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            },
        }
    }

    if let Err(e) = handle.destroy().await {
        warn!(error = %e, "Controller already stopped");
    }
    drop(handle);
    dispatcher.await.context("controller task panicked")?;

    info!("Stopped");
    Ok(())
}

async fn dispatch_line(handle: &ControllerHandle, line: &str) -> Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let message: DaemonMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Skipping malformed message");
            return Ok(());
        }
    };
    match message {
        DaemonMessage::Addresses(snapshot) => handle.update_addresses(snapshot).await?,
        DaemonMessage::Prefixes(snapshot) => handle.update_prefixes(snapshot).await?,
        DaemonMessage::DaemonDied => handle.daemon_died().await?,
    }
    Ok(())
}
