//! meshtun: keeps a mesh TUN interface in sync with the mesh daemon.
//!
//! The mesh daemon pushes full snapshots of the addresses and on-mesh
//! prefixes the interface should carry. The controller diffs each snapshot
//! against what it has already requested and turns the difference into
//! rtnetlink address requests and multicast socket options.
//!
//! # Architecture
//!
//! ```text
//! mesh daemon --snapshot--> ControllerHandle --mpsc--> ControllerDispatcher
//!                                                           |
//!                                                     TunController
//!                                       +-------------------+------------------+
//!                                       |                   |                  |
//!                              RTM_NEWADDR/DELADDR   join/leave group    mirrored LinkProperties
//!                               (route socket)      (multicast socket)    (read by consumers)
//! ```

pub mod backend;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod lifetime;
pub mod link;
pub mod multicast;
pub mod netlink;
pub mod service;
pub mod snapshot;
pub mod tun;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use backend::{LinkBackend, SystemBackend};
pub use config::ControllerConfig;
pub use controller::{ControllerState, TunController};
pub use error::{ControllerError, KernelError, SnapshotError};
pub use link::{LinkAddress, LinkProperties, Route};
pub use netlink::SequenceCounter;
pub use service::{ControllerDispatcher, ControllerHandle};
pub use snapshot::{AddressInfo, DaemonMessage, OnMeshPrefixConfig};
pub use tun::TunDevice;
