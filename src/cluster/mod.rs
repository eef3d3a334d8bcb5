//! Cluster membership and inter-node fragment transport
//!
//! Nodes talk to each other only through the fragment protocol (store,
//! fetch, delete, ping, local health scans, shutdown) and coordinate through
//! the shared metadata store.

mod memory;
mod membership;
mod p2p;
pub mod placement;
mod protocol;
mod router;
mod service;
mod transport;

pub use memory::MemoryTransport;
pub use membership::{Membership, MembershipConfig, RegistrationReport};
pub use p2p::{P2pTransport, P2pTransportConfig};
pub use placement::{select_replacement_servers, select_storage_servers};
pub use protocol::{ErrorCode, FragmentRequest, FragmentResponse};
pub use router::FragmentRouter;
pub use service::FragmentService;
pub use transport::{NodeTransport, PeerClient};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Server {0} unreachable")]
    Unreachable(String),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{server} answered {code:?}: {message}")]
    Remote {
        server: String,
        code: ErrorCode,
        message: String,
    },

    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Network error: {0}")]
    Network(String),
}
