//! Direct point-to-point TCP fast path: a framed, optionally
//! AES-256-CBC-encrypted transport that peers discover each other's
//! endpoints for over [`fleetmq_discovery`] rather than any broker.

mod crypto;
mod endpoint;
mod error;
mod peer_table;
mod transport;

pub use crypto::CryptoContext;
pub use endpoint::{Frame, TcpEndpoint};
pub use error::Error;
pub use peer_table::{PeerEndpoint, PeerTopicUpdate, TcpPeerTable};
pub use transport::{SubscribeHandle, TcpMessage, TcpTransport, MODULE_SECURE_TCP, MODULE_TCP};

pub type Result<T> = core::result::Result<T, Error>;
