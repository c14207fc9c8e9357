#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("framed message header exceeds the maximum size")]
    OversizedFrame,
    #[error("peer closed the connection mid-frame")]
    FramingViolation,
    #[error("malformed discovery blob: {0}")]
    Malformed(String),
    #[error("secure endpoint given a key/iv of the wrong length")]
    BadKeyMaterial,
    #[error("peer announced an unparseable address {0:?}")]
    InvalidPeerAddress(String),
    #[error("ciphertext could not be unpadded, connection desynchronized")]
    Decrypt,
    #[error(transparent)]
    Discovery(#[from] fleetmq_discovery::Error),
}
