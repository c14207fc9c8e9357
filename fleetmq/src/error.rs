/// Caller-visible error kinds for the façade, aggregating each
/// component crate's error type plus the kinds that only make sense
/// once the subscription registry and reply coordinator exist.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Mqtt(#[from] fleetmq_mqtt::Error),
    #[error(transparent)]
    Tcp(#[from] fleetmq_tcp::Error),
    #[error(transparent)]
    Discovery(#[from] fleetmq_discovery::Error),
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("already connected")]
    Already,
    #[error("unknown subscription handle")]
    NoData,
    #[error("operation is not supported in this configuration")]
    NotSupported,
    #[error("sync request/reply timed out waiting for a reply")]
    TimedOut,
    #[cfg(feature = "config")]
    #[error(transparent)]
    Config(#[from] toml::de::Error),
}
