use rumqttc::v5::ClientError;
use rumqttc::v5::ConnectionError;

/// Caller-visible error kinds for the MQTT client.
///
/// `InvalidArg` / `InvalidState` / `NoData` / `Already` are raised
/// locally; everything else transparently wraps the underlying MQTT
/// library. `fleetmq::Error` aggregates this type for the façade's
/// single public error enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("unknown subscription handle")]
    NoData,
    #[error("already registered")]
    Already,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Client(#[from] ClientError),
}
