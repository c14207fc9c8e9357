#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed discovery payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Mqtt(#[from] fleetmq_mqtt::Error),
}
