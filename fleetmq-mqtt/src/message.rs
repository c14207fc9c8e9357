use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::mqttbytes::{QoS, UserProperty};

const SEQUENCE_NUM_KEY: &str = "sequenceNum";
const IS_END_SEQUENCE_KEY: &str = "isEndSequence";

/// A single incoming MQTT publish, with the v5 properties the
/// request/reply coordinator needs already pulled out.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// Last sequence number sent as a reply to this message (0 = none
    /// sent yet). Mutated in place by `MqttClient::send_reply`.
    pub sequence: u32,
    pub is_end_sequence: bool,
}

impl From<Publish> for IncomingMessage {
    fn from(publish: Publish) -> Self {
        let topic = String::from_utf8_lossy(&publish.topic).into_owned();
        let mut response_topic = None;
        let mut correlation_data = None;
        let mut sequence = 0;
        let mut is_end_sequence = false;

        if let Some(properties) = publish.properties {
            response_topic = properties.response_topic;
            correlation_data = properties.correlation_data;

            for UserProperty(key, value) in properties.user_properties {
                match key.as_str() {
                    SEQUENCE_NUM_KEY => sequence = value.parse().unwrap_or(0),
                    IS_END_SEQUENCE_KEY => is_end_sequence = value == "1",
                    _ => {}
                }
            }
        }

        Self {
            topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            response_topic,
            correlation_data,
            sequence,
            is_end_sequence,
        }
    }
}
