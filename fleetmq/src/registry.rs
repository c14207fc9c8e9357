//! The façade-level subscription table: one opaque handle per
//! `subscribe` call regardless of which underlying transport it
//! routed to, plus the auxiliary "MQTT discovery table" that backs
//! `count_subscriber` for the MQTT half of the fabric.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use fleetmq_discovery::{Discovery, PeerStatus};
use fleetmq_mqtt::{self as mqtt, IncomingMessage, MqttClient, QoS};
use fleetmq_tcp::{self as tcp, TcpMessage, TcpTransport};
use parking_lot::Mutex;
use tracing::warn;

use crate::{Error, Result};

pub const MQTT_DISCOVERY_MODULE: &str = "MQTT";

pub type SubscribeHandle = u64;

/// Which underlying transport carried a message, or should carry a
/// new subscription/publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Mqtt,
    Tcp,
}

pub const TRANSPORT_MQTT: u8 = 0b01;
pub const TRANSPORT_TCP: u8 = 0b10;
pub const TRANSPORT_ALL: u8 = TRANSPORT_MQTT | TRANSPORT_TCP;

/// A message delivered to a façade-level subscriber, unified across
/// both transports.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Option<QoS>,
    pub correlation: Option<Bytes>,
    pub reply_topic: Option<String>,
    pub sequence: u64,
    pub is_end_sequence: bool,
    pub transport: Transport,
    pub source_subscription_handle: SubscribeHandle,
}

impl Message {
    fn from_mqtt(msg: &IncomingMessage, handle: SubscribeHandle) -> Self {
        Self {
            topic: msg.topic.clone(),
            payload: msg.payload.clone(),
            qos: Some(msg.qos),
            correlation: msg.correlation_data.clone(),
            reply_topic: msg.response_topic.clone(),
            sequence: u64::from(msg.sequence),
            is_end_sequence: msg.is_end_sequence,
            transport: Transport::Mqtt,
            source_subscription_handle: handle,
        }
    }

    fn from_tcp(msg: TcpMessage, handle: SubscribeHandle) -> Self {
        Self {
            topic: msg.topic,
            payload: msg.payload,
            qos: None,
            correlation: msg.correlation,
            reply_topic: msg.reply_topic,
            sequence: msg.sequence,
            is_end_sequence: msg.is_end_sequence,
            transport: Transport::Tcp,
            source_subscription_handle: handle,
        }
    }
}

enum InnerHandle {
    Mqtt(mqtt::SubscribeHandle),
    Tcp(tcp::SubscribeHandle),
}

struct SubscriptionEntry {
    pattern: String,
    inner: InnerHandle,
}

pub struct Registry {
    mqtt: MqttClient,
    tcp: Option<Arc<TcpTransport>>,
    discovery: Arc<Discovery>,
    entries: Mutex<HashMap<SubscribeHandle, SubscriptionEntry>>,
    next_id: AtomicU64,
    peer_mqtt_patterns: Mutex<HashMap<String, Vec<String>>>,
}

impl Registry {
    pub fn new(discovery: Arc<Discovery>, mqtt: MqttClient, tcp: Option<Arc<TcpTransport>>) -> Arc<Self> {
        let registry = Arc::new(Self {
            mqtt,
            tcp,
            discovery: Arc::clone(&discovery),
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            peer_mqtt_patterns: Mutex::new(HashMap::new()),
        });

        let weak: Weak<Registry> = Arc::downgrade(&registry);
        discovery.add_callback(MQTT_DISCOVERY_MODULE, move |client_id, status, data| {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            registry.on_peer_mqtt_update(client_id, status, data);
        });

        registry
    }

    fn on_peer_mqtt_update(&self, client_id: &str, status: PeerStatus, data: &[u8]) {
        match status {
            PeerStatus::Disconnected => {
                self.peer_mqtt_patterns.lock().remove(client_id);
            }
            PeerStatus::Connected => match ciborium::from_reader::<Vec<String>, _>(data) {
                Ok(patterns) => {
                    self.peer_mqtt_patterns.lock().insert(client_id.to_owned(), patterns);
                }
                Err(err) => warn!(%client_id, %err, "discarding malformed mqtt discovery blob"),
            },
        }
    }

    /// Registers `callback` on `pattern` over `transport`, returning an
    /// opaque handle good for `unsubscribe`/`count_subscriber`
    /// bookkeeping regardless of which transport it routed to.
    pub async fn subscribe<F>(
        self: &Arc<Self>,
        pattern: &str,
        transport: Transport,
        qos: QoS,
        callback: F,
    ) -> Result<SubscribeHandle>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let inner = match transport {
            Transport::Mqtt => {
                let handle = self
                    .mqtt
                    .subscribe(pattern, qos, (), move |msg, _: &mut ()| {
                        callback(Message::from_mqtt(msg, id));
                    })
                    .await?;
                InnerHandle::Mqtt(handle)
            }
            Transport::Tcp => {
                let tcp = self.tcp.as_ref().ok_or(Error::InvalidState("tcp transport is not configured"))?;
                let handle = tcp
                    .subscribe(pattern, move |msg| callback(Message::from_tcp(msg, id)))
                    .await?;
                InnerHandle::Tcp(handle)
            }
        };

        self.entries.lock().insert(
            id,
            SubscriptionEntry {
                pattern: pattern.to_owned(),
                inner,
            },
        );

        if transport == Transport::Mqtt {
            self.republish_mqtt_patterns().await?;
        }
        Ok(id)
    }

    /// Unsubscribes `handle`, unregistering from whichever transport
    /// it was routed to. Unknown handles raise [`Error::NoData`].
    pub async fn unsubscribe(&self, handle: SubscribeHandle) -> Result<()> {
        let entry = self.entries.lock().remove(&handle).ok_or(Error::NoData)?;

        let was_mqtt = matches!(entry.inner, InnerHandle::Mqtt(_));
        match entry.inner {
            InnerHandle::Mqtt(inner) => {
                self.mqtt.unsubscribe(inner).await?;
            }
            InnerHandle::Tcp(inner) => {
                let tcp = self.tcp.as_ref().ok_or(Error::InvalidState("tcp transport is not configured"))?;
                tcp.unsubscribe(inner).await?;
            }
        }

        if was_mqtt {
            self.republish_mqtt_patterns().await?;
        }
        Ok(())
    }

    /// Sum, across the transports selected by `mask`, of the number of
    /// subscribers whose pattern matches `topic`. `topic` itself must
    /// be a concrete (wildcard-free) topic.
    pub fn count_subscriber(&self, topic: &str, mask: u8) -> Result<i64> {
        if mqtt::has_wildcard(topic) {
            return Err(Error::NotSupported);
        }

        let mut total = 0i64;
        if mask & TRANSPORT_MQTT != 0 {
            total += self
                .peer_mqtt_patterns
                .lock()
                .values()
                .flatten()
                .filter(|pattern| mqtt::topic_match(pattern, topic))
                .count() as i64;
        }
        if mask & TRANSPORT_TCP != 0 {
            if let Some(tcp) = &self.tcp {
                total += tcp.count_subscribers(topic);
            }
        }
        Ok(total)
    }

    async fn republish_mqtt_patterns(&self) -> Result<()> {
        let patterns: Vec<String> = self
            .entries
            .lock()
            .values()
            .filter(|entry| matches!(entry.inner, InnerHandle::Mqtt(_)))
            .map(|entry| entry.pattern.clone())
            .collect();

        let mut buf = Vec::new();
        ciborium::into_writer(&patterns, &mut buf).expect("Vec<String> always encodes");
        self.discovery.update_module_state(MQTT_DISCOVERY_MODULE, buf.into()).await?;
        Ok(())
    }
}
