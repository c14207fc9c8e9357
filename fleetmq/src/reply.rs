//! Request/reply coordination layered on top of the subscription
//! registry: synthesizes a private reply topic per call, tears it
//! down once the final reply arrives, and offers both a callback-based
//! and a blocking-with-timeout variant of "publish, then wait for an
//! answer".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use fleetmq_mqtt::{IncomingMessage, MqttClient, QoS};
use fleetmq_tcp::TcpTransport;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::registry::{Message, Registry, SubscribeHandle, Transport};
use crate::{Error, Result};

/// A reply-bearing message, bundled with enough of its origin to send
/// a well-formed answer back without the caller having to track
/// transport-specific plumbing itself.
pub struct ReplySequence(Inner);

enum Inner {
    Mqtt(IncomingMessage),
    Tcp { reply_topic: String, sequence: u64 },
}

impl ReplySequence {
    /// Builds a reply sequence out of an inbound [`Message`], or
    /// `None` if it carries no reply topic (an ordinary publish, not
    /// part of a request/reply exchange).
    pub fn from_message(msg: &Message) -> Option<Self> {
        let reply_topic = msg.reply_topic.clone()?;
        let inner = match msg.transport {
            Transport::Mqtt => Inner::Mqtt(IncomingMessage {
                topic: msg.topic.clone(),
                payload: msg.payload.clone(),
                qos: msg.qos.unwrap_or(QoS::AtMostOnce),
                retain: false,
                response_topic: Some(reply_topic),
                correlation_data: msg.correlation.clone(),
                sequence: u32::try_from(msg.sequence).unwrap_or(u32::MAX),
                is_end_sequence: msg.is_end_sequence,
            }),
            Transport::Tcp => Inner::Tcp {
                reply_topic,
                sequence: msg.sequence,
            },
        };
        Some(Self(inner))
    }
}

pub struct ReplyCoordinator {
    mqtt: MqttClient,
    tcp: Option<Arc<TcpTransport>>,
    registry: Arc<Registry>,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

impl ReplyCoordinator {
    /// `tracker` is the façade's own task tracker, so `disconnect()`
    /// waiting on it also waits for any final-reply cleanup this
    /// coordinator has in flight.
    pub fn new(mqtt: MqttClient, tcp: Option<Arc<TcpTransport>>, registry: Arc<Registry>, tracker: TaskTracker) -> Self {
        Self {
            mqtt,
            tcp,
            registry,
            tracker,
            next_id: AtomicU64::new(0),
        }
    }

    fn reply_topic(&self, topic: &str) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u16;
        format!("{topic}_FleetMQRe_{id}")
    }

    /// Subscribes to a freshly synthesized reply topic, issues the
    /// reply-carrying publish, and returns the subscription handle.
    /// `callback` fires for every reply; the reply subscription is
    /// torn down automatically once one arrives with
    /// `is_end_sequence = true`.
    pub async fn publish_with_reply<F>(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        transport: Transport,
        correlation: Bytes,
        callback: F,
    ) -> Result<SubscribeHandle>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let reply_topic = self.reply_topic(topic);
        let handle_cell: Arc<OnceLock<SubscribeHandle>> = Arc::new(OnceLock::new());
        let cell = Arc::clone(&handle_cell);
        let registry = Arc::clone(&self.registry);
        let tracker = self.tracker.clone();

        let handle = self
            .registry
            .subscribe(&reply_topic, transport, qos, move |msg| {
                let is_end = msg.is_end_sequence;
                callback(msg);
                if is_end {
                    if let Some(&handle) = cell.get() {
                        let registry = Arc::clone(&registry);
                        tracker.spawn(async move {
                            let _ = registry.unsubscribe(handle).await;
                        });
                    }
                }
            })
            .await?;
        handle_cell.set(handle).expect("handle_cell set exactly once, before any reply can arrive");

        match transport {
            Transport::Mqtt => {
                self.mqtt
                    .publish_with_reply(topic, qos, retain, payload, &reply_topic, correlation)
                    .await?;
            }
            Transport::Tcp => {
                let tcp = self.tcp.as_ref().ok_or(Error::InvalidState("tcp transport is not configured"))?;
                tcp.publish_with_reply(topic, payload, correlation, &reply_topic, 0, false).await?;
            }
        }

        Ok(handle)
    }

    /// Replies to `seq`, stamping sequence/`is_end_sequence` metadata
    /// onto the answer. The sequence counter advances in place unless
    /// this is a lone single reply.
    pub async fn send_reply(&self, seq: &mut ReplySequence, payload: Bytes, qos: QoS, retain: bool, end: bool) -> Result<()> {
        match &mut seq.0 {
            Inner::Mqtt(msg) => {
                self.mqtt.send_reply(msg, qos, retain, payload, end).await?;
            }
            Inner::Tcp { reply_topic, sequence } => {
                let tcp = self.tcp.as_ref().ok_or(Error::InvalidState("tcp transport is not configured"))?;
                let already_replied = *sequence != 0;
                if !end || already_replied {
                    *sequence += 1;
                }
                tcp.publish_with_reply(reply_topic, payload, Bytes::new(), reply_topic, *sequence, end).await?;
            }
        }
        Ok(())
    }

    /// Publishes and blocks until either a reply with
    /// `is_end_sequence = true` arrives or `timeout` elapses without
    /// one. `callback` fires for every reply received, including the
    /// final one, before the call returns. Every partial reply rearms
    /// the deadline. MQTT only — `transport = Transport::Tcp` returns
    /// [`Error::NotSupported`].
    pub async fn publish_with_reply_sync<F>(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        correlation: Bytes,
        timeout: Duration,
        callback: F,
    ) -> Result<Message>
    where
        F: Fn(&Message),
    {
        let reply_topic = self.reply_topic(topic);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let handle = self
            .registry
            .subscribe(&reply_topic, Transport::Mqtt, qos, move |msg| {
                let _ = tx.send(msg);
            })
            .await?;

        self.mqtt
            .publish_with_reply(topic, qos, retain, payload, &reply_topic, correlation)
            .await?;

        let mut deadline = Instant::now() + timeout;
        let result = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(msg)) if msg.is_end_sequence => {
                    callback(&msg);
                    break Ok(msg);
                }
                Ok(Some(partial)) => {
                    callback(&partial);
                    deadline = Instant::now() + timeout;
                    continue;
                }
                Ok(None) => break Err(Error::InvalidState("reply channel closed before a final reply arrived")),
                Err(_) => break Err(Error::TimedOut),
            }
        };

        if let Err(err) = self.registry.unsubscribe(handle).await {
            debug!(%err, "reply subscription already gone during sync teardown");
        }
        result
    }
}

/// Enforces the "MQTT only" rule for the blocking variant at the
/// façade boundary, before a `ReplyCoordinator` is ever touched.
pub fn reject_tcp_sync(transport: Transport) -> Result<()> {
    match transport {
        Transport::Mqtt => Ok(()),
        Transport::Tcp => Err(Error::NotSupported),
    }
}
