//! Thin MQTT v5 client wrapper: connect/will, publish (with optional
//! reply-topic/correlation), wildcard subscribe with pattern-matched
//! dispatch, and a three-state connection signal. This is the
//! control-plane transport the rest of the fabric is built on.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill, PublishProperties};
use rumqttc::v5::mqttbytes::UserProperty;
pub use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions};
use tokio::sync::mpsc;
use tracing::{debug, error};

pub use error::Error;
pub use message::IncomingMessage;
pub use topic::{has_wildcard, topic_match};

mod dispatch;
mod error;
mod message;
mod topic;

use dispatch::Dispatcher;
pub use dispatch::Cookie as SubscribeHandle;

pub type Result<T> = core::result::Result<T, Error>;

const SEQUENCE_NUM_KEY: &str = "sequenceNum";
const IS_END_SEQUENCE_KEY: &str = "isEndSequence";
const MAX_TOPIC_LEN: usize = u16::MAX as usize;
const MAX_PAYLOAD_LEN: usize = (1 << 28) - 1;

/// The three-state signal delivered to at most one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    ConnectFailed,
    Disconnected,
}

type ConnectionListener = dyn Fn(ConnectionState) + Send + Sync;

#[derive(Debug, Default)]
pub struct MqttClientBuilder {
    client_id: String,
    will: Option<(String, Bytes, QoS, bool)>,
}

impl MqttClientBuilder {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            will: None,
        }
    }

    /// Must be called before [`connect`](Self::connect) — there's no
    /// way to set a will afterwards since `connect` consumes the
    /// builder.
    pub fn set_will(
        mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        self.will = Some((topic.into(), payload.into(), qos, retain));
        self
    }

    /// Connects to the broker and spawns the background poll task.
    pub async fn connect(
        self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<MqttClient> {
        if self.client_id.is_empty() {
            return Err(Error::InvalidArg("client id must not be empty"));
        }

        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        if let (Some(user), Some(pass)) = (username, password) {
            options.set_credentials(user, pass);
        }
        if let Some((topic, payload, qos, retain)) = self.will {
            options.set_last_will(LastWill::new(topic, payload, qos, retain, None));
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let dispatcher = Arc::new(Dispatcher::default());
        let pattern_refs = Arc::new(Mutex::new(HashMap::new()));
        let listener: Arc<Mutex<Option<Box<ConnectionListener>>>> = Arc::new(Mutex::new(None));
        let connected = Arc::new(AtomicBool::new(false));
        let (close_tx, close_rx) = mpsc::channel::<()>(1);

        tokio::spawn(poll(
            event_loop,
            close_rx,
            Arc::clone(&dispatcher),
            Arc::clone(&listener),
            Arc::clone(&connected),
        ));

        Ok(MqttClient {
            client,
            dispatcher,
            pattern_refs,
            listener,
            connected,
            close_tx,
            client_id: self.client_id,
        })
    }
}

#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
    dispatcher: Arc<Dispatcher>,
    pattern_refs: Arc<Mutex<HashMap<String, usize>>>,
    listener: Arc<Mutex<Option<Box<ConnectionListener>>>>,
    connected: Arc<AtomicBool>,
    close_tx: mpsc::Sender<()>,
    client_id: String,
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.close_tx.try_send(());
    }
}

impl MqttClient {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Registers the listener for the connect/disconnect signal.
    /// Replaces any previously registered listener — at most one is
    /// held at a time.
    pub fn on_connection_state<F>(&self, listener: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    /// Publishes a plain message.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let payload = payload.into();
        validate_publish(topic, payload.len())?;
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(Error::from)
    }

    /// Publishes with `ResponseTopic` and `CorrelationData` v5
    /// properties set, so the receiver can route a reply back here.
    pub async fn publish_with_reply(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        reply_topic: &str,
        correlation: impl Into<Bytes>,
    ) -> Result<()> {
        let payload = payload.into();
        validate_publish(topic, payload.len())?;
        if reply_topic.is_empty() {
            return Err(Error::InvalidArg("reply topic must not be empty"));
        }

        let properties = PublishProperties {
            response_topic: Some(reply_topic.to_owned()),
            correlation_data: Some(correlation.into()),
            ..Default::default()
        };

        self.client
            .publish_with_properties(topic, qos, retain, payload, properties)
            .await
            .map_err(Error::from)
    }

    /// Replies to `msg`, stamping `CorrelationData` plus the
    /// `sequenceNum`/`isEndSequence` user properties. The sequence
    /// counter in `msg` is incremented in place unless this is a lone
    /// single reply (`end=true` on the very first call).
    pub async fn send_reply(
        &self,
        msg: &mut IncomingMessage,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        end: bool,
    ) -> Result<()> {
        let reply_topic = msg
            .response_topic
            .clone()
            .ok_or(Error::InvalidArg("message carries no response topic"))?;
        let payload = payload.into();
        validate_publish(&reply_topic, payload.len())?;

        let already_replied = msg.sequence != 0;
        if !end || already_replied {
            msg.sequence += 1;
        }
        msg.is_end_sequence = end;

        let properties = PublishProperties {
            correlation_data: msg.correlation_data.clone(),
            user_properties: vec![
                UserProperty(SEQUENCE_NUM_KEY.to_owned(), msg.sequence.to_string()),
                UserProperty(
                    IS_END_SEQUENCE_KEY.to_owned(),
                    if end { "1" } else { "0" }.to_owned(),
                ),
            ],
            ..Default::default()
        };

        self.client
            .publish_with_properties(reply_topic, qos, retain, payload, properties)
            .await
            .map_err(Error::from)
    }

    /// Subscribes `pattern` (may contain `+`/`#`), invoking `callback`
    /// with `user_data` for every delivered message whose topic
    /// matches. Two independent registrations of the same pattern
    /// each receive their own, separately-dispatched copy.
    pub async fn subscribe<F, D>(
        &self,
        pattern: &str,
        qos: QoS,
        user_data: D,
        callback: F,
    ) -> Result<SubscribeHandle>
    where
        F: Fn(&IncomingMessage, &mut D) + Send + Sync + 'static,
        D: Send + 'static,
    {
        if pattern.is_empty() {
            return Err(Error::InvalidArg("pattern must not be empty"));
        }

        let needs_broker_subscribe = {
            let mut refs = self.pattern_refs.lock();
            let count = refs.entry(pattern.to_owned()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if needs_broker_subscribe {
            if let Err(err) = self.client.subscribe(pattern, qos).await {
                let mut refs = self.pattern_refs.lock();
                if let Some(count) = refs.get_mut(pattern) {
                    *count -= 1;
                }
                return Err(err.into());
            }
        }

        Ok(self.dispatcher.subscribe(pattern, user_data, callback))
    }

    /// Unsubscribes `cookie`, returning its user data. Drops the
    /// broker-level subscription once the last local registration for
    /// that exact pattern string is removed.
    pub async fn unsubscribe(&self, cookie: SubscribeHandle) -> Result<Box<dyn Any + Send>> {
        let (pattern, user_data) = self.dispatcher.unsubscribe(cookie)?;

        let needs_broker_unsubscribe = {
            let mut refs = self.pattern_refs.lock();
            match refs.get_mut(&pattern) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    refs.remove(&pattern);
                    true
                }
                None => false,
            }
        };

        if needs_broker_unsubscribe {
            self.client.unsubscribe(&pattern).await?;
        }

        Ok(user_data)
    }

    pub fn topic_match(&self, pattern: &str, topic: &str) -> bool {
        topic_match(pattern, topic)
    }
}

fn validate_publish(topic: &str, payload_len: usize) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidArg("topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidArg("topic exceeds the mqtt topic length limit"));
    }
    if has_wildcard(topic) {
        return Err(Error::InvalidArg("publish topic must not contain wildcards"));
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidArg("payload exceeds the mqtt payload length limit"));
    }
    Ok(())
}

async fn poll(
    mut event_loop: EventLoop,
    mut close_rx: mpsc::Receiver<()>,
    dispatcher: Arc<Dispatcher>,
    listener: Arc<Mutex<Option<Box<ConnectionListener>>>>,
    connected: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            event = event_loop.poll() => {
                process_event(event, &dispatcher, &listener, &connected);
            }
            _ = close_rx.recv() => {
                debug!("exit mqtt event poll loop");
                break;
            }
        }
    }
}

fn process_event(
    event: std::result::Result<Event, ConnectionError>,
    dispatcher: &Dispatcher,
    listener: &Mutex<Option<Box<ConnectionListener>>>,
    connected: &AtomicBool,
) {
    match event {
        Ok(Event::Incoming(Incoming::Publish(packet))) => {
            dispatcher.dispatch(&IncomingMessage::from(packet));
        }
        Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
            let state = if ack.code == ConnectReturnCode::Success {
                connected.store(true, Ordering::SeqCst);
                ConnectionState::Connected
            } else {
                ConnectionState::ConnectFailed
            };
            notify(listener, state);
        }
        Ok(Event::Incoming(Incoming::Disconnect(_))) => {
            connected.store(false, Ordering::SeqCst);
            notify(listener, ConnectionState::Disconnected);
        }
        Ok(_) => {}
        Err(conn_err) => {
            error!(error = &conn_err as &dyn std::error::Error, "mqtt connection error");
            let state = if connected.swap(false, Ordering::SeqCst) {
                ConnectionState::Disconnected
            } else {
                ConnectionState::ConnectFailed
            };
            notify(listener, state);
        }
    }
}

fn notify(listener: &Mutex<Option<Box<ConnectionListener>>>, state: ConnectionState) {
    if let Some(listener) = listener.lock().as_ref() {
        listener(state);
    }
}
