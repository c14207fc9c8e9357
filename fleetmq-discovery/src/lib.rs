//! Peer discovery over retained MQTT messages.
//!
//! One [`Discovery`] owns a single MQ subscription to
//! `DISCOVERY_TOPIC_BASE + "+"` and publishes its own retained state at
//! `DISCOVERY_TOPIC_BASE + <client_id>`. Other components (the TCP
//! transport, the subscription registry's MQTT-pattern advert) publish
//! their own opaque blob under a module name via
//! [`Discovery::update_module_state`] and learn about peers' blobs by
//! registering a callback with [`Discovery::add_callback`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fleetmq_mqtt::{IncomingMessage, MqttClient, MqttClientBuilder, QoS, SubscribeHandle};
use parking_lot::Mutex;
use tracing::warn;

mod blob;
mod error;

pub use blob::PeerStatus;
pub use error::Error;

pub type Result<T> = core::result::Result<T, Error>;

pub const DISCOVERY_TOPIC_BASE: &str = "/v1/fleetmq/discovery/";

type Callback = dyn Fn(&str, PeerStatus, &[u8]) + Send + Sync;

struct CallbackEntry {
    id: u64,
    module: String,
    callback: Arc<Callback>,
}

pub struct Discovery {
    mqtt: MqttClient,
    client_id: String,
    state: Mutex<HashMap<String, Bytes>>,
    callbacks: Mutex<Vec<CallbackEntry>>,
    next_id: AtomicU64,
    subscribe_handle: Mutex<Option<SubscribeHandle>>,
}

impl Discovery {
    /// The underlying MQ connection discovery was built on. The façade
    /// reuses this same connection for application-level pub/sub
    /// rather than opening a second client under the same client id
    /// (which the broker would treat as a session takeover).
    pub fn mqtt(&self) -> &MqttClient {
        &self.mqtt
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connects the underlying MQ client with the discovery will
    /// message already armed, then subscribes to the peer wildcard.
    pub async fn start(
        client_id: impl Into<String>,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<Self>> {
        let client_id = client_id.into();
        let my_topic = format!("{DISCOVERY_TOPIC_BASE}{client_id}");

        let mqtt = MqttClientBuilder::new(client_id.clone())
            .set_will(my_topic, Bytes::new(), QoS::ExactlyOnce, true)
            .connect(host, port, username, password)
            .await?;

        let discovery = Arc::new(Self {
            mqtt,
            client_id,
            state: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            subscribe_handle: Mutex::new(None),
        });
        discovery.subscribe_wildcard().await?;
        Ok(discovery)
    }

    async fn subscribe_wildcard(self: &Arc<Self>) -> Result<()> {
        let pattern = format!("{DISCOVERY_TOPIC_BASE}+");
        let this = Arc::clone(self);
        let handle = self
            .mqtt
            .subscribe(&pattern, QoS::ExactlyOnce, (), move |msg, _: &mut ()| {
                this.handle_message(msg);
            })
            .await?;
        *self.subscribe_handle.lock() = Some(handle);
        Ok(())
    }

    /// Re-subscribes to the peer wildcard, forcing the broker to
    /// redeliver every peer's retained state. Used when a module's
    /// configuration changes in a way that needs fresh discovery.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        if let Some(handle) = self.subscribe_handle.lock().take() {
            self.mqtt.unsubscribe(handle).await?;
        }
        self.subscribe_wildcard().await
    }

    /// Unsubscribes and publishes an empty retained message (QoS 2
    /// then QoS 0, to make sure retention actually clears regardless
    /// of which QoS the broker stored).
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if let Some(handle) = self.subscribe_handle.lock().take() {
            self.mqtt.unsubscribe(handle).await?;
        }
        let my_topic = format!("{DISCOVERY_TOPIC_BASE}{}", self.client_id);
        self.mqtt
            .publish(&my_topic, QoS::ExactlyOnce, true, Bytes::new())
            .await?;
        self.mqtt
            .publish(&my_topic, QoS::AtMostOnce, true, Bytes::new())
            .await?;
        Ok(())
    }

    /// Registers `callback` for updates to `module`'s blob on any
    /// peer. Returns a numeric id for later removal. Multiple
    /// callbacks may share a module name; they fire in registration
    /// order.
    pub fn add_callback<F>(&self, module: impl Into<String>, callback: F) -> u64
    where
        F: Fn(&str, PeerStatus, &[u8]) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().push(CallbackEntry {
            id,
            module: module.into(),
            callback: Arc::new(callback),
        });
        id
    }

    pub fn remove_callback(&self, id: u64) {
        self.callbacks.lock().retain(|entry| entry.id != id);
    }

    /// Updates this peer's blob for `module` and republishes the
    /// entire retained discovery map.
    pub async fn update_module_state(&self, module: impl Into<String>, blob: Bytes) -> Result<()> {
        self.state.lock().insert(module.into(), blob);
        self.publish().await
    }

    async fn publish(&self) -> Result<()> {
        let modules = self.state.lock().clone();
        let payload = blob::encode(PeerStatus::Connected, &modules)?;
        let my_topic = format!("{DISCOVERY_TOPIC_BASE}{}", self.client_id);
        self.mqtt
            .publish(&my_topic, QoS::ExactlyOnce, true, payload)
            .await?;
        Ok(())
    }

    fn handle_message(&self, msg: &IncomingMessage) {
        let Some(client_id) = msg.topic.strip_prefix(DISCOVERY_TOPIC_BASE) else {
            return;
        };

        if msg.payload.is_empty() {
            self.fire_all(client_id, PeerStatus::Disconnected, &[]);
            return;
        }

        let decoded = match blob::decode(&msg.payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%client_id, error = %err, "discarding malformed discovery payload");
                return;
            }
        };
        let Some(status) = decoded.status else {
            return;
        };

        for (module, data) in &decoded.modules {
            self.fire_module(client_id, status, module, data);
        }
    }

    fn fire_module(&self, client_id: &str, status: PeerStatus, module: &str, data: &[u8]) {
        let snapshot: Vec<_> = self
            .callbacks
            .lock()
            .iter()
            .filter(|entry| entry.module == module)
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in snapshot {
            callback(client_id, status, data);
        }
    }

    fn fire_all(&self, client_id: &str, status: PeerStatus, data: &[u8]) {
        let snapshot: Vec<_> = self
            .callbacks
            .lock()
            .iter()
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in snapshot {
            callback(client_id, status, data);
        }
    }
}
