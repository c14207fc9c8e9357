//! The FleetMQ façade: one handle over an MQTT control plane, an
//! optional direct TCP fast path, and peer discovery, presenting a
//! single subscribe/publish/request-reply surface over both.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
pub use fleetmq_mqtt::{ConnectionState, QoS};
use fleetmq_discovery::Discovery;
use fleetmq_tcp::TcpTransport;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

mod config;
mod error;
mod registry;
mod reply;

pub use config::{Config, ConfigBuilder, TcpMode};
pub use error::Error;
pub use registry::{Message, SubscribeHandle, Transport, TRANSPORT_ALL, TRANSPORT_MQTT, TRANSPORT_TCP};
pub use reply::ReplySequence;

use registry::Registry;
use reply::ReplyCoordinator;

pub type Result<T> = core::result::Result<T, Error>;

/// Everything that only exists while the façade is connected. Torn
/// down on `disconnect()`, rebuilt on the next `connect()`.
struct Inner {
    discovery: Arc<Discovery>,
    tcp: Option<Arc<TcpTransport>>,
    registry: Arc<Registry>,
    reply: ReplyCoordinator,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Inner {
    async fn connect(config: &Config) -> Result<Self> {
        let discovery = Discovery::start(
            config.client_id.clone(),
            &config.broker_host,
            config.broker_port,
            config.username.as_deref(),
            config.password.as_deref(),
        )
        .await?;

        let tcp = match config.tcp_mode {
            TcpMode::Disabled => None,
            TcpMode::Plain | TcpMode::Secure => {
                let my_ip = config
                    .my_ip
                    .clone()
                    .ok_or(Error::InvalidArg("my_ip is required when tcp_mode is not disabled"))?;
                Some(TcpTransport::new(Arc::clone(&discovery), my_ip, config.tcp_mode == TcpMode::Secure))
            }
        };

        let registry = Registry::new(Arc::clone(&discovery), discovery.mqtt().clone(), tcp.clone());
        let tracker = TaskTracker::new();
        let reply = ReplyCoordinator::new(discovery.mqtt().clone(), tcp.clone(), Arc::clone(&registry), tracker.clone());

        Ok(Self {
            discovery,
            tcp,
            registry,
            reply,
            tracker,
            cancel: CancellationToken::new(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.cancel.cancel();
        self.discovery.stop().await?;
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}

/// The running fabric: MQTT control plane, optional TCP fast path,
/// discovery, the subscription registry, and the request/reply
/// coordinator, all sharing one lifecycle. A single instance may be
/// connected, disconnected, and reconnected any number of times;
/// `connect()`/`disconnect()` are not one-shot.
pub struct FleetMq {
    config: Config,
    inner: RwLock<Option<Arc<Inner>>>,
}

impl FleetMq {
    /// Connects to the broker, brings up discovery and (if configured)
    /// the TCP fast path, and returns a ready-to-use façade.
    pub async fn ready(config: Config) -> Result<Arc<Self>> {
        let this = Arc::new(Self {
            config,
            inner: RwLock::new(None),
        });
        this.connect().await?;
        Ok(this)
    }

    /// (Re)connects an instance that is not currently connected.
    /// Raises [`Error::Already`] if it already is.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.read().await.is_some() {
            return Err(Error::Already);
        }
        let inner = Inner::connect(&self.config).await?;
        let mut guard = self.inner.write().await;
        if guard.is_some() {
            return Err(Error::Already);
        }
        *guard = Some(Arc::new(inner));
        Ok(())
    }

    /// Graceful shutdown: stops discovery (unsubscribe, clear the
    /// retained presence message, disconnect), then waits for any
    /// in-flight reply-teardown tasks to finish. The same instance may
    /// be reconnected afterward with [`Self::connect`].
    pub async fn disconnect(&self) -> Result<()> {
        let inner = self.inner.write().await.take().ok_or(Error::InvalidState("not connected"))?;
        inner.disconnect().await
    }

    async fn inner(&self) -> Result<Arc<Inner>> {
        self.inner.read().await.clone().ok_or(Error::InvalidState("not connected"))
    }

    /// Registers the listener for the MQTT connect/disconnect signal.
    pub async fn on_connection_state<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner().await?.discovery.mqtt().on_connection_state(listener);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        match self.inner.read().await.as_ref() {
            Some(inner) => inner.discovery.mqtt().is_connected(),
            None => false,
        }
    }

    /// Subscribes `pattern` over `transport`. `callback` fires once
    /// per delivered message whose topic matches `pattern`.
    pub async fn subscribe<F>(&self, pattern: &str, transport: Transport, qos: QoS, callback: F) -> Result<SubscribeHandle>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.inner().await?.registry.subscribe(pattern, transport, qos, callback).await
    }

    /// Unsubscribes `handle`. Unknown handles raise [`Error::NoData`].
    pub async fn unsubscribe(&self, handle: SubscribeHandle) -> Result<()> {
        self.inner().await?.registry.unsubscribe(handle).await
    }

    /// Sum, across the transports selected by `mask`
    /// ([`TRANSPORT_MQTT`]/[`TRANSPORT_TCP`]/[`TRANSPORT_ALL`]), of
    /// subscribers whose pattern matches `topic`. `topic` must be
    /// concrete; a wildcard topic raises [`Error::NotSupported`].
    pub async fn count_subscriber(&self, topic: &str, mask: u8) -> Result<i64> {
        self.inner().await?.registry.count_subscriber(topic, mask)
    }

    /// Publishes over MQTT and, if a TCP fast path is configured, also
    /// fans the same message out over TCP to any peer whose
    /// advertised pattern matches. A TCP-side failure is logged but
    /// never fails the call — the MQTT delivery is authoritative.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Result<()> {
        let inner = self.inner().await?;
        let payload = payload.into();
        inner.discovery.mqtt().publish(topic, qos, retain, payload.clone()).await?;
        if let Some(tcp) = &inner.tcp {
            if let Err(err) = tcp.publish(topic, payload).await {
                warn!(%topic, %err, "tcp fast-path publish failed, mqtt delivery already succeeded");
            }
        }
        Ok(())
    }

    /// Publishes a request and subscribes to a freshly synthesized
    /// reply topic; `callback` fires for every reply and the
    /// subscription is torn down automatically once one arrives with
    /// `is_end_sequence = true`.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_with_reply<F>(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        transport: Transport,
        correlation: impl Into<Bytes>,
        callback: F,
    ) -> Result<SubscribeHandle>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.inner()
            .await?
            .reply
            .publish_with_reply(topic, payload.into(), qos, retain, transport, correlation.into(), callback)
            .await
    }

    /// Publishes a request and blocks until either a final reply
    /// arrives or `timeout` elapses. `callback` fires for every reply
    /// received, including the final one, before the call returns.
    /// MQTT only; calling with `transport = Transport::Tcp` returns
    /// [`Error::NotSupported`].
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_with_reply_sync<F>(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        transport: Transport,
        correlation: impl Into<Bytes>,
        timeout: Duration,
        callback: F,
    ) -> Result<Message>
    where
        F: Fn(&Message),
    {
        reply::reject_tcp_sync(transport)?;
        self.inner()
            .await?
            .reply
            .publish_with_reply_sync(topic, payload.into(), qos, retain, correlation.into(), timeout, callback)
            .await
    }

    /// Replies to a previously received reply-bearing message. See
    /// [`ReplySequence::from_message`] to build `seq` from a
    /// [`Message`].
    pub async fn send_reply(&self, seq: &mut ReplySequence, payload: impl Into<Bytes>, qos: QoS, retain: bool, end: bool) -> Result<()> {
        self.inner().await?.reply.send_reply(seq, payload.into(), qos, retain, end).await
    }
}
