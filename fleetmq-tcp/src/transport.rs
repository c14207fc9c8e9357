//! Per-topic TCP servers, the peer-fanout publish path, and discovery
//! integration. One [`TcpTransport`] owns either the `TCP` or the
//! `SECURE_TCP` module depending on whether it was built secure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use fleetmq_discovery::{Discovery, PeerStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crypto::CryptoContext;
use crate::endpoint::{Frame, TcpEndpoint};
use crate::peer_table::{PeerTopicUpdate, TcpPeerTable};
use crate::{Error, Result};

pub const MODULE_TCP: &str = "TCP";
pub const MODULE_SECURE_TCP: &str = "SECURE_TCP";

pub type SubscribeHandle = u64;

/// A message delivered off the wire, with reply metadata populated
/// only when the publishing side sent it as part of a reply sequence.
#[derive(Debug, Clone)]
pub struct TcpMessage {
    pub topic: String,
    pub payload: Bytes,
    pub correlation: Option<Bytes>,
    pub reply_topic: Option<String>,
    pub sequence: u64,
    pub is_end_sequence: bool,
}

#[derive(Serialize, Deserialize, Default)]
struct ReplyHeader {
    correlation: Option<Vec<u8>>,
    reply_topic: Option<String>,
    sequence: Option<u64>,
    is_end_sequence: Option<bool>,
}

#[derive(Serialize, Deserialize)]
struct TopicTuple(u16, i64, Option<Vec<u8>>, Option<Vec<u8>>);

#[derive(Serialize, Deserialize)]
struct TcpBlob {
    host: String,
    #[serde(flatten)]
    topics: HashMap<String, TopicTuple>,
}

type TopicCallback = dyn Fn(TcpMessage) + Send + Sync;

struct CallbackEntry {
    id: u64,
    pattern: String,
    callback: Arc<TopicCallback>,
}

struct ServerEntry {
    port: u16,
    crypto: Option<CryptoContext>,
    accept_task: JoinHandle<()>,
}

pub struct TcpTransport {
    secure: bool,
    my_ip: String,
    discovery: Arc<Discovery>,
    peer_table: Arc<TcpPeerTable>,
    servers: Mutex<HashMap<String, ServerEntry>>,
    callbacks: Mutex<Vec<CallbackEntry>>,
    next_id: AtomicU64,
}

impl TcpTransport {
    /// Builds the transport and registers it with `discovery` under
    /// the `TCP` or `SECURE_TCP` module name.
    pub fn new(discovery: Arc<Discovery>, my_ip: impl Into<String>, secure: bool) -> Arc<Self> {
        let transport = Arc::new(Self {
            secure,
            my_ip: my_ip.into(),
            discovery: Arc::clone(&discovery),
            peer_table: Arc::new(TcpPeerTable::new()),
            servers: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let weak: Weak<TcpTransport> = Arc::downgrade(&transport);
        discovery.add_callback(transport.module_name(), move |client_id, status, data| {
            let Some(transport) = weak.upgrade() else {
                return;
            };
            let client_id = client_id.to_owned();
            let data = data.to_vec();
            tokio::spawn(async move {
                transport.on_peer_update(&client_id, status, &data).await;
            });
        });

        transport
    }

    fn module_name(&self) -> &'static str {
        if self.secure {
            MODULE_SECURE_TCP
        } else {
            MODULE_TCP
        }
    }

    async fn on_peer_update(&self, client_id: &str, status: PeerStatus, data: &[u8]) {
        match status {
            PeerStatus::Disconnected => self.peer_table.remove_peer(client_id).await,
            PeerStatus::Connected => match decode_blob(data) {
                Ok(blob) => {
                    let topics: Vec<PeerTopicUpdate> = blob
                        .topics
                        .into_iter()
                        .map(|(pattern, tuple)| {
                            let crypto = match (tuple.2, tuple.3) {
                                (Some(key), Some(iv)) => CryptoContext::from_slices(&key, &iv).ok(),
                                _ => None,
                            };
                            PeerTopicUpdate {
                                pattern,
                                port: tuple.0,
                                num_of_cb: tuple.1,
                                crypto,
                            }
                        })
                        .collect();
                    self.peer_table.apply_peer_update(client_id, &blob.host, &topics).await;
                }
                Err(err) => warn!(%client_id, error = %err, "discarding malformed tcp discovery blob"),
            },
        }
    }

    /// Registers `callback` for `pattern`, opening a server socket the
    /// first time this exact pattern is subscribed and republishing
    /// the discovery blob either way.
    pub async fn subscribe<F>(self: &Arc<Self>, pattern: &str, callback: F) -> Result<SubscribeHandle>
    where
        F: Fn(TcpMessage) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().push(CallbackEntry {
            id,
            pattern: pattern.to_owned(),
            callback: Arc::new(callback),
        });

        let needs_server = !self.servers.lock().contains_key(pattern);
        if needs_server {
            let listener = TcpListener::bind("0.0.0.0:0").await?;
            let port = listener.local_addr()?.port();
            let crypto = if self.secure {
                Some(CryptoContext::generate())
            } else {
                None
            };

            let this = Arc::clone(self);
            let pattern_owned = pattern.to_owned();
            let accept_crypto = crypto.clone();
            let accept_task = tokio::spawn(async move {
                this.accept_loop(listener, pattern_owned, accept_crypto).await;
            });

            self.servers.lock().insert(
                pattern.to_owned(),
                ServerEntry {
                    port,
                    crypto,
                    accept_task,
                },
            );
        }

        self.republish_blob().await?;
        Ok(id)
    }

    /// Removes one callback registration. The server socket for its
    /// pattern is torn down once no callback references it anymore.
    pub async fn unsubscribe(&self, handle: SubscribeHandle) -> Result<()> {
        let pattern = {
            let mut callbacks = self.callbacks.lock();
            match callbacks.iter().position(|entry| entry.id == handle) {
                Some(index) => callbacks.remove(index).pattern,
                None => return Ok(()),
            }
        };

        let still_used = self.callbacks.lock().iter().any(|entry| entry.pattern == pattern);
        if !still_used {
            if let Some(entry) = self.servers.lock().remove(&pattern) {
                entry.accept_task.abort();
            }
        }

        self.republish_blob().await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, pattern: String, crypto: Option<CryptoContext>) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "tcp accept failed");
                    continue;
                }
            };
            let endpoint = match TcpEndpoint::new(stream, crypto.clone()) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!(%peer_addr, error = %err, "failed to prepare accepted tcp endpoint");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            let pattern = pattern.clone();
            tokio::spawn(async move {
                this.receive_loop(endpoint, pattern).await;
            });
        }
    }

    async fn receive_loop(self: Arc<Self>, mut endpoint: TcpEndpoint, pattern: String) {
        loop {
            let topic = match endpoint.recv_sized().await {
                Ok(Frame::Payload(bytes)) => match String::from_utf8(bytes) {
                    Ok(topic) => topic,
                    Err(_) => {
                        warn!("tcp peer sent a non-utf8 topic frame, closing connection");
                        return;
                    }
                },
                Ok(Frame::Empty) => {
                    warn!("tcp peer sent an empty topic frame, closing connection");
                    return;
                }
                Ok(Frame::Eof) => return,
                Err(err) => {
                    debug!(error = %err, "tcp receive loop ending on topic frame");
                    return;
                }
            };

            let header = match endpoint.recv_sized().await {
                Ok(Frame::Payload(bytes)) => decode_reply_header(&bytes).unwrap_or_default(),
                Ok(Frame::Empty) => ReplyHeader::default(),
                Ok(Frame::Eof) | Err(_) => return,
            };

            let payload = match endpoint.recv_sized().await {
                Ok(Frame::Payload(bytes)) => Bytes::from(bytes),
                Ok(Frame::Empty) => Bytes::new(),
                Ok(Frame::Eof) | Err(_) => return,
            };

            let message = TcpMessage {
                topic,
                payload,
                correlation: header.correlation.map(Bytes::from),
                reply_topic: header.reply_topic,
                sequence: header.sequence.unwrap_or(0),
                is_end_sequence: header.is_end_sequence.unwrap_or(true),
            };

            let snapshot: Vec<_> = self
                .callbacks
                .lock()
                .iter()
                .filter(|entry| entry.pattern == pattern)
                .map(|entry| entry.callback.clone())
                .collect();
            for callback in snapshot {
                callback(message.clone());
            }
        }
    }

    /// Fans `payload` out to every peer whose advertised pattern
    /// wildcard-matches `topic`. A failure against one peer drops
    /// that peer's lazy connection but never fails the publish call.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.publish_with_header(topic, payload, ReplyHeader::default()).await
    }

    /// Like [`publish`](Self::publish) but stamps reply metadata onto
    /// the small header frame that precedes the payload.
    pub async fn publish_with_reply(
        &self,
        topic: &str,
        payload: Bytes,
        correlation: Bytes,
        reply_topic: &str,
        sequence: u64,
        is_end_sequence: bool,
    ) -> Result<()> {
        let header = ReplyHeader {
            correlation: Some(correlation.to_vec()),
            reply_topic: Some(reply_topic.to_owned()),
            sequence: Some(sequence),
            is_end_sequence: Some(is_end_sequence),
        };
        self.publish_with_header(topic, payload, header).await
    }

    async fn publish_with_header(&self, topic: &str, payload: Bytes, header: ReplyHeader) -> Result<()> {
        let peers = self.peer_table.matching_peers(topic);
        let header_bytes = encode_reply_header(&header)?;

        for peer in peers {
            let result = peer.send_framed(topic.as_bytes(), &header_bytes, &payload).await;
            if let Err(err) = result {
                warn!(error = %err, "dropping tcp peer connection after publish failure");
            }
        }
        Ok(())
    }

    /// Sum of `num_of_cb` across every peer whose advertised pattern
    /// matches `topic` — the TCP half of the façade's
    /// `count_subscriber`.
    pub fn count_subscribers(&self, topic: &str) -> i64 {
        self.peer_table.count_subscribers(topic)
    }

    async fn republish_blob(&self) -> Result<()> {
        let topics = {
            let servers = self.servers.lock();
            let callbacks = self.callbacks.lock();
            servers
                .iter()
                .map(|(pattern, entry)| {
                    let num_of_cb = callbacks.iter().filter(|e| &e.pattern == pattern).count() as i64;
                    let (key, iv) = match &entry.crypto {
                        Some(ctx) => (Some(ctx.key().to_vec()), Some(ctx.iv().to_vec())),
                        None => (None, None),
                    };
                    (pattern.clone(), TopicTuple(entry.port, num_of_cb, key, iv))
                })
                .collect()
        };

        let blob = TcpBlob {
            host: self.my_ip.clone(),
            topics,
        };
        let bytes = encode_blob(&blob)?;
        self.discovery
            .update_module_state(self.module_name(), bytes.into())
            .await?;
        Ok(())
    }
}

fn encode_blob(blob: &TcpBlob) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(blob, &mut buf).map_err(|err| Error::Malformed(err.to_string()))?;
    Ok(buf)
}

fn decode_blob(data: &[u8]) -> Result<TcpBlob> {
    ciborium::from_reader(data).map_err(|err| Error::Malformed(err.to_string()))
}

fn encode_reply_header(header: &ReplyHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(header, &mut buf).map_err(|err| Error::Malformed(err.to_string()))?;
    Ok(buf)
}

fn decode_reply_header(data: &[u8]) -> Result<ReplyHeader> {
    ciborium::from_reader(data).map_err(|err| Error::Malformed(err.to_string()))
}
