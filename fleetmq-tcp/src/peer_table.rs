//! Transport-private view of remote peers, rebuilt from each
//! `TCP`/`SECURE_TCP` discovery blob update.
//!
//! Keyed by `(subscribed pattern, client_id)` rather than by topic
//! alone, since two peers may subscribe to overlapping wildcard
//! patterns independently. A connection is opened lazily on first
//! publish and kept open across discovery updates as long as the
//! peer's port does not change.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::crypto::CryptoContext;
use crate::endpoint::TcpEndpoint;
use crate::{Error, Result};

/// One topic entry out of a peer's decoded discovery blob.
pub struct PeerTopicUpdate {
    pub pattern: String,
    pub port: u16,
    pub num_of_cb: i64,
    pub crypto: Option<CryptoContext>,
}

pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
    pub crypto: Option<CryptoContext>,
    num_of_cb: AtomicI64,
    lazy: AsyncMutex<Option<TcpEndpoint>>,
}

impl PeerEndpoint {
    fn new(host: String, port: u16, num_of_cb: i64, crypto: Option<CryptoContext>) -> Self {
        Self {
            host,
            port,
            crypto,
            num_of_cb: AtomicI64::new(num_of_cb),
            lazy: AsyncMutex::new(None),
        }
    }

    pub fn num_of_cb(&self) -> i64 {
        self.num_of_cb.load(Ordering::Relaxed)
    }

    fn set_num_of_cb(&self, value: i64) {
        self.num_of_cb.store(value, Ordering::Relaxed);
    }

    /// Sends one logical publish — topic, reply header, payload — to
    /// this peer, dialing a connection lazily on first use. A
    /// connection that errors mid-send is dropped so the next publish
    /// redials rather than reusing a dead socket.
    pub async fn send_framed(&self, topic: &[u8], header: &[u8], payload: &[u8]) -> Result<()> {
        let mut guard = self.lazy.lock().await;
        if guard.is_none() {
            let addr: std::net::SocketAddr = format!("{}:{}", self.host, self.port)
                .parse()
                .map_err(|_| Error::InvalidPeerAddress(self.host.clone()))?;
            *guard = Some(TcpEndpoint::connect(addr, self.crypto.clone()).await?);
        }
        let endpoint = guard.as_mut().expect("connection just established");

        let result = async {
            endpoint.send_sized(topic).await?;
            endpoint.send_sized(header).await?;
            endpoint.send_sized(payload).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn clear(&self) {
        *self.lazy.lock().await = None;
    }
}

#[derive(Default)]
pub struct TcpPeerTable {
    patterns: Mutex<HashMap<String, HashMap<String, Arc<PeerEndpoint>>>>,
}

impl TcpPeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a freshly decoded discovery blob for `client_id`.
    /// Patterns the peer no longer advertises are dropped; patterns
    /// whose port is unchanged keep their existing (possibly open)
    /// connection; patterns whose port changed get a fresh entry and
    /// the old connection is closed.
    pub async fn apply_peer_update(&self, client_id: &str, host: &str, topics: &[PeerTopicUpdate]) {
        let fresh: HashSet<&str> = topics.iter().map(|t| t.pattern.as_str()).collect();

        let stale = {
            let mut table = self.patterns.lock();
            let mut stale = Vec::new();
            for (pattern, peers) in table.iter_mut() {
                if !fresh.contains(pattern.as_str()) {
                    if let Some(peer) = peers.remove(client_id) {
                        stale.push(peer);
                    }
                }
            }
            table.retain(|_, peers| !peers.is_empty());
            stale
        };
        for peer in stale {
            peer.clear().await;
        }

        for update in topics {
            let existing = {
                let table = self.patterns.lock();
                table
                    .get(&update.pattern)
                    .and_then(|peers| peers.get(client_id))
                    .cloned()
            };

            if let Some(peer) = &existing {
                if peer.port == update.port {
                    peer.set_num_of_cb(update.num_of_cb);
                    continue;
                }
                peer.clear().await;
            }

            let peer = Arc::new(PeerEndpoint::new(
                host.to_owned(),
                update.port,
                update.num_of_cb,
                update.crypto.clone(),
            ));
            self.patterns
                .lock()
                .entry(update.pattern.clone())
                .or_default()
                .insert(client_id.to_owned(), peer);
        }
    }

    /// Drops every connection belonging to `client_id` (the peer
    /// disconnected, ungracefully or otherwise).
    pub async fn remove_peer(&self, client_id: &str) {
        let removed = {
            let mut table = self.patterns.lock();
            let mut removed = Vec::new();
            for peers in table.values_mut() {
                if let Some(peer) = peers.remove(client_id) {
                    removed.push(peer);
                }
            }
            table.retain(|_, peers| !peers.is_empty());
            removed
        };
        for peer in removed {
            peer.clear().await;
        }
    }

    /// Every peer whose advertised pattern wildcard-matches `topic`.
    pub fn matching_peers(&self, topic: &str) -> Vec<Arc<PeerEndpoint>> {
        self.patterns
            .lock()
            .iter()
            .filter(|(pattern, _)| fleetmq_mqtt::topic_match(pattern, topic))
            .flat_map(|(_, peers)| peers.values().cloned())
            .collect()
    }

    pub fn count_subscribers(&self, topic: &str) -> i64 {
        self.matching_peers(topic).iter().map(|peer| peer.num_of_cb()).sum()
    }
}
