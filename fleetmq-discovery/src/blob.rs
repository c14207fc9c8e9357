//! CBOR encoding of the discovery payload: a `status` string plus one
//! opaque blob per announced module. Format-agnostic by design — the
//! schema of each module's blob is private to that module.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryMessage {
    pub status: Option<PeerStatus>,
    pub modules: HashMap<String, Bytes>,
}

#[derive(Serialize, Deserialize)]
struct Wire {
    status: String,
    #[serde(flatten)]
    modules: HashMap<String, Vec<u8>>,
}

const STATUS_CONNECTED: &str = "connected";
const STATUS_DISCONNECTED: &str = "disconnected";

pub fn encode(status: PeerStatus, modules: &HashMap<String, Bytes>) -> Result<Vec<u8>> {
    let wire = Wire {
        status: match status {
            PeerStatus::Connected => STATUS_CONNECTED.to_owned(),
            PeerStatus::Disconnected => STATUS_DISCONNECTED.to_owned(),
        },
        modules: modules
            .iter()
            .map(|(k, v)| (k.clone(), v.to_vec()))
            .collect(),
    };
    let mut buf = Vec::new();
    ciborium::into_writer(&wire, &mut buf).map_err(|err| Error::Malformed(err.to_string()))?;
    Ok(buf)
}

pub fn decode(payload: &[u8]) -> Result<DiscoveryMessage> {
    let wire: Wire =
        ciborium::from_reader(payload).map_err(|err| Error::Malformed(err.to_string()))?;
    let status = match wire.status.as_str() {
        STATUS_CONNECTED => Some(PeerStatus::Connected),
        STATUS_DISCONNECTED => Some(PeerStatus::Disconnected),
        other => return Err(Error::Malformed(format!("unknown status {other:?}"))),
    };
    Ok(DiscoveryMessage {
        status,
        modules: wire
            .modules
            .into_iter()
            .map(|(k, v)| (k, Bytes::from(v)))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_modules() {
        let mut modules = HashMap::new();
        modules.insert("TCP".to_owned(), Bytes::from_static(b"blob"));
        let encoded = encode(PeerStatus::Connected, &modules).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.status, Some(PeerStatus::Connected));
        assert_eq!(decoded.modules.get("TCP").unwrap(), &Bytes::from_static(b"blob"));
    }
}
