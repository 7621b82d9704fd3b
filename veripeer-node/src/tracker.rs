//! Tracker client: peer directory and payload chunk store behind a narrow request/response
//! interface.
//!
//! [`HttpTracker`] talks to the coordination service over HTTP+JSON. [`MemoryTracker`] implements
//! the same semantics in process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use veripeer_core::{integrity, split_chunks, CHUNK_WIDTH};

/// Directory entry sent on register/deregister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: String,
    pub hostaddr: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub hostaddr: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerMessage {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadResponse {
    #[serde(rename = "payloadId")]
    payload_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PayloadQuery {
    id: String,
}

/// Payload as stored by the tracker. Chunk order matches upload order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub chunks: Vec<String>,
    #[serde(rename = "rootHash")]
    pub root_hash: String,
    #[serde(rename = "claimedString")]
    pub claimed_string: String,
}

impl PayloadRecord {
    pub fn from_payload(payload: &str) -> Self {
        let chunks = split_chunks(payload, CHUNK_WIDTH);
        Self {
            root_hash: integrity::root_hash(&chunks),
            chunks,
            claimed_string: payload.to_string(),
        }
    }

    /// Chunks concatenate to the claimed string and hash to the root hash.
    pub fn is_consistent(&self) -> bool {
        self.chunks.concat() == self.claimed_string
            && integrity::root_hash(&self.chunks) == self.root_hash
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PayloadResponse {
    Found(PayloadRecord),
    #[allow(dead_code)]
    Invalid { valid_payload: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tracker state lock poisoned")]
    Poisoned,
}

/// Coordination service operations used by a node.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn register(&self, peer: &PeerEntry) -> Result<TrackerMessage, TrackerError>;

    async fn deregister(&self, peer: &PeerEntry) -> Result<TrackerMessage, TrackerError>;

    /// Store a payload; returns its content-addressed id.
    async fn upload_payload(&self, request: &UploadRequest) -> Result<String, TrackerError>;

    /// `None` when the tracker does not know the id.
    async fn get_payload(&self, id: &str) -> Result<Option<PayloadRecord>, TrackerError>;

    async fn get_peers(&self) -> Result<BTreeMap<String, PeerAddress>, TrackerError>;
}

/// Tracker reached over HTTP with JSON bodies.
pub struct HttpTracker {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, TrackerError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn register(&self, peer: &PeerEntry) -> Result<TrackerMessage, TrackerError> {
        self.post("/register", peer).await
    }

    async fn deregister(&self, peer: &PeerEntry) -> Result<TrackerMessage, TrackerError> {
        self.post("/deregister", peer).await
    }

    async fn upload_payload(&self, request: &UploadRequest) -> Result<String, TrackerError> {
        let resp: UploadResponse = self.post("/upload_payload", request).await?;
        Ok(resp.payload_id)
    }

    async fn get_payload(&self, id: &str) -> Result<Option<PayloadRecord>, TrackerError> {
        let resp: PayloadResponse = self
            .post("/get_payload", &PayloadQuery { id: id.to_string() })
            .await?;
        Ok(match resp {
            PayloadResponse::Found(record) => Some(record),
            PayloadResponse::Invalid { .. } => None,
        })
    }

    async fn get_peers(&self) -> Result<BTreeMap<String, PeerAddress>, TrackerError> {
        let resp = self
            .client
            .get(self.url("/get_peers"))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[derive(Default)]
struct MemoryTrackerInner {
    peers: BTreeMap<String, PeerAddress>,
    payloads: HashMap<String, PayloadRecord>,
    descriptions: HashMap<String, String>,
}

/// In-process tracker with the same semantics as the coordination service.
#[derive(Default)]
pub struct MemoryTracker {
    inner: Mutex<MemoryTrackerInner>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn description(&self, id: &str) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|i| i.descriptions.get(id).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryTrackerInner>, TrackerError> {
        self.inner.lock().map_err(|_| TrackerError::Poisoned)
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    async fn register(&self, peer: &PeerEntry) -> Result<TrackerMessage, TrackerError> {
        let mut inner = self.lock()?;
        // One id per address: a re-registration evicts whatever id held it before.
        inner
            .peers
            .retain(|_, a| !(a.hostaddr == peer.hostaddr && a.port == peer.port));
        inner.peers.insert(
            peer.peer_id.clone(),
            PeerAddress {
                hostaddr: peer.hostaddr.clone(),
                port: peer.port,
            },
        );
        Ok(TrackerMessage {
            message: "Successfully Registered".to_string(),
        })
    }

    async fn deregister(&self, peer: &PeerEntry) -> Result<TrackerMessage, TrackerError> {
        let mut inner = self.lock()?;
        let message = match inner.peers.remove(&peer.peer_id) {
            Some(_) => "Successfully Deregistered",
            None => "Peer not found",
        };
        Ok(TrackerMessage {
            message: message.to_string(),
        })
    }

    async fn upload_payload(&self, request: &UploadRequest) -> Result<String, TrackerError> {
        let id = integrity::payload_id(&request.payload);
        let mut inner = self.lock()?;
        inner
            .payloads
            .entry(id.clone())
            .or_insert_with(|| PayloadRecord::from_payload(&request.payload));
        if let Some(desc) = &request.desc {
            inner.descriptions.insert(id.clone(), desc.clone());
        }
        Ok(id)
    }

    async fn get_payload(&self, id: &str) -> Result<Option<PayloadRecord>, TrackerError> {
        Ok(self.lock()?.payloads.get(id).cloned())
    }

    async fn get_peers(&self) -> Result<BTreeMap<String, PeerAddress>, TrackerError> {
        Ok(self.lock()?.peers.clone())
    }
}
