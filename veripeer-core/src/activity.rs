//! Activity recording: every protocol and tracker event is classified by [`Severity`], appended to
//! a bounded per-stream log and counted in a never-trimmed counter.
//!
//! Streams are keyed by (band, host, port, node id, severity). The band splits peer-to-peer events
//! from tracker events; consumers key on it, so it is part of the stream key and never inferred.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PeerIdentity};

/// Default number of log entries kept per stream.
pub const DEFAULT_RETENTION: usize = 100;

/// Log stream an event is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Band {
    P2p,
    Tracker,
}

impl Band {
    pub fn as_str(self) -> &'static str {
        match self {
            Band::P2p => "p2p",
            Band::Tracker => "tracker",
        }
    }
}

/// Event taxonomy. Discriminants are the wire/storage codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Handshake = 1,
    Kill = 2,
    Shutdown = 3,
    VerifyClaim = 4,
    ParseClaim = 5,
    Connect = 6,
    UploadPayload = 10,
    QueryPayload = 11,
    RegisterPeer = 12,
    DeregisterPeer = 13,
    GetPeers = 14,
}

impl Severity {
    pub const ALL: [Severity; 11] = [
        Severity::Handshake,
        Severity::Kill,
        Severity::Shutdown,
        Severity::VerifyClaim,
        Severity::ParseClaim,
        Severity::Connect,
        Severity::UploadPayload,
        Severity::QueryPayload,
        Severity::RegisterPeer,
        Severity::DeregisterPeer,
        Severity::GetPeers,
    ];

    pub fn band(self) -> Band {
        match self {
            Severity::Handshake
            | Severity::Kill
            | Severity::Shutdown
            | Severity::VerifyClaim
            | Severity::ParseClaim
            | Severity::Connect => Band::P2p,
            Severity::UploadPayload
            | Severity::QueryPayload
            | Severity::RegisterPeer
            | Severity::DeregisterPeer
            | Severity::GetPeers => Band::Tracker,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Severity::Handshake => "HANDSHAKE",
            Severity::Kill => "KILL",
            Severity::Shutdown => "SHUTDOWN",
            Severity::VerifyClaim => "VERIFY_CLAIM",
            Severity::ParseClaim => "PARSE_CLAIM",
            Severity::Connect => "CONNECT",
            Severity::UploadPayload => "UPLOAD_PAYLOAD",
            Severity::QueryPayload => "QUERY_PAYLOAD",
            Severity::RegisterPeer => "REGISTER_PEER",
            Severity::DeregisterPeer => "DEREGISTER_PEER",
            Severity::GetPeers => "GET_PEERS",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How many log entries a stream keeps. Counters are never trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Keep the newest N entries.
    Bounded(usize),
    Unbounded,
}

impl Default for Retention {
    fn default() -> Self {
        Retention::Bounded(DEFAULT_RETENTION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
}

/// Key of one log stream and its counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub band: Band,
    pub host: String,
    pub port: u16,
    pub node_id: PeerId,
    pub severity: Severity,
}

impl StreamKey {
    pub fn new(identity: &PeerIdentity, severity: Severity) -> Self {
        Self {
            band: severity.band(),
            host: identity.host.clone(),
            port: identity.port,
            node_id: identity.id.clone(),
            severity,
        }
    }

    pub fn counter_key(&self) -> String {
        format!("{self}:count")
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.band.as_str(),
            self.host,
            self.port,
            self.node_id,
            self.severity.name()
        )
    }
}

/// Selects counters at one address for one severity; `node_id: None` matches every node id.
#[derive(Debug, Clone, Copy)]
pub struct StreamFilter<'a> {
    pub host: &'a str,
    pub port: u16,
    pub node_id: Option<&'a PeerId>,
    pub severity: Severity,
}

impl StreamFilter<'_> {
    pub fn matches(&self, key: &StreamKey) -> bool {
        key.severity == self.severity
            && key.port == self.port
            && key.host == self.host
            && self.node_id.map_or(true, |id| *id == key.node_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("unknown severity code {0}")]
    UnknownSeverity(u8),
    #[error("activity store lock poisoned")]
    Poisoned,
}

/// Storage for activity streams. `append` must push, trim and increment as one atomic step.
pub trait ActivityStore: Send + Sync {
    fn append(
        &self,
        key: &StreamKey,
        event: ActivityEvent,
        retention: Retention,
    ) -> Result<(), ActivityError>;

    /// Retained events of a stream, oldest first.
    fn events(&self, key: &StreamKey) -> Result<Vec<ActivityEvent>, ActivityError>;

    /// Sum of all counters matching `filter`.
    fn sum_counters(&self, filter: &StreamFilter<'_>) -> Result<u64, ActivityError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    logs: HashMap<StreamKey, VecDeque<ActivityEvent>>,
    counters: HashMap<StreamKey, u64>,
}

/// In-process store. One mutex covers logs and counters.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivityStore for MemoryStore {
    fn append(
        &self,
        key: &StreamKey,
        event: ActivityEvent,
        retention: Retention,
    ) -> Result<(), ActivityError> {
        let mut inner = self.inner.lock().map_err(|_| ActivityError::Poisoned)?;
        let log = inner.logs.entry(key.clone()).or_default();
        log.push_back(event);
        if let Retention::Bounded(n) = retention {
            while log.len() > n {
                log.pop_front();
            }
        }
        *inner.counters.entry(key.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn events(&self, key: &StreamKey) -> Result<Vec<ActivityEvent>, ActivityError> {
        let inner = self.inner.lock().map_err(|_| ActivityError::Poisoned)?;
        Ok(inner
            .logs
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn sum_counters(&self, filter: &StreamFilter<'_>) -> Result<u64, ActivityError> {
        let inner = self.inner.lock().map_err(|_| ActivityError::Poisoned)?;
        Ok(inner
            .counters
            .iter()
            .filter(|(k, _)| filter.matches(k))
            .map(|(_, n)| *n)
            .sum())
    }
}

/// Records events for one node.
#[derive(Clone)]
pub struct ActivityRecorder {
    identity: PeerIdentity,
    store: Arc<dyn ActivityStore>,
    retention: Retention,
}

impl ActivityRecorder {
    pub fn new(
        identity: PeerIdentity,
        store: Arc<dyn ActivityStore>,
        retention: Retention,
    ) -> Self {
        Self {
            identity,
            store,
            retention,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Record a successful or neutral event.
    pub fn record(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(
            target: "veripeer::activity",
            severity = severity.name(),
            "{} {}",
            self.identity.address(),
            message
        );
        self.persist(severity, message);
    }

    /// Record a failed operation. Persisted like any other event, logged at warn level.
    pub fn record_failure(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(
            target: "veripeer::activity",
            severity = severity.name(),
            "{} {}",
            self.identity.address(),
            message
        );
        self.persist(severity, message);
    }

    /// Record by numeric code. Unknown codes are rejected and nothing is persisted.
    pub fn record_code(&self, code: u8, message: impl Into<String>) -> Result<(), ActivityError> {
        match Severity::from_code(code) {
            Some(severity) => {
                self.record(severity, message);
                Ok(())
            }
            None => {
                tracing::warn!(
                    "{} ignoring event with unknown severity code {}",
                    self.identity.address(),
                    code
                );
                Err(ActivityError::UnknownSeverity(code))
            }
        }
    }

    fn persist(&self, severity: Severity, message: String) {
        let key = StreamKey::new(&self.identity, severity);
        let event = ActivityEvent {
            timestamp: Utc::now(),
            message,
            severity,
        };
        if let Err(e) = self.store.append(&key, event, self.retention) {
            tracing::warn!(
                stream = %key,
                counter = %key.counter_key(),
                error = %e,
                "failed to persist activity event"
            );
        }
    }

    /// Counter totals per severity name. `filter: None` reports every severity. With `ignore_id`
    /// the totals cover every node id seen at this host:port.
    pub fn metrics(
        &self,
        filter: Option<&[Severity]>,
        ignore_id: bool,
    ) -> Result<BTreeMap<&'static str, u64>, ActivityError> {
        let severities = filter.unwrap_or(&Severity::ALL);
        let mut out = BTreeMap::new();
        for &severity in severities {
            let f = StreamFilter {
                host: &self.identity.host,
                port: self.identity.port,
                node_id: if ignore_id {
                    None
                } else {
                    Some(&self.identity.id)
                },
                severity,
            };
            out.insert(severity.name(), self.store.sum_counters(&f)?);
        }
        Ok(out)
    }

    /// Retained events of one severity for this node, oldest first.
    pub fn events(&self, severity: Severity) -> Result<Vec<ActivityEvent>, ActivityError> {
        self.store.events(&StreamKey::new(&self.identity, severity))
    }
}
