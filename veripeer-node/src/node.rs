//! Peer node: owns the listener, the peer registry, the live outbound channel and the payload
//! cache.
//!
//! The accept loop serves one inbound exchange at a time: each accepted connection is handed to its
//! own task and the loop waits for that task before accepting again. Outbound exchanges run on the
//! caller's task. Registry, live channel, payload cache and tracker handle are each behind a mutex
//! since both the accept loop and callers touch them.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use veripeer_core::{
    build_claim_set, ActivityError, ActivityEvent, ActivityRecorder, ActivityStore,
    ClaimSet, ClaimSetError, MemoryStore, PeerId, PeerIdentity, Severity, VerificationVerdict,
};

use crate::channel::{handshake_accept, handshake_connect, Channel, ChannelError, Role};
use crate::config::Config;
use crate::tracker::{
    HttpTracker, PayloadRecord, PeerAddress, PeerEntry, Tracker, TrackerError, UploadRequest,
};

/// Locally held payloads: payload id -> claimed string.
pub type PayloadCache = HashMap<String, String>;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Bound and listening at the socket level; accept loop not started.
    Created,
    Listening,
    /// Stop requested; the accept loop exits at its next wake-up.
    Stopping,
    Stopped,
}

/// Registry entry for a peer we completed a handshake with.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote: PeerIdentity,
    pub role: Role,
    pub established_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("connection to {addr} failed: {source}")]
    Connect { addr: String, source: ChannelError },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("node is not registered with a tracker")]
    NotRegistered,
    #[error("unknown payload {0}")]
    UnknownPayload(String),
    #[error("tracker returned an inconsistent record for payload {0}")]
    InconsistentPayload(String),
    #[error(transparent)]
    ClaimSet(#[from] ClaimSetError),
    #[error("no live channel; connect to a node first")]
    NoLiveChannel,
    #[error("accept loop already started or node stopped")]
    AlreadyRunning,
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Activity(#[from] ActivityError),
}

struct NodeInner {
    identity: PeerIdentity,
    io_timeout: Duration,
    listener: Mutex<Option<TcpListener>>,
    lifecycle: watch::Sender<Lifecycle>,
    registry: Mutex<HashMap<PeerId, ConnectionInfo>>,
    live_channel: Mutex<Option<Channel>>,
    payloads: Mutex<PayloadCache>,
    payloads_sent: Mutex<Vec<String>>,
    tracker: Mutex<Option<Arc<dyn Tracker>>>,
    recorder: ActivityRecorder,
}

/// Handle to a peer node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bind with an in-memory activity store.
    pub async fn bind(config: &Config) -> Result<Self, NodeError> {
        Self::bind_with_store(config, Arc::new(MemoryStore::new())).await
    }

    /// Bind the listening socket and generate the node identity.
    pub async fn bind_with_store(
        config: &Config,
        store: Arc<dyn ActivityStore>,
    ) -> Result<Self, NodeError> {
        let target = format!("{}:{}", config.host, config.port);
        let addr = lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(|source| NodeError::Bind {
                addr: target.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| NodeError::Resolve(target.clone()))?;
        let listener = listen(addr, config.backlog).map_err(|source| NodeError::Bind {
            addr: target.clone(),
            source,
        })?;
        let port = listener
            .local_addr()
            .map_err(|source| NodeError::Bind {
                addr: target,
                source,
            })?
            .port();

        let identity = PeerIdentity::new(PeerId::generate(), config.host.clone(), port);
        let recorder = ActivityRecorder::new(identity.clone(), store, config.retention);
        tracing::info!("{} created a peer with id {}", identity.address(), identity.id);
        let (lifecycle, _) = watch::channel(Lifecycle::Created);

        Ok(Self {
            inner: Arc::new(NodeInner {
                identity,
                io_timeout: config.io_timeout(),
                listener: Mutex::new(Some(listener)),
                lifecycle,
                registry: Mutex::new(HashMap::new()),
                live_channel: Mutex::new(None),
                payloads: Mutex::new(PayloadCache::new()),
                payloads_sent: Mutex::new(Vec::new()),
                tracker: Mutex::new(None),
                recorder,
            }),
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.identity
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.identity.id
    }

    /// `host:port` this node listens on.
    pub fn address(&self) -> String {
        self.inner.identity.address()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.borrow()
    }

    pub fn recorder(&self) -> &ActivityRecorder {
        &self.inner.recorder
    }

    /// Run the accept loop on a new task.
    pub fn spawn(&self) -> JoinHandle<Result<(), NodeError>> {
        let node = self.clone();
        tokio::spawn(async move { node.run().await })
    }

    /// Accept loop. Returns once [`Node::kill`] has been called.
    pub async fn run(&self) -> Result<(), NodeError> {
        let started = self.inner.lifecycle.send_if_modified(|s| {
            if *s == Lifecycle::Created {
                *s = Lifecycle::Listening;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(NodeError::AlreadyRunning);
        }
        let listener = self
            .inner
            .listener
            .lock()
            .await
            .take()
            .ok_or(NodeError::AlreadyRunning)?;
        let mut state = self.inner.lifecycle.subscribe();
        tracing::info!("{} listening", self.address());

        loop {
            if *state.borrow_and_update() != Lifecycle::Listening {
                break;
            }
            let accepted = tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let node = self.clone();
                    let exchange =
                        tokio::spawn(async move { node.serve_inbound(stream, addr).await });
                    if let Err(e) = exchange.await {
                        tracing::warn!("{} inbound exchange task failed: {}", self.address(), e);
                    }
                }
                Err(e) => {
                    self.inner
                        .recorder
                        .record_failure(Severity::Connect, format!("accept failed: {e}"));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        drop(listener);
        self.inner.lifecycle.send_replace(Lifecycle::Stopped);
        self.inner.recorder.record(Severity::Shutdown, "listener closed");
        Ok(())
    }

    async fn serve_inbound(&self, mut stream: TcpStream, addr: SocketAddr) {
        let inner = &self.inner;
        let handshake = handshake_accept(&mut stream, &inner.identity.id, inner.io_timeout).await;
        let remote_id = match handshake {
            Ok(id) => id,
            Err(e) => {
                inner.recorder.record_failure(
                    Severity::Handshake,
                    format!("handshake with {addr} failed: {e}"),
                );
                return;
            }
        };
        inner
            .recorder
            .record(Severity::Handshake, format!("ids exchanged with {addr} ({remote_id})"));

        let remote = PeerIdentity::new(remote_id, addr.ip().to_string(), addr.port());
        self.register_connection(remote.clone(), Role::Responder).await;
        let channel = Channel::new(
            stream,
            remote,
            Role::Responder,
            inner.io_timeout,
            inner.recorder.clone(),
        );
        if let Err(e) = channel.respond(&inner.payloads).await {
            inner
                .recorder
                .record_failure(Severity::ParseClaim, format!("exchange with {addr} failed: {e}"));
        }
    }

    async fn register_connection(&self, remote: PeerIdentity, role: Role) {
        let info = ConnectionInfo {
            remote,
            role,
            established_at: Utc::now(),
        };
        self.inner
            .registry
            .lock()
            .await
            .insert(info.remote.id.clone(), info);
    }

    /// Open an outbound connection, exchange ids and make it the live channel.
    ///
    /// A previous live channel is closed before dialing: its peer serves one exchange at a time
    /// and would not accept a new handshake while the old socket is still open.
    pub async fn connect_to_node(&self, host: &str, port: u16) -> Result<PeerIdentity, NodeError> {
        let previous = self.inner.live_channel.lock().await.take();
        if let Some(previous) = previous {
            tracing::debug!(
                "{} closing live channel to {}",
                self.address(),
                previous.remote().address()
            );
            previous.close().await;
        }
        match self.open_channel(host, port).await {
            Ok(channel) => {
                let remote = channel.remote().clone();
                self.register_connection(remote.clone(), Role::Initiator).await;
                *self.inner.live_channel.lock().await = Some(channel);
                self.inner.recorder.record(
                    Severity::Connect,
                    format!("connected to {host}:{port} ({})", remote.id),
                );
                Ok(remote)
            }
            Err(e) => {
                self.inner
                    .recorder
                    .record_failure(Severity::Connect, e.to_string());
                Err(e)
            }
        }
    }

    async fn open_channel(&self, host: &str, port: u16) -> Result<Channel, NodeError> {
        let inner = &self.inner;
        let addr = format!("{host}:{port}");
        let mut stream = match timeout(inner.io_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(NodeError::Connect {
                    addr,
                    source: ChannelError::Io(e),
                })
            }
            Err(_) => {
                return Err(NodeError::Connect {
                    addr,
                    source: ChannelError::Timeout("connect"),
                })
            }
        };
        let remote_id = handshake_connect(&mut stream, &inner.identity.id, inner.io_timeout)
            .await
            .map_err(|source| NodeError::Connect {
                addr: addr.clone(),
                source,
            })?;
        inner
            .recorder
            .record(Severity::Handshake, format!("ids exchanged with {addr} ({remote_id})"));
        Ok(Channel::new(
            stream,
            PeerIdentity::new(remote_id, host, port),
            Role::Initiator,
            inner.io_timeout,
            inner.recorder.clone(),
        ))
    }

    /// Build a claim set from the cached copy of `payload_id` and send it over the live channel.
    /// `positions` selects which position each chunk is claimed at; `None` claims every chunk in
    /// order.
    pub async fn verify_payload(
        &self,
        payload_id: &str,
        positions: Option<&[usize]>,
    ) -> Result<VerificationVerdict, NodeError> {
        let claimed = self.inner.payloads.lock().await.get(payload_id).cloned();
        let Some(claimed) = claimed else {
            self.inner.recorder.record_failure(
                Severity::VerifyClaim,
                format!("cannot verify unknown payload {payload_id}"),
            );
            return Err(NodeError::UnknownPayload(payload_id.to_string()));
        };
        let claim_set = build_claim_set(payload_id, &claimed, positions).map_err(|e| {
            self.inner
                .recorder
                .record_failure(Severity::VerifyClaim, format!("claim set for {payload_id}: {e}"));
            e
        })?;
        self.verify_claim_set(&claim_set).await
    }

    /// Send an arbitrary claim set over the live channel and return the peer's verdict. The live
    /// channel is consumed by the exchange.
    pub async fn verify_claim_set(
        &self,
        claim_set: &ClaimSet,
    ) -> Result<VerificationVerdict, NodeError> {
        let channel = self.inner.live_channel.lock().await.take();
        let Some(channel) = channel else {
            self.inner
                .recorder
                .record_failure(Severity::VerifyClaim, "no live channel to verify over");
            return Err(NodeError::NoLiveChannel);
        };
        let remote = channel.remote().address();
        match channel
            .send_data::<_, VerificationVerdict>(claim_set, Severity::VerifyClaim)
            .await
        {
            Ok(verdict) => {
                tracing::info!(
                    "{} verdict from {} for {}: available={} matches={:?}",
                    self.address(),
                    remote,
                    claim_set.payload_id,
                    verdict.chunk_available,
                    verdict.matches()
                );
                Ok(verdict)
            }
            Err(e) => {
                self.inner.recorder.record_failure(
                    Severity::VerifyClaim,
                    format!("verification with {remote} failed: {e}"),
                );
                Err(e.into())
            }
        }
    }

    fn peer_entry(&self) -> PeerEntry {
        PeerEntry {
            peer_id: self.inner.identity.id.to_string(),
            hostaddr: self.inner.identity.host.clone(),
            port: self.inner.identity.port,
        }
    }

    async fn tracker(&self, severity: Severity) -> Result<Arc<dyn Tracker>, NodeError> {
        let tracker = self.inner.tracker.lock().await.clone();
        tracker.ok_or_else(|| {
            self.inner
                .recorder
                .record_failure(severity, "no tracker registered");
            NodeError::NotRegistered
        })
    }

    pub async fn is_registered(&self) -> bool {
        self.inner.tracker.lock().await.is_some()
    }

    /// Register this node with `tracker`; later tracker operations go to it.
    pub async fn register(&self, tracker: Arc<dyn Tracker>) -> Result<String, NodeError> {
        match tracker.register(&self.peer_entry()).await {
            Ok(reply) => {
                *self.inner.tracker.lock().await = Some(tracker);
                self.inner
                    .recorder
                    .record(Severity::RegisterPeer, format!("registered: {}", reply.message));
                Ok(reply.message)
            }
            Err(e) => {
                self.inner
                    .recorder
                    .record_failure(Severity::RegisterPeer, format!("register failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Register with the HTTP tracker at `base_url`.
    pub async fn register_url(&self, base_url: &str) -> Result<String, NodeError> {
        let tracker = HttpTracker::new(base_url, self.inner.io_timeout)?;
        self.register(Arc::new(tracker)).await
    }

    pub async fn deregister(&self) -> Result<String, NodeError> {
        let tracker = self.tracker(Severity::DeregisterPeer).await?;
        match tracker.deregister(&self.peer_entry()).await {
            Ok(reply) => {
                *self.inner.tracker.lock().await = None;
                self.inner
                    .recorder
                    .record(Severity::DeregisterPeer, format!("deregistered: {}", reply.message));
                Ok(reply.message)
            }
            Err(e) => {
                self.inner
                    .recorder
                    .record_failure(Severity::DeregisterPeer, format!("deregister failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Upload a payload to the tracker and cache it locally. Returns the payload id.
    pub async fn upload_payload(
        &self,
        payload: &str,
        desc: Option<&str>,
    ) -> Result<String, NodeError> {
        let tracker = self.tracker(Severity::UploadPayload).await?;
        let request = UploadRequest {
            payload: payload.to_string(),
            desc: desc.map(str::to_string),
        };
        match tracker.upload_payload(&request).await {
            Ok(id) => {
                self.inner
                    .payloads
                    .lock()
                    .await
                    .insert(id.clone(), payload.to_string());
                self.inner.payloads_sent.lock().await.push(id.clone());
                self.inner
                    .recorder
                    .record(Severity::UploadPayload, format!("uploaded payload {id}"));
                Ok(id)
            }
            Err(e) => {
                self.inner
                    .recorder
                    .record_failure(Severity::UploadPayload, format!("upload failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Fetch a payload's chunks from the tracker and cache the claimed string locally.
    pub async fn query_payload(&self, payload_id: &str) -> Result<PayloadRecord, NodeError> {
        let tracker = self.tracker(Severity::QueryPayload).await?;
        let record = match tracker.get_payload(payload_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.inner.recorder.record_failure(
                    Severity::QueryPayload,
                    format!("tracker has no payload {payload_id}"),
                );
                return Err(NodeError::UnknownPayload(payload_id.to_string()));
            }
            Err(e) => {
                self.inner
                    .recorder
                    .record_failure(Severity::QueryPayload, format!("query failed: {e}"));
                return Err(e.into());
            }
        };
        if !record.is_consistent() {
            self.inner.recorder.record_failure(
                Severity::QueryPayload,
                format!("tracker record for {payload_id} does not match its chunks"),
            );
            return Err(NodeError::InconsistentPayload(payload_id.to_string()));
        }
        self.inner
            .payloads
            .lock()
            .await
            .insert(payload_id.to_string(), record.claimed_string.clone());
        self.inner.recorder.record(
            Severity::QueryPayload,
            format!("queried payload {payload_id} ({} chunks)", record.chunks.len()),
        );
        Ok(record)
    }

    pub async fn get_peers(&self) -> Result<BTreeMap<String, PeerAddress>, NodeError> {
        let tracker = self.tracker(Severity::GetPeers).await?;
        match tracker.get_peers().await {
            Ok(peers) => {
                self.inner
                    .recorder
                    .record(Severity::GetPeers, format!("{} peers listed", peers.len()));
                Ok(peers)
            }
            Err(e) => {
                self.inner
                    .recorder
                    .record_failure(Severity::GetPeers, format!("peer list failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Request a stop. A running accept loop exits and closes the listener; a node that never ran
    /// closes its listener here.
    pub async fn kill(&self) {
        self.inner.recorder.record(Severity::Kill, "kill requested");
        let mut never_ran = false;
        self.inner.lifecycle.send_modify(|s| match *s {
            Lifecycle::Created => {
                *s = Lifecycle::Stopped;
                never_ran = true;
            }
            Lifecycle::Listening => *s = Lifecycle::Stopping,
            Lifecycle::Stopping | Lifecycle::Stopped => {}
        });
        if never_ran {
            self.inner.listener.lock().await.take();
            self.inner.recorder.record(Severity::Shutdown, "listener closed");
        }
    }

    /// Wait until the accept loop has exited.
    pub async fn stopped(&self) {
        let mut state = self.inner.lifecycle.subscribe();
        let _ = state.wait_for(|s| *s == Lifecycle::Stopped).await;
    }

    pub async fn connected_peers(&self) -> Vec<ConnectionInfo> {
        self.inner.registry.lock().await.values().cloned().collect()
    }

    /// Remote end of the live channel, if one is waiting to be used.
    pub async fn live_peer(&self) -> Option<PeerIdentity> {
        self.inner
            .live_channel
            .lock()
            .await
            .as_ref()
            .map(|c| c.remote().clone())
    }

    pub async fn available_payloads(&self) -> Vec<String> {
        self.inner.payloads.lock().await.keys().cloned().collect()
    }

    /// Ids this node uploaded, oldest first.
    pub async fn payloads_sent(&self) -> Vec<String> {
        self.inner.payloads_sent.lock().await.clone()
    }

    pub fn metrics(
        &self,
        filter: Option<&[Severity]>,
        ignore_id: bool,
    ) -> Result<BTreeMap<&'static str, u64>, NodeError> {
        Ok(self.inner.recorder.metrics(filter, ignore_id)?)
    }

    pub fn events(&self, severity: Severity) -> Result<Vec<ActivityEvent>, NodeError> {
        Ok(self.inner.recorder.events(severity)?)
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}
