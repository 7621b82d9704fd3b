//! Connection channel: raw id handshake, then one framed request/response exchange over TCP.
//!
//! Both roles close the socket after a single request/response cycle. A channel is therefore used
//! exactly once; the node opens a fresh one for every verification it initiates.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use veripeer_core::identity::MAX_ID_LEN;
use veripeer_core::wire::RECV_CHUNK;
use veripeer_core::{
    encode_frame, evaluate_claim_set, ActivityRecorder, FrameDecoder, FrameError, IdentityError,
    PeerId, PeerIdentity, Severity, VerificationVerdict,
};

use crate::node::PayloadCache;

/// Which side of the exchange a channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection; sends one request and waits for the reply.
    Initiator,
    /// Accepted the connection; waits for one request and answers it.
    Responder,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection closed during handshake")]
    HandshakeClosed,
    #[error("invalid peer id: {0}")]
    Identity(#[from] IdentityError),
    #[error("malformed message body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Write one frame: payload + sentinel.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> std::io::Result<()> {
    w.write_all(&encode_frame(body)).await?;
    w.flush().await
}

/// Read until a sentinel has been seen; returns the message without it.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; RECV_CHUNK];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        if let Some(message) = decoder.push(&buf[..n])? {
            return Ok(message);
        }
    }
}

async fn with_deadline<T, E>(
    limit: Duration,
    op: &'static str,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, ChannelError>
where
    ChannelError: From<E>,
{
    match timeout(limit, fut).await {
        Ok(r) => r.map_err(ChannelError::from),
        Err(_) => Err(ChannelError::Timeout(op)),
    }
}

async fn read_raw_id(stream: &mut TcpStream) -> Result<PeerId, ChannelError> {
    let mut buf = vec![0u8; MAX_ID_LEN];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(ChannelError::HandshakeClosed);
    }
    Ok(PeerId::from_wire(&buf[..n])?)
}

async fn write_raw_id(stream: &mut TcpStream, id: &PeerId) -> Result<(), ChannelError> {
    stream.write_all(id.as_str().as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Accept side of the handshake: read the remote id, then send ours. Unframed.
pub async fn handshake_accept(
    stream: &mut TcpStream,
    local: &PeerId,
    limit: Duration,
) -> Result<PeerId, ChannelError> {
    with_deadline(limit, "handshake", async {
        let remote = read_raw_id(stream).await?;
        write_raw_id(stream, local).await?;
        Ok::<_, ChannelError>(remote)
    })
    .await
}

/// Connect side of the handshake: send our id, then read the remote id. Unframed.
pub async fn handshake_connect(
    stream: &mut TcpStream,
    local: &PeerId,
    limit: Duration,
) -> Result<PeerId, ChannelError> {
    with_deadline(limit, "handshake", async {
        write_raw_id(stream, local).await?;
        read_raw_id(stream).await
    })
    .await
}

/// One socket conversation with a peer after a completed handshake.
pub struct Channel {
    stream: TcpStream,
    remote: PeerIdentity,
    role: Role,
    io_timeout: Duration,
    recorder: ActivityRecorder,
}

impl Channel {
    pub fn new(
        stream: TcpStream,
        remote: PeerIdentity,
        role: Role,
        io_timeout: Duration,
        recorder: ActivityRecorder,
    ) -> Self {
        Self {
            stream,
            remote,
            role,
            io_timeout,
            recorder,
        }
    }

    pub fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    async fn send(&mut self, body: &[u8], severity: Severity) -> Result<(), ChannelError> {
        with_deadline(self.io_timeout, "send", write_frame(&mut self.stream, body)).await?;
        tracing::debug!(remote = %self.remote.address(), bytes = body.len(), "frame sent");
        self.recorder.record(
            severity,
            format!("sent {} bytes to {}", body.len(), self.remote.address()),
        );
        Ok(())
    }

    async fn receive(&mut self, severity: Severity) -> Result<Vec<u8>, ChannelError> {
        let body = with_deadline(self.io_timeout, "receive", read_frame(&mut self.stream)).await?;
        tracing::debug!(remote = %self.remote.address(), bytes = body.len(), "frame received");
        self.recorder.record(
            severity,
            format!("received {} bytes from {}", body.len(), self.remote.address()),
        );
        Ok(body)
    }

    /// Shut the socket down without exchanging anything further.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(remote = %self.remote.address(), error = %e, "shutdown after exchange");
        }
    }

    /// Initiator exchange: send `request` as JSON, wait for exactly one reply, decode it. The
    /// socket is closed afterwards whatever the outcome.
    pub async fn send_data<Req, Resp>(
        mut self,
        request: &Req,
        severity: Severity,
    ) -> Result<Resp, ChannelError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let result = async {
            let body = serde_json::to_vec(request)?;
            self.send(&body, severity).await?;
            let reply = self.receive(severity).await?;
            Ok::<_, ChannelError>(serde_json::from_slice(&reply)?)
        }
        .await;
        self.close().await;
        result
    }

    /// Responder exchange: wait for one claim set, evaluate it against `payloads`, answer with the
    /// verdict. Unparseable requests are answered with a corrupted-data verdict.
    pub async fn respond(
        mut self,
        payloads: &Mutex<PayloadCache>,
    ) -> Result<VerificationVerdict, ChannelError> {
        let result = async {
            let request = self.receive(Severity::ParseClaim).await?;
            let verdict = {
                let cache = payloads.lock().await;
                evaluate_claim_set(&request, &cache)
            };
            let body = serde_json::to_vec(&verdict)?;
            self.send(&body, Severity::VerifyClaim).await?;
            Ok::<_, ChannelError>(verdict)
        }
        .await;
        self.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use veripeer_core::{build_claim_set, payload_id, MemoryStore, Retention};

    fn recorder(id: &str) -> ActivityRecorder {
        ActivityRecorder::new(
            PeerIdentity::new(PeerId::from(id), "127.0.0.1", 0),
            Arc::new(MemoryStore::new()),
            Retention::default(),
        )
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"a longer message than the pipe").await.unwrap();
        });
        let got = read_frame(&mut b).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, b"a longer message than the pipe");
    }

    #[tokio::test]
    async fn read_frame_reports_close() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn handshake_exchanges_ids() {
        let (mut client, mut server) = pair().await;
        let a = PeerId::from("node_a");
        let b = PeerId::from("node_b");
        let (seen_by_server, seen_by_client) = tokio::join!(
            handshake_accept(&mut server, &a, T),
            handshake_connect(&mut client, &b, T)
        );
        assert_eq!(seen_by_server.unwrap(), b);
        assert_eq!(seen_by_client.unwrap(), a);
    }

    #[tokio::test]
    async fn handshake_times_out_on_silent_peer() {
        let (_client, mut server) = pair().await;
        let r = handshake_accept(&mut server, &PeerId::from("a"), Duration::from_millis(100)).await;
        assert!(matches!(r, Err(ChannelError::Timeout("handshake"))));
    }

    #[tokio::test]
    async fn handshake_fails_on_close() {
        let (client, mut server) = pair().await;
        drop(client);
        let r = handshake_accept(&mut server, &PeerId::from("a"), T).await;
        assert!(matches!(r, Err(ChannelError::HandshakeClosed)));
    }

    #[tokio::test]
    async fn request_response_cycle() {
        let (client, server) = pair().await;
        let id = payload_id("hello world!");
        let mut cache = PayloadCache::new();
        cache.insert(id.clone(), "hello world!".to_string());
        let cache = Mutex::new(cache);

        let server_rec = recorder("server");
        let client_rec = recorder("client");
        let responder = Channel::new(
            server,
            PeerIdentity::new(PeerId::from("client"), "127.0.0.1", 1),
            Role::Responder,
            T,
            server_rec.clone(),
        );
        let initiator = Channel::new(
            client,
            PeerIdentity::new(PeerId::from("server"), "127.0.0.1", 2),
            Role::Initiator,
            T,
            client_rec.clone(),
        );
        assert_eq!(initiator.role(), Role::Initiator);

        let claims = build_claim_set(&id, "hello world!", None).unwrap();
        let (served, verdict) = tokio::join!(
            responder.respond(&cache),
            initiator.send_data::<_, VerificationVerdict>(&claims, Severity::VerifyClaim)
        );
        let verdict = verdict.unwrap();
        assert_eq!(served.unwrap(), verdict);
        assert_eq!(verdict.matches(), vec![true, true, true]);

        let m = server_rec.metrics(None, false).unwrap();
        assert_eq!(m["PARSE_CLAIM"], 1);
        assert_eq!(m["VERIFY_CLAIM"], 1);
        let m = client_rec.metrics(Some(&[Severity::VerifyClaim]), false).unwrap();
        assert_eq!(m["VERIFY_CLAIM"], 2);
    }

    #[tokio::test]
    async fn responder_answers_garbage_with_corrupted() {
        let (mut client, server) = pair().await;
        let cache = Mutex::new(PayloadCache::new());
        let responder = Channel::new(
            server,
            PeerIdentity::new(PeerId::from("c"), "127.0.0.1", 1),
            Role::Responder,
            T,
            recorder("s"),
        );
        let serve = tokio::spawn(async move { responder.respond(&cache).await });
        write_frame(&mut client, b"not a claim set").await.unwrap();
        let reply = read_frame(&mut client).await.unwrap();
        let v: VerificationVerdict = serde_json::from_slice(&reply).unwrap();
        assert!(v.is_corrupted());
        assert!(serve.await.unwrap().unwrap().is_corrupted());
        // Responder closed its side after the single exchange.
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn initiator_times_out_without_reply() {
        let (client, _server) = pair().await;
        let initiator = Channel::new(
            client,
            PeerIdentity::new(PeerId::from("s"), "127.0.0.1", 1),
            Role::Initiator,
            Duration::from_millis(100),
            recorder("c"),
        );
        let r = initiator
            .send_data::<_, VerificationVerdict>(&serde_json::json!({}), Severity::VerifyClaim)
            .await;
        assert!(matches!(r, Err(ChannelError::Timeout("receive"))));
    }
}
