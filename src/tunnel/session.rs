//! One WebSocket conversation with the cloud.
//!
//! A session is a one-shot object:
//!
//! ```text
//!   Dialing → Handshaking → Running → Draining → Closed
//!                       ↘ Closed (on failure)
//! ```
//!
//! - **Dialing** — open the socket against `<host>/agent` with the secret in
//!   an `Authorization: Bearer` header.
//! - **Handshaking** — send `Hello` (fingerprint, version, capabilities,
//!   optional keepalive delegate id), await `Welcome` within 10 s.
//! - **Running** — the reader loop routes inbound frames (Request → the
//!   dispatcher, Ping → Pong, Pong → liveness, Bye → drain) while a spawned
//!   writer task single-handedly owns the socket send side, consuming the
//!   bounded outbound queue and emitting heartbeat Pings after 20 s of
//!   outbound silence. 45 s of inbound silence kills the session.
//! - **Draining** — stop accepting requests (late arrivals get 503), give
//!   outstanding responses up to 5 s to flush.
//! - **Closed** — abort all dispatch workers, close the socket, report the
//!   cause to the supervisor.
//!
//! A session never retries; reconnecting is the supervisor's job.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::fmt;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::codec::{ByeFrame, CodecError, HelloFrame, TunnelFrame};
use super::dispatch::Dispatcher;
use super::{
    DIAL_TIMEOUT, DRAIN_TIMEOUT, HANDSHAKE_TIMEOUT, INBOUND_DEAD_AFTER, OUTBOUND_QUEUE_DEPTH,
    PING_AFTER_IDLE,
};
use crate::activity::ActivityClock;
use crate::config::AgentConfig;
use crate::keepalive::KeepaliveGate;
use crate::routes::LocalSurface;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Why a session ended. Everything except `HandshakeRejected` is transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The cloud rejected the handshake (bad secret, org mismatch,
    /// keepalive self-link). Fatal misconfiguration.
    HandshakeRejected(String),
    /// The cloud said goodbye gracefully; carries its reason code.
    ByeReceived(String),
    /// Socket-level failure: dial error, reset, EOF.
    Transport(String),
    /// The peer violated the frame protocol.
    Protocol(String),
    /// No `Welcome` within the handshake window.
    HandshakeTimeout,
    /// Nothing inbound for 45 s.
    InboundTimeout,
    /// The supervisor was toggled to Disabled.
    Disabled,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeRejected(reason) => write!(f, "handshake rejected: {reason}"),
            Self::ByeReceived(reason) => write!(f, "cloud sent bye ({reason})"),
            Self::Transport(err) => write!(f, "transport lost: {err}"),
            Self::Protocol(err) => write!(f, "protocol fault: {err}"),
            Self::HandshakeTimeout => write!(f, "no welcome within handshake window"),
            Self::InboundTimeout => write!(f, "no inbound traffic within liveness window"),
            Self::Disabled => write!(f, "disabled by supervisor"),
        }
    }
}

/// One tunnel session. Construct, `run()`, discard.
pub struct Session {
    config: Arc<AgentConfig>,
    surface: LocalSurface,
    clock: Arc<ActivityClock>,
    gate: Arc<KeepaliveGate>,
    capabilities: BTreeSet<String>,
    connected: Arc<AtomicBool>,
    tls: Arc<rustls::ClientConfig>,
}

impl Session {
    pub fn new(
        config: Arc<AgentConfig>,
        surface: LocalSurface,
        clock: Arc<ActivityClock>,
        gate: Arc<KeepaliveGate>,
        capabilities: BTreeSet<String>,
        connected: Arc<AtomicBool>,
        tls: Arc<rustls::ClientConfig>,
    ) -> Self {
        Self {
            config,
            surface,
            clock,
            gate,
            capabilities,
            connected,
            tls,
        }
    }

    /// Drive the session until it closes. Flipping `enabled` to `false`
    /// performs a graceful shutdown.
    pub async fn run(self, mut enabled: watch::Receiver<bool>) -> SessionEnd {
        let url = self.config.tunnel_url();
        info!(%url, "tunnel: dialing");

        let ws = match self.dial(&url).await {
            Ok(ws) => ws,
            Err(end) => return end,
        };
        let (mut sink, mut stream) = ws.split();

        match self.handshake(&mut sink, &mut stream).await {
            Ok(session_id) => {
                info!(session_id = %session_id, "tunnel: established");
            }
            Err(end) => return end,
        }
        self.connected.store(true, Ordering::Relaxed);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let dispatcher = Dispatcher::new(
            self.surface.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.gate),
            outbound_tx.clone(),
        );
        let writer = tokio::spawn(writer_task(sink, outbound_rx));

        let max_body = self.config.max_frame_body;
        let mut last_inbound = Instant::now();
        let mut drain = false;

        let end = loop {
            tokio::select! {
                changed = enabled.changed() => {
                    if changed.is_err() || !*enabled.borrow() {
                        info!("tunnel: disable requested, closing session");
                        let _ = outbound_tx
                            .send(TunnelFrame::Bye(ByeFrame {
                                reason_code: "shutdown".to_string(),
                                message: "agent disabled".to_string(),
                            }))
                            .await;
                        drain = true;
                        break SessionEnd::Disabled;
                    }
                }
                () = tokio::time::sleep(Duration::from_secs(1)) => {
                    if last_inbound.elapsed() > INBOUND_DEAD_AFTER {
                        warn!("tunnel: inbound silence, declaring socket dead");
                        break SessionEnd::InboundTimeout;
                    }
                }
                message = stream.next() => {
                    last_inbound = Instant::now();
                    match message {
                        None => break SessionEnd::Transport("connection closed".to_string()),
                        Some(Err(e)) => break SessionEnd::Transport(e.to_string()),
                        Some(Ok(Message::Binary(data))) => {
                            match TunnelFrame::decode(&data, max_body) {
                                Ok(frame) => match self
                                    .route(frame, &dispatcher, &outbound_tx)
                                    .await
                                {
                                    RouteOutcome::Continue => {}
                                    RouteOutcome::Drain(end) => {
                                        drain = true;
                                        break end;
                                    }
                                    RouteOutcome::Fail(end) => break end,
                                },
                                Err(e) => {
                                    break self.protocol_fault(&outbound_tx, &e).await;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            break SessionEnd::Transport("closed by peer".to_string());
                        }
                        // WebSocket-level pings/pongs count as liveness but
                        // are otherwise the library's business.
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(_)) => {
                            let err = CodecError::BadHeader("non-binary message".to_string());
                            break self.protocol_fault(&outbound_tx, &err).await;
                        }
                    }
                }
            }
        };

        self.connected.store(false, Ordering::Relaxed);

        if drain {
            dispatcher.begin_drain();
            if timeout(DRAIN_TIMEOUT, dispatcher.join_all()).await.is_err() {
                warn!("tunnel: drain window expired with workers still running");
            }
        }
        dispatcher.shutdown().await;
        // Closing the channel lets the writer flush whatever is queued and
        // shut the socket.
        drop(outbound_tx);
        drop(dispatcher);
        if timeout(Duration::from_secs(2), writer).await.is_err() {
            warn!("tunnel: writer did not flush in time");
        }

        end
    }

    async fn dial(&self, url: &str) -> Result<WsStream, SessionEnd> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SessionEnd::Transport(format!("invalid tunnel url: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.secret))
            .map_err(|e| SessionEnd::Transport(format!("secret is not header-safe: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let connector = Connector::Rustls(Arc::clone(&self.tls));
        match timeout(
            DIAL_TIMEOUT,
            connect_async_tls_with_config(request, None, false, Some(connector)),
        )
        .await
        {
            Err(_) => Err(SessionEnd::Transport("dial timed out".to_string())),
            Ok(Err(e)) => Err(SessionEnd::Transport(e.to_string())),
            Ok(Ok((ws, _response))) => Ok(ws),
        }
    }

    /// Send `Hello`, await `Welcome`. Returns the cloud's session id.
    async fn handshake(
        &self,
        sink: &mut WsSink,
        stream: &mut WsSource,
    ) -> Result<String, SessionEnd> {
        let hello = TunnelFrame::Hello(HelloFrame {
            fingerprint: self.config.identity.fingerprint.clone(),
            version: self.config.identity.version.clone(),
            capabilities: self.capabilities.clone(),
            keepalive_for: self.config.keepalive_for.clone(),
        });
        sink.send(Message::Binary(hello.encode().into()))
            .await
            .map_err(|e| SessionEnd::Transport(e.to_string()))?;

        let frame = match timeout(HANDSHAKE_TIMEOUT, next_binary_frame(stream, self.config.max_frame_body)).await {
            Err(_) => return Err(SessionEnd::HandshakeTimeout),
            Ok(result) => result?,
        };

        match frame {
            TunnelFrame::Welcome(welcome) => {
                if let Some(rejection) = welcome.rejection {
                    return Err(SessionEnd::HandshakeRejected(rejection));
                }
                debug!(server_time = welcome.server_time, "welcome received");
                Ok(welcome.session_id)
            }
            other => Err(SessionEnd::Protocol(format!(
                "expected welcome, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Route one decoded frame while Running.
    async fn route(
        &self,
        frame: TunnelFrame,
        dispatcher: &Dispatcher,
        outbound: &mpsc::Sender<TunnelFrame>,
    ) -> RouteOutcome {
        match frame {
            TunnelFrame::Request(request) => {
                dispatcher.dispatch(request).await;
                RouteOutcome::Continue
            }
            TunnelFrame::Ping { nonce } => {
                if outbound.send(TunnelFrame::Pong { nonce }).await.is_err() {
                    return RouteOutcome::Fail(SessionEnd::Transport(
                        "writer gone".to_string(),
                    ));
                }
                RouteOutcome::Continue
            }
            // Inbound liveness was already refreshed; nonce mismatches are
            // not worth killing a session over.
            TunnelFrame::Pong { .. } => RouteOutcome::Continue,
            TunnelFrame::Bye(bye) => {
                info!(reason = %bye.reason_code, message = %bye.message, "tunnel: cloud says bye");
                RouteOutcome::Drain(SessionEnd::ByeReceived(bye.reason_code))
            }
            other => {
                let _ = outbound
                    .send(TunnelFrame::Bye(ByeFrame {
                        reason_code: "protocol_error".to_string(),
                        message: format!("unexpected {} frame", other.kind_name()),
                    }))
                    .await;
                RouteOutcome::Fail(SessionEnd::Protocol(format!(
                    "unexpected {} frame",
                    other.kind_name()
                )))
            }
        }
    }

    /// Decode failure: tell the peer, then close.
    async fn protocol_fault(
        &self,
        outbound: &mpsc::Sender<TunnelFrame>,
        error: &CodecError,
    ) -> SessionEnd {
        warn!("tunnel: protocol fault: {error}");
        let _ = outbound
            .send(TunnelFrame::Bye(ByeFrame {
                reason_code: "protocol_error".to_string(),
                message: error.to_string(),
            }))
            .await;
        SessionEnd::Protocol(error.to_string())
    }
}

enum RouteOutcome {
    Continue,
    Drain(SessionEnd),
    Fail(SessionEnd),
}

/// Single owner of the socket send side.
///
/// Consumes the bounded outbound queue; every frame on the wire goes through
/// here, in acceptance order. Emits a heartbeat Ping when nothing has been
/// sent for [`PING_AFTER_IDLE`]. Exits when the queue closes (after flushing
/// what remains) or on a send failure, then closes the socket.
async fn writer_task(mut sink: WsSink, mut queue: mpsc::Receiver<TunnelFrame>) {
    let mut last_sent = Instant::now();
    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                debug!(kind = frame.kind_name(), "outbound frame");
                if sink.send(Message::Binary(frame.encode().into())).await.is_err() {
                    break;
                }
                last_sent = Instant::now();
            }
            () = tokio::time::sleep_until(last_sent + PING_AFTER_IDLE) => {
                let nonce = rand::thread_rng().gen::<i64>();
                if sink
                    .send(Message::Binary(TunnelFrame::Ping { nonce }.encode().into()))
                    .await
                    .is_err()
                {
                    break;
                }
                last_sent = Instant::now();
            }
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Read until a binary frame arrives, decoding it; used during handshaking.
async fn next_binary_frame(
    stream: &mut WsSource,
    max_body: usize,
) -> Result<TunnelFrame, SessionEnd> {
    loop {
        match stream.next().await {
            None => return Err(SessionEnd::Transport("connection closed".to_string())),
            Some(Err(e)) => return Err(SessionEnd::Transport(e.to_string())),
            Some(Ok(Message::Binary(data))) => {
                return TunnelFrame::decode(&data, max_body)
                    .map_err(|e| SessionEnd::Protocol(e.to_string()));
            }
            Some(Ok(Message::Close(_))) => {
                return Err(SessionEnd::Transport("closed by peer".to_string()));
            }
            Some(Ok(_)) => {}
        }
    }
}
