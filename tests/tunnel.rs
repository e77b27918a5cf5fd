//! End-to-end tunnel scenarios against an in-process fake cloud.
//!
//! Each test binds a local listener, lets a real [`Session`] dial it over
//! plain `ws://`, and plays the cloud side of the frame protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use cyberdriver::config::{AgentConfig, Identity, KeepaliveConfig, TrustPolicy};
use cyberdriver::device::headless::HeadlessDesktop;
use cyberdriver::device::{Capabilities, Desktop};
use cyberdriver::keepalive::KeepaliveGate;
use cyberdriver::routes::LocalSurface;
use cyberdriver::state::AppState;
use cyberdriver::tls;
use cyberdriver::tunnel::codec::{
    ByeFrame, RequestFrame, TunnelFrame, WelcomeFrame, MAX_FRAME_BODY,
};
use cyberdriver::tunnel::session::{Session, SessionEnd};

const FINGERPRINT: &str = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee";

fn agent_config(port: u16) -> AgentConfig {
    AgentConfig {
        secret: "test-secret".to_string(),
        host: format!("ws://127.0.0.1:{port}"),
        port: 0,
        identity: Identity {
            version: "0.1.0".to_string(),
            fingerprint: FINGERPRINT.to_string(),
        },
        trust: TrustPolicy::Default,
        keepalive: KeepaliveConfig::disabled(),
        keepalive_for: Some("main-machine-17".to_string()),
        max_frame_body: MAX_FRAME_BODY,
    }
}

fn spawn_session(
    port: u16,
) -> (JoinHandle<SessionEnd>, watch::Sender<bool>, Arc<AtomicBool>) {
    let config = Arc::new(agent_config(port));
    let backend = Arc::new(HeadlessDesktop::default());
    let desktop = Arc::new(Desktop::new(backend.clone(), backend));
    let state = AppState::new(Arc::clone(&config), desktop, Capabilities::default());
    let connected = Arc::clone(&state.tunnel_connected);
    let surface = LocalSurface::new(state.clone());
    let tls_config = Arc::new(tls::client_config(&TrustPolicy::Default).expect("tls config"));

    let session = Session::new(
        config,
        surface,
        Arc::clone(&state.clock),
        Arc::new(KeepaliveGate::new()),
        Capabilities::default().advertised(),
        Arc::clone(&connected),
        tls_config,
    );
    let (toggle, enabled) = watch::channel(true);
    (tokio::spawn(session.run(enabled)), toggle, connected)
}

type ServerWs = WebSocketStream<TcpStream>;

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream).await.expect("upgrade")
}

async fn recv_frame(ws: &mut ServerWs) -> TunnelFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("read");
        match message {
            Message::Binary(data) => {
                return TunnelFrame::decode(&data, MAX_FRAME_BODY).expect("decode")
            }
            // WebSocket-level control traffic is not part of the protocol.
            _ => continue,
        }
    }
}

async fn send_frame(ws: &mut ServerWs, frame: &TunnelFrame) {
    ws.send(Message::Binary(frame.encode().into()))
        .await
        .expect("send");
}

fn welcome() -> TunnelFrame {
    TunnelFrame::Welcome(WelcomeFrame {
        session_id: "s-test".to_string(),
        server_time: 1_700_000_000_000,
        rejection: None,
    })
}

fn request(id: &str, method: &str, path: &str, body: &[u8]) -> TunnelFrame {
    TunnelFrame::Request(RequestFrame {
        id: id.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        query: HashMap::new(),
        headers: HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]),
        body: body.to_vec(),
    })
}

#[tokio::test]
async fn happy_request_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _toggle, connected) = spawn_session(port);
    let mut ws = accept(&listener).await;

    // Handshake: Hello first, carrying identity and capabilities.
    let hello = match recv_frame(&mut ws).await {
        TunnelFrame::Hello(hello) => hello,
        other => panic!("expected hello, got {}", other.kind_name()),
    };
    assert_eq!(hello.fingerprint, FINGERPRINT);
    assert!(hello.capabilities.contains("display"));
    assert!(hello.capabilities.contains("input"));
    assert_eq!(hello.keepalive_for.as_deref(), Some("main-machine-17"));

    send_frame(&mut ws, &welcome()).await;

    // One request, one response, same id, handler output intact.
    send_frame(
        &mut ws,
        &request("r1", "GET", "/computer/display/dimensions", b""),
    )
    .await;
    let response = match recv_frame(&mut ws).await {
        TunnelFrame::Response(response) => response,
        other => panic!("expected response, got {}", other.kind_name()),
    };
    assert_eq!(response.id, "r1");
    assert_eq!(response.status, 200);
    let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(parsed, serde_json::json!({"width": 1920, "height": 1080}));
    assert!(connected.load(Ordering::Relaxed));

    // Graceful goodbye drains and closes.
    send_frame(
        &mut ws,
        &TunnelFrame::Bye(ByeFrame {
            reason_code: "restart".to_string(),
            message: "rolling restart".to_string(),
        }),
    )
    .await;
    let end = session.await.unwrap();
    assert_eq!(end, SessionEnd::ByeReceived("restart".to_string()));
    assert!(!connected.load(Ordering::Relaxed));
}

#[tokio::test]
async fn protocol_ping_gets_an_immediate_pong() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _toggle, _connected) = spawn_session(port);
    let mut ws = accept(&listener).await;

    let _hello = recv_frame(&mut ws).await;
    send_frame(&mut ws, &welcome()).await;

    send_frame(&mut ws, &TunnelFrame::Ping { nonce: 777 }).await;
    match recv_frame(&mut ws).await {
        TunnelFrame::Pong { nonce } => assert_eq!(nonce, 777),
        other => panic!("expected pong, got {}", other.kind_name()),
    }

    drop(ws);
    let end = session.await.unwrap();
    assert!(matches!(end, SessionEnd::Transport(_)), "got {end:?}");
}

#[tokio::test]
async fn bad_frame_kind_draws_a_protocol_error_bye() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _toggle, _connected) = spawn_session(port);
    let mut ws = accept(&listener).await;

    let _hello = recv_frame(&mut ws).await;
    send_frame(&mut ws, &welcome()).await;

    // Kind byte 9 does not exist.
    ws.send(Message::Binary(b"\x09{}\n".to_vec().into()))
        .await
        .unwrap();

    match recv_frame(&mut ws).await {
        TunnelFrame::Bye(bye) => assert_eq!(bye.reason_code, "protocol_error"),
        other => panic!("expected bye, got {}", other.kind_name()),
    }
    let end = session.await.unwrap();
    assert!(matches!(end, SessionEnd::Protocol(_)), "got {end:?}");
}

#[tokio::test]
async fn mid_flight_disconnect_cancels_the_worker() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _toggle, connected) = spawn_session(port);
    let mut ws = accept(&listener).await;

    let _hello = recv_frame(&mut ws).await;
    send_frame(&mut ws, &welcome()).await;

    // A smooth mouse move takes ~100 ms; kill the socket 50 ms in.
    send_frame(
        &mut ws,
        &request(
            "slow",
            "POST",
            "/computer/input/mouse/move",
            br#"{"x":800,"y":600}"#,
        ),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(ws);

    let end = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("session ends promptly")
        .unwrap();
    assert!(matches!(end, SessionEnd::Transport(_)), "got {end:?}");
    assert!(!connected.load(Ordering::Relaxed));
}

#[tokio::test]
async fn welcome_rejection_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _toggle, _connected) = spawn_session(port);
    let mut ws = accept(&listener).await;

    let _hello = recv_frame(&mut ws).await;
    send_frame(
        &mut ws,
        &TunnelFrame::Welcome(WelcomeFrame {
            session_id: String::new(),
            server_time: 0,
            rejection: Some("org mismatch".to_string()),
        }),
    )
    .await;

    let end = session.await.unwrap();
    assert_eq!(end, SessionEnd::HandshakeRejected("org mismatch".to_string()));
}

#[tokio::test]
async fn disable_toggle_says_goodbye_gracefully() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, toggle, _connected) = spawn_session(port);
    let mut ws = accept(&listener).await;

    let _hello = recv_frame(&mut ws).await;
    send_frame(&mut ws, &welcome()).await;

    toggle.send(true).ok();
    tokio::time::sleep(Duration::from_millis(50)).await;
    toggle.send(false).ok();

    match recv_frame(&mut ws).await {
        TunnelFrame::Bye(bye) => assert_eq!(bye.reason_code, "shutdown"),
        other => panic!("expected bye, got {}", other.kind_name()),
    }
    let end = session.await.unwrap();
    assert_eq!(end, SessionEnd::Disabled);
}

#[tokio::test]
async fn secret_travels_in_the_authorization_header() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, _toggle, _connected) = spawn_session(port);

    let seen = Arc::new(Mutex::new((String::new(), String::new())));
    let seen_in_callback = Arc::clone(&seen);
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_hdr_async(
        stream,
        move |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
              response: tokio_tungstenite::tungstenite::handshake::server::Response| {
            let auth = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            *seen_in_callback.lock().unwrap() = (request.uri().path().to_string(), auth);
            Ok(response)
        },
    )
    .await
    .expect("upgrade");

    let _hello = recv_frame(&mut ws).await;
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.0, "/agent");
        assert_eq!(seen.1, "Bearer test-secret");
    }

    drop(ws);
    let _ = session.await.unwrap();
}
