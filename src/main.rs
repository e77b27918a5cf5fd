#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # cyberdriver
//!
//! Host-resident desktop control agent. Exposes screen capture, keyboard,
//! and mouse over a local HTTP API, and bridges that API to a cloud
//! controller over a persistent WebSocket tunnel so remote clients can drive
//! this machine without inbound network reachability.
//!
//! ## Subcommands
//!
//! - `cyberdriver start --port <N>` — run the local HTTP surface only
//! - `cyberdriver join --secret <KEY> [--host <URL>]` — run the surface and
//!   keep a tunnel session connected, reconnecting with backoff
//!
//! ## Exit codes
//!
//! | Code | Meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | clean exit (interactive `quit`)           |
//! | 2    | invalid configuration                     |
//! | 3    | cloud rejected the handshake (fatal)      |
//! | 130  | interrupted (SIGINT)                      |
//!
//! ## Architecture
//!
//! ```text
//! main.rs               — CLI, wiring, interactive toggle, shutdown
//! state.rs              — shared AppState
//! config.rs             — runtime config + persisted fingerprint
//! tls.rs                — trust policy for the tunnel connection
//! activity.rs           — last-remote-activity clock
//! keepalive.rs          — idle-driven synthetic activity + gate
//! device/               — capture/input capability seams, headless backend
//! routes/               — the local HTTP surface
//! tunnel/               — codec, dispatcher, session runtime, supervisor
//! ```
//!
//! The concrete capture/input backend compiled here is the headless
//! simulator; platform backends plug in behind the `device` traits without
//! touching the core.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use cyberdriver::config::{
    normalize_host, AgentConfig, Identity, KeepaliveConfig, TlsEnvOverrides, TrustPolicy,
};
use cyberdriver::device::headless::HeadlessDesktop;
use cyberdriver::device::{Capabilities, Desktop};
use cyberdriver::keepalive::{KeepaliveGate, KeepaliveWorker};
use cyberdriver::routes::LocalSurface;
use cyberdriver::state::AppState;
use cyberdriver::tunnel::codec::MAX_FRAME_BODY;
use cyberdriver::tunnel::supervisor::{Supervisor, SupervisorExit};
use cyberdriver::{tls, KeepaliveState};

/// Host-resident desktop control agent with a cloud tunnel bridge.
#[derive(Parser)]
#[command(name = "cyberdriver", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local HTTP surface only.
    Start {
        /// Local port to bind on 127.0.0.1.
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
    /// Run the surface and keep a tunnel session to the cloud.
    Join {
        /// API secret from the dashboard.
        #[arg(long)]
        secret: String,
        /// Control server URL or hostname.
        #[arg(long, default_value = "api.cyberdesk.io")]
        host: String,
        /// Local port to bind on 127.0.0.1.
        #[arg(long, default_value_t = 3000)]
        port: u16,
        /// Simulate user activity when the tunnel has been idle.
        #[arg(long)]
        keepalive: bool,
        /// Idle minutes before a keepalive action fires.
        #[arg(long, default_value_t = 3.0)]
        keepalive_threshold_minutes: f64,
        /// X coordinate for the keepalive click (default: bottom-left).
        #[arg(long)]
        keepalive_click_x: Option<i32>,
        /// Y coordinate for the keepalive click (default: bottom-left).
        #[arg(long)]
        keepalive_click_y: Option<i32>,
        /// Announce this agent as the keepalive delegate for a machine id.
        #[arg(long, value_name = "MACHINE_ID")]
        register_as_keepalive_for: Option<String>,
        /// Interactive prompt to disable/re-enable the tunnel without exiting.
        #[arg(long)]
        interactive: bool,
        /// Trust the operating system certificate store.
        #[arg(long, conflicts_with_all = ["ca_file", "no_ssl_verify"])]
        use_system_certs: bool,
        /// Trust a custom PEM bundle instead.
        #[arg(long, value_name = "PATH", conflicts_with = "no_ssl_verify")]
        ca_file: Option<PathBuf>,
        /// Disable TLS certificate verification (debugging only).
        #[arg(long)]
        no_ssl_verify: bool,
    },
}

const EXIT_BAD_CONFIG: i32 = 2;
const EXIT_HANDSHAKE_REJECTED: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match cli.command {
        Commands::Start { port } => run_start(port).await,
        Commands::Join {
            secret,
            host,
            port,
            keepalive,
            keepalive_threshold_minutes,
            keepalive_click_x,
            keepalive_click_y,
            register_as_keepalive_for,
            interactive,
            use_system_certs,
            ca_file,
            no_ssl_verify,
        } => {
            let cli_trust = if no_ssl_verify {
                TrustPolicy::NoVerify
            } else if let Some(path) = ca_file {
                TrustPolicy::CaFile(path)
            } else if use_system_certs {
                TrustPolicy::SystemStore
            } else {
                TrustPolicy::Default
            };
            let trust = TrustPolicy::resolve(cli_trust, &TlsEnvOverrides::from_env());
            let keepalive_config = KeepaliveConfig::from_flags(
                keepalive,
                keepalive_threshold_minutes,
                keepalive_click_x,
                keepalive_click_y,
            );
            run_join(JoinArgs {
                secret,
                host,
                port,
                trust,
                keepalive: keepalive_config,
                keepalive_for: register_as_keepalive_for,
                interactive,
            })
            .await;
        }
    }
}

fn load_identity() -> Identity {
    match Identity::load_or_create() {
        Ok(identity) => identity,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    }
}

fn build_state(config: AgentConfig) -> AppState {
    let backend = Arc::new(HeadlessDesktop::default());
    let desktop = Arc::new(Desktop::new(backend.clone(), backend));
    AppState::new(Arc::new(config), desktop, Capabilities::default())
}

async fn bind_local(port: u16) -> TcpListener {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind 127.0.0.1:{port}: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    }
}

/// `start` — local HTTP surface only, no tunnel, no keepalive.
async fn run_start(port: u16) {
    let identity = load_identity();
    info!("cyberdriver v{} (fingerprint {})", identity.version, identity.fingerprint);

    let config = AgentConfig {
        secret: String::new(),
        host: normalize_host("api.cyberdesk.io"),
        port,
        identity,
        trust: TrustPolicy::Default,
        keepalive: KeepaliveConfig::disabled(),
        keepalive_for: None,
        max_frame_body: MAX_FRAME_BODY,
    };
    let state = build_state(config);
    let surface = LocalSurface::new(state);

    let listener = bind_local(port).await;
    info!("serving on http://127.0.0.1:{port}");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupted");
    };
    if let Err(e) = axum::serve(listener, surface.router())
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("server error: {e}");
    }
    std::process::exit(EXIT_INTERRUPTED);
}

struct JoinArgs {
    secret: String,
    host: String,
    port: u16,
    trust: TrustPolicy,
    keepalive: KeepaliveConfig,
    keepalive_for: Option<String>,
    interactive: bool,
}

/// `join` — local surface + keepalive worker + supervised tunnel.
async fn run_join(args: JoinArgs) {
    let identity = load_identity();
    info!("cyberdriver v{} (fingerprint {})", identity.version, identity.fingerprint);

    let tls = match tls::client_config(&args.trust) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("invalid TLS configuration: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let config = AgentConfig {
        secret: args.secret,
        host: normalize_host(&args.host),
        port: args.port,
        identity,
        trust: args.trust,
        keepalive: args.keepalive.clone(),
        keepalive_for: args.keepalive_for,
        max_frame_body: MAX_FRAME_BODY,
    };
    let state = build_state(config);
    let surface = LocalSurface::new(state.clone());

    // Local surface: keeps serving regardless of tunnel state.
    let listener = bind_local(args.port).await;
    info!("serving on http://127.0.0.1:{}", args.port);
    let server = tokio::spawn({
        let router = surface.router();
        async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("server error: {e}");
            }
        }
    });

    // Keepalive worker: shares the gate with the dispatcher.
    let gate = Arc::new(KeepaliveGate::new());
    let worker = KeepaliveWorker::new(
        Arc::clone(&state.keepalive),
        Arc::clone(&gate),
        Arc::clone(&state.clock),
        Arc::clone(&state.desktop),
        args.keepalive,
    );
    let keepalive_task = tokio::spawn(worker.run());

    // Supervisor: owns the reconnect loop; the watch channel is the
    // enable/disable toggle.
    let (enabled_tx, enabled_rx) = watch::channel(true);
    let supervisor = Supervisor::new(&state, surface, gate, tls, enabled_rx);
    let mut supervisor_task = tokio::spawn(supervisor.run());

    if args.interactive {
        tokio::spawn(interactive_loop(enabled_tx, Arc::clone(&state.keepalive)));
    }

    let exit_code = tokio::select! {
        result = &mut supervisor_task => match result {
            Ok(SupervisorExit::HandshakeRejected(reason)) => {
                error!("fatal: {reason}");
                EXIT_HANDSHAKE_REJECTED
            }
            Err(e) => {
                error!("supervisor task failed: {e}");
                EXIT_HANDSHAKE_REJECTED
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            EXIT_INTERRUPTED
        }
    };

    supervisor_task.abort();
    keepalive_task.abort();
    server.abort();
    std::process::exit(exit_code);
}

/// Interactive stdin loop: `disable`, `enable`, `status`, `quit`.
async fn interactive_loop(enabled: watch::Sender<bool>, keepalive: Arc<KeepaliveState>) {
    println!("interactive: commands are disable | enable | status | quit");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim().to_ascii_lowercase().as_str() {
            "disable" | "d" => {
                let _ = enabled.send(false);
                println!("tunnel disabled (local surface still serving)");
            }
            "enable" | "e" => {
                let _ = enabled.send(true);
                println!("tunnel enabled");
            }
            "status" | "s" => {
                println!(
                    "tunnel {}, keepalive {}",
                    if *enabled.borrow() { "enabled" } else { "disabled" },
                    if keepalive.is_enabled() { "on" } else { "off" },
                );
            }
            "quit" | "exit" | "q" => {
                println!("bye");
                std::process::exit(0);
            }
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }
    // Stdin closed. Park instead of returning: dropping the toggle sender
    // would read as a disable to the supervisor.
    std::future::pending::<()>().await
}
