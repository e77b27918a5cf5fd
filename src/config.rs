//! Configuration and persisted identity.
//!
//! Runtime configuration is assembled once at startup from CLI flags and
//! environment variables, then shared immutably (`Arc<AgentConfig>`) — no
//! component mutates configuration after the process is up.
//!
//! The only persisted state is the identity file at
//! `<config-dir>/.cyberdriver/config.json`:
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "fingerprint": "7c9e6679-7425-40de-944b-e07fc1f90ae7"
//! }
//! ```
//!
//! The fingerprint is a UUID v4 minted on first run and kept stable across
//! restarts and version upgrades; the cloud uses it to recognize this machine.
//!
//! Environment overrides (these win over the matching CLI flags):
//!
//! - `CYBERDRIVER_USE_SYSTEM_CERTS` — `1`/`true` selects the OS trust store
//! - `CYBERDRIVER_CA_FILE` — path to a PEM bundle to trust instead
//! - `CYBERDRIVER_SSL_VERIFY` — `0`/`false` disables certificate verification

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Crate version, embedded in the identity file and the `Hello` frame.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const CONFIG_DIR_NAME: &str = ".cyberdriver";
const CONFIG_FILE: &str = "config.json";

const ENV_USE_SYSTEM_CERTS: &str = "CYBERDRIVER_USE_SYSTEM_CERTS";
const ENV_CA_FILE: &str = "CYBERDRIVER_CA_FILE";
const ENV_SSL_VERIFY: &str = "CYBERDRIVER_SSL_VERIFY";

/// Minimum keepalive idle threshold; shorter values would fight real traffic.
const KEEPALIVE_THRESHOLD_FLOOR: Duration = Duration::from_secs(10);

/// How the tunnel client decides which server certificates to trust.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Bundled webpki roots (works on hosts with broken OS stores).
    #[default]
    Default,
    /// The operating system's certificate store.
    SystemStore,
    /// A custom PEM bundle.
    CaFile(PathBuf),
    /// No verification at all. Only for debugging broken middleboxes.
    NoVerify,
}

/// Environment-variable overrides for [`TrustPolicy`].
#[derive(Debug, Clone, Default)]
pub struct TlsEnvOverrides {
    pub use_system_certs: Option<bool>,
    pub ca_file: Option<PathBuf>,
    pub ssl_verify: Option<bool>,
}

impl TlsEnvOverrides {
    /// Read the `CYBERDRIVER_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self {
            use_system_certs: std::env::var(ENV_USE_SYSTEM_CERTS).ok().map(|v| truthy(&v)),
            ca_file: std::env::var(ENV_CA_FILE).ok().map(PathBuf::from),
            ssl_verify: std::env::var(ENV_SSL_VERIFY).ok().map(|v| truthy(&v)),
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl TrustPolicy {
    /// Resolve the effective policy: environment overrides beat CLI flags,
    /// and disabling verification beats everything.
    pub fn resolve(cli: TrustPolicy, env: &TlsEnvOverrides) -> TrustPolicy {
        if env.ssl_verify == Some(false) {
            return TrustPolicy::NoVerify;
        }
        if let Some(path) = &env.ca_file {
            return TrustPolicy::CaFile(path.clone());
        }
        if env.use_system_certs == Some(true) {
            return TrustPolicy::SystemStore;
        }
        cli
    }
}

/// Keepalive worker settings (see the `keepalive` module).
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    /// Idle time before a synthetic action fires. Floored at 10 s.
    pub threshold: Duration,
    /// Optional click target. `None` = bottom-left of the primary screen,
    /// inset 10 px from each edge. Never clamped to the screen — virtual
    /// displays misbehave on edge clicks and operators pick coordinates to
    /// work around that.
    pub click_x: Option<i32>,
    pub click_y: Option<i32>,
}

impl KeepaliveConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            threshold: Duration::from_secs(180),
            click_x: None,
            click_y: None,
        }
    }

    /// Build from CLI flags; `threshold_minutes` is floored at 10 s.
    pub fn from_flags(
        enabled: bool,
        threshold_minutes: f64,
        click_x: Option<i32>,
        click_y: Option<i32>,
    ) -> Self {
        let threshold = Duration::from_secs_f64((threshold_minutes * 60.0).max(0.0))
            .max(KEEPALIVE_THRESHOLD_FLOOR);
        Self { enabled, threshold, click_x, click_y }
    }
}

/// Process-wide configuration, immutable after start.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// API secret presented to the cloud on connect.
    pub secret: String,
    /// Normalized cloud base URL, always `wss://…` without a trailing slash.
    pub host: String,
    /// Local HTTP port; the surface binds `127.0.0.1:<port>`.
    pub port: u16,
    pub identity: Identity,
    pub trust: TrustPolicy,
    pub keepalive: KeepaliveConfig,
    /// Machine-id this agent acts as a keepalive delegate for.
    pub keepalive_for: Option<String>,
    /// Cap on a single tunnel frame body.
    pub max_frame_body: usize,
}

impl AgentConfig {
    /// Full WebSocket URL for the tunnel endpoint.
    pub fn tunnel_url(&self) -> String {
        format!("{}/agent", self.host)
    }
}

/// Normalize a user-supplied host into a `wss://` base URL.
///
/// Accepts bare hosts (`api.example.com`), `http(s)://` and `ws(s)://` forms;
/// trailing slashes are trimmed.
pub fn normalize_host(raw: &str) -> String {
    let mut host = raw.trim();
    for prefix in ["https://", "http://", "wss://", "ws://"] {
        if let Some(stripped) = host.strip_prefix(prefix) {
            host = stripped;
            break;
        }
    }
    format!("wss://{}", host.trim_end_matches('/'))
}

/// Persisted agent identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub version: String,
    pub fingerprint: String,
}

impl Identity {
    /// Load the identity from the platform config directory, creating it on
    /// first run.
    pub fn load_or_create() -> Result<Self, ConfigError> {
        let base = dirs::config_local_dir()
            .or_else(dirs::config_dir)
            .ok_or(ConfigError::NoConfigDir)?;
        Self::load_or_create_in(&base.join(CONFIG_DIR_NAME))
    }

    /// Load or create the identity file inside `dir`.
    ///
    /// A version mismatch rewrites the file with the current [`VERSION`] but
    /// preserves the fingerprint; a corrupt file is replaced wholesale.
    pub fn load_or_create_in(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);

        let existing_fingerprint = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Identity>(&raw) {
                Ok(identity) if identity.version == VERSION => return Ok(identity),
                Ok(identity) => {
                    warn!("identity file is from {}, rewriting", identity.version);
                    Some(identity.fingerprint)
                }
                Err(e) => {
                    warn!("identity file is corrupt ({e}), recreating");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ConfigError::Io(path, e)),
        };

        let identity = Identity {
            version: VERSION.to_string(),
            fingerprint: existing_fingerprint
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        };

        std::fs::create_dir_all(dir).map_err(|e| ConfigError::Io(dir.to_path_buf(), e))?;
        let body = serde_json::to_string_pretty(&identity)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(&path, body).map_err(|e| ConfigError::Io(path, e))?;
        Ok(identity)
    }
}

/// Startup configuration failures. All of them are fatal (exit code 2).
#[derive(Debug)]
pub enum ConfigError {
    NoConfigDir,
    Io(PathBuf, std::io::Error),
    Serialize(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConfigDir => write!(f, "could not determine a config directory"),
            Self::Io(path, e) => write!(f, "{}: {e}", path.display()),
            Self::Serialize(e) => write!(f, "failed to serialize identity: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
