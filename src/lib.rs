#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! cyberdriver library — the building blocks of the desktop-control agent.
//!
//! - `routes` — the local HTTP surface (screen, input, internal endpoints)
//! - `tunnel` — frame codec, dispatcher, session runtime, and supervisor for
//!   the cloud bridge
//! - `keepalive` — idle-driven synthetic activity and the gate it shares
//!   with the dispatcher
//! - `activity` — the last-remote-activity clock
//! - `device` — capability seams for capture/input plus the headless backend
//! - `config` — runtime configuration and the persisted fingerprint
//! - `tls` — trust policy for the tunnel connection

pub mod activity;
pub mod config;
pub mod device;
pub mod keepalive;
pub mod routes;
pub mod state;
pub mod tls;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use activity::ActivityClock;
pub use config::{AgentConfig, Identity};
pub use keepalive::{KeepaliveGate, KeepaliveState, KeepaliveWorker};
pub use routes::LocalSurface;
pub use state::AppState;
