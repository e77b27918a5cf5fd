//! Cloud bridge: one persistent WebSocket to the controller.
//!
//! The tunnel turns this agent into a remotely drivable machine without any
//! inbound network reachability:
//!
//! - [`codec`] — the frame envelope carried over the socket
//! - [`dispatch`] — converts inbound Request frames into in-process HTTP
//!   calls against the local surface and emits Response frames
//! - [`session`] — one WebSocket conversation: handshake, reader/writer,
//!   heartbeats, drain, close
//! - [`supervisor`] — owns the reconnect loop and the enable/disable toggle
//!
//! The supervisor drives sessions; a session reads frames through the codec
//! and hands requests to the dispatcher; the dispatcher calls the local
//! surface and pushes responses back through the session's outbound queue.

use std::time::Duration;

pub mod codec;
pub mod dispatch;
pub mod session;
pub mod supervisor;

/// How long a connect attempt may take before it counts as failed.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for `Welcome` after sending `Hello`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Send a Ping if nothing has gone out for this long.
pub const PING_AFTER_IDLE: Duration = Duration::from_secs(20);

/// Consider the socket dead if nothing has come in for this long.
pub const INBOUND_DEAD_AFTER: Duration = Duration::from_secs(45);

/// How long Draining waits for outstanding responses to flush.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Soft per-request deadline; expiry produces a 504 Response.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(120);

/// Depth of the bounded outbound frame queue. Overflow blocks the producer;
/// frames are never dropped.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Concurrent in-flight requests per session; excess queues FIFO.
pub const MAX_CONCURRENT_REQUESTS: usize = 16;

/// A session must survive this long for the supervisor to reset its backoff.
pub const STABLE_SESSION: Duration = Duration::from_secs(30);
