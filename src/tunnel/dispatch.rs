//! Request dispatcher: tunnel Request frames → in-process HTTP calls.
//!
//! For each inbound Request the dispatcher spawns a worker that
//!
//! 1. waits for a concurrency permit (cap 16, FIFO),
//! 2. takes the keepalive gate in *shared* mode — if a keepalive action is
//!    mid-flight the worker waits for it; requests are never dropped,
//! 3. drives the local surface through its in-process invoke,
//! 4. wraps the result in a Response frame with the same id and pushes it
//!    onto the session's bounded outbound queue (backpressure blocks the
//!    worker, not the reader).
//!
//! The activity clock is touched the moment a request is accepted, before
//! any queueing, so idle tracking reflects arrival rather than completion.
//!
//! Workers are owned by the session through this dispatcher: session close
//! aborts them all, and a worker whose session died simply fails to enqueue
//! its response and exits.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::codec::{RequestFrame, ResponseFrame, TunnelFrame};
use super::{MAX_CONCURRENT_REQUESTS, REQUEST_DEADLINE};
use crate::activity::ActivityClock;
use crate::keepalive::KeepaliveGate;
use crate::routes::LocalSurface;

/// Per-session request dispatcher.
pub struct Dispatcher {
    surface: LocalSurface,
    clock: Arc<ActivityClock>,
    gate: Arc<KeepaliveGate>,
    outbound: mpsc::Sender<TunnelFrame>,
    limiter: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    workers: Mutex<JoinSet<()>>,
    draining: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        surface: LocalSurface,
        clock: Arc<ActivityClock>,
        gate: Arc<KeepaliveGate>,
        outbound: mpsc::Sender<TunnelFrame>,
    ) -> Self {
        Self {
            surface,
            clock,
            gate,
            outbound,
            limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            workers: Mutex::new(JoinSet::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Stop accepting new requests; stragglers get 503.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Handle one inbound Request frame.
    pub async fn dispatch(&self, request: RequestFrame) {
        self.clock.touch_with_jitter();

        if self.draining.load(Ordering::Relaxed) {
            self.send_error(&request.id, 503, "draining").await;
            return;
        }

        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(request.id.clone()) {
                // Same id while the first is still running: answer the
                // duplicate, leave the original untouched.
                drop(in_flight);
                warn!(id = %request.id, "duplicate request id");
                self.send_error(&request.id, 409, "duplicate request id").await;
                return;
            }
        }

        let surface = self.surface.clone();
        let gate = Arc::clone(&self.gate);
        let limiter = Arc::clone(&self.limiter);
        let in_flight = Arc::clone(&self.in_flight);
        let outbound = self.outbound.clone();

        self.workers.lock().await.spawn(async move {
            // FIFO under the concurrency cap.
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            // Shared mode: many requests at once, but never overlapping a
            // keepalive action.
            let _gate = gate.shared().await;

            debug!(id = %request.id, method = %request.method, path = %request.path, "request");
            let response = match tokio::time::timeout(
                REQUEST_DEADLINE,
                surface.invoke(
                    &request.method,
                    &request.path,
                    &request.query,
                    &request.headers,
                    request.body,
                ),
            )
            .await
            {
                Ok((status, headers, body)) => ResponseFrame {
                    id: request.id.clone(),
                    status,
                    headers,
                    body,
                },
                Err(_) => {
                    warn!(id = %request.id, "request deadline exceeded");
                    error_frame(&request.id, 504, "request deadline exceeded")
                }
            };

            // Session gone = channel closed; the response is discarded.
            let _ = outbound.send(TunnelFrame::Response(response)).await;
            in_flight.lock().await.remove(&request.id);
        });
    }

    async fn send_error(&self, id: &str, status: u16, message: &str) {
        let _ = self
            .outbound
            .send(TunnelFrame::Response(error_frame(id, status, message)))
            .await;
    }

    /// Wait for every in-flight worker to finish (used while draining).
    pub async fn join_all(&self) {
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
    }

    /// Abort all in-flight workers and forget their ids.
    pub async fn shutdown(&self) {
        self.workers.lock().await.abort_all();
        self.in_flight.lock().await.clear();
    }
}

fn error_frame(id: &str, status: u16, message: &str) -> ResponseFrame {
    ResponseFrame {
        id: id.to_string(),
        status,
        headers: std::collections::HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]),
        body: serde_json::to_vec(&serde_json::json!({"error": message})).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::routes::test_support::headless_state;

    fn request(id: &str, method: &str, path: &str, body: &[u8]) -> RequestFrame {
        RequestFrame {
            id: id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            query: HashMap::new(),
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: body.to_vec(),
        }
    }

    fn dispatcher() -> (Dispatcher, mpsc::Receiver<TunnelFrame>, Arc<KeepaliveGate>) {
        let (state, _backend) = headless_state();
        let clock = state.clock.clone();
        let gate = Arc::new(KeepaliveGate::new());
        let (tx, rx) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(LocalSurface::new(state), clock, Arc::clone(&gate), tx);
        (dispatcher, rx, gate)
    }

    async fn next_response(rx: &mut mpsc::Receiver<TunnelFrame>) -> ResponseFrame {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("response in time")
            .expect("channel open")
        {
            TunnelFrame::Response(resp) => resp,
            other => panic!("expected response, got {}", other.kind_name()),
        }
    }

    #[tokio::test]
    async fn response_carries_the_request_id_and_handler_output() {
        let (dispatcher, mut rx, _gate) = dispatcher();
        dispatcher
            .dispatch(request("r1", "GET", "/computer/display/dimensions", b""))
            .await;

        let response = next_response(&mut rx).await;
        assert_eq!(response.id, "r1");
        assert_eq!(response.status, 200);
        let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(parsed, serde_json::json!({"width": 1920, "height": 1080}));
    }

    #[tokio::test]
    async fn duplicate_id_gets_409_and_original_completes() {
        let (dispatcher, mut rx, _gate) = dispatcher();
        // Smooth move takes ~100 ms, long enough for the duplicate to land
        // while the original is still in flight.
        dispatcher
            .dispatch(request(
                "r1",
                "POST",
                "/computer/input/mouse/move",
                br#"{"x":400,"y":300}"#,
            ))
            .await;
        dispatcher
            .dispatch(request("r1", "GET", "/computer/display/dimensions", b""))
            .await;

        let first = next_response(&mut rx).await;
        assert_eq!((first.id.as_str(), first.status), ("r1", 409));
        let second = next_response(&mut rx).await;
        assert_eq!((second.id.as_str(), second.status), ("r1", 204));
    }

    #[tokio::test]
    async fn draining_rejects_new_requests_with_503() {
        let (dispatcher, mut rx, _gate) = dispatcher();
        dispatcher.begin_drain();
        dispatcher
            .dispatch(request("r9", "GET", "/computer/display/dimensions", b""))
            .await;
        let response = next_response(&mut rx).await;
        assert_eq!((response.id.as_str(), response.status), ("r9", 503));
    }

    #[tokio::test]
    async fn requests_wait_for_an_exclusive_gate_holder() {
        let (dispatcher, mut rx, gate) = dispatcher();
        let guard = gate.exclusive().await;

        dispatcher
            .dispatch(request("r1", "GET", "/computer/display/dimensions", b""))
            .await;
        // Gate held exclusively: the worker must not produce a response.
        assert!(
            tokio::time::timeout(Duration::from_millis(150), rx.recv())
                .await
                .is_err()
        );

        drop(guard);
        let response = next_response(&mut rx).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn shutdown_discards_in_flight_work() {
        let (dispatcher, mut rx, _gate) = dispatcher();
        dispatcher
            .dispatch(request(
                "slow",
                "POST",
                "/computer/input/mouse/move",
                br#"{"x":500,"y":500}"#,
            ))
            .await;
        dispatcher.shutdown().await;
        // The worker was cancelled; no response is ever written.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn dispatch_touches_the_activity_clock() {
        let (state, _backend) = headless_state();
        let clock = state.clock.clone();
        let gate = Arc::new(KeepaliveGate::new());
        let (tx, mut rx) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(LocalSurface::new(state), clock.clone(), gate, tx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let idle_before = clock.idle_for();
        dispatcher
            .dispatch(request("r1", "GET", "/computer/display/dimensions", b""))
            .await;
        let _ = next_response(&mut rx).await;
        // touch_with_jitter may land up to 7 s in the past, but never before
        // the pre-dispatch idle time grew past it.
        assert!(clock.idle_for() <= idle_before + crate::activity::ACTIVITY_JITTER);
    }
}
