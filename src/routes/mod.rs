//! The local HTTP surface.
//!
//! One Axum router serves two kinds of callers: external HTTP clients on
//! `127.0.0.1:<port>`, and the tunnel dispatcher, which drives the *same*
//! router in-process through [`LocalSurface::invoke`] — no socket, no extra
//! serialization, and byte-identical behavior for both paths.
//!
//! | Method | Path                                  | Description                     |
//! |--------|---------------------------------------|---------------------------------|
//! | GET    | `/computer/display/screenshot`        | PNG capture with scaling        |
//! | GET    | `/computer/display/dimensions`        | Primary display size            |
//! | POST   | `/computer/input/keyboard/type`       | Type literal text               |
//! | POST   | `/computer/input/keyboard/key`        | XDO-style key sequence          |
//! | GET    | `/computer/input/mouse/position`      | Cursor position                 |
//! | POST   | `/computer/input/mouse/move`          | Move (smooth by default)        |
//! | POST   | `/computer/input/mouse/click`         | Button click/down/up            |
//! | POST   | `/computer/input/mouse/scroll`        | Wheel scroll                    |
//! | POST   | `/computer/copy_to_clipboard`         | Ctrl+C, return clipboard        |
//! | POST   | `/computer/shell/powershell/session`  | No-op (501 without `shell`)     |
//! | POST   | `/internal/update`                    | Accept staged self-update (202) |
//! | GET    | `/internal/diagnostics`               | Agent status snapshot           |
//! | POST   | `/internal/keepalive/remote/activity` | Reset the idle timer            |
//! | POST   | `/internal/keepalive/remote/enable`   | Enable keepalive                |
//! | POST   | `/internal/keepalive/remote/disable`  | Disable keepalive               |
//! | any    | `/computer/file/*`, `/computer/shell/*` | 501 without the capability    |
//!
//! Handler panics never kill the process: a catch-panic layer converts them
//! to `500 {"error": …}`.

pub mod display;
pub mod input;
pub mod internal;

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::util::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;

/// Build the agent router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/computer/display/screenshot", get(display::screenshot))
        .route("/computer/display/dimensions", get(display::dimensions))
        .route("/computer/input/keyboard/type", post(input::keyboard_type))
        .route("/computer/input/keyboard/key", post(input::keyboard_key))
        .route("/computer/input/mouse/position", get(input::mouse_position))
        .route("/computer/input/mouse/move", post(input::mouse_move))
        .route("/computer/input/mouse/click", post(input::mouse_click))
        .route("/computer/input/mouse/scroll", post(input::mouse_scroll))
        .route("/computer/copy_to_clipboard", post(input::copy_to_clipboard))
        .route(
            "/computer/shell/powershell/session",
            post(internal::powershell_session),
        )
        .route("/internal/update", post(internal::update))
        .route("/internal/diagnostics", get(internal::diagnostics))
        .route(
            "/internal/keepalive/remote/activity",
            post(internal::remote_keepalive_activity),
        )
        .route(
            "/internal/keepalive/remote/enable",
            post(internal::remote_keepalive_enable),
        )
        .route(
            "/internal/keepalive/remote/disable",
            post(internal::remote_keepalive_disable),
        )
        .route("/computer/file/{*rest}", any(internal::file_fallback))
        .route("/computer/shell/{*rest}", any(internal::shell_fallback))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Convert a handler panic into a JSON 500 so the process survives.
pub(crate) fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "handler panicked".to_string()
    };
    warn!("handler panic: {detail}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": detail})),
    )
        .into_response()
}

/// The HTTP surface as seen by the tunnel dispatcher.
///
/// Holds a pre-built router; `Router` is cheaply clonable, so each invoke
/// drives a fresh clone through `tower::ServiceExt::oneshot`.
#[derive(Clone)]
pub struct LocalSurface {
    router: Router,
}

impl LocalSurface {
    pub fn new(state: AppState) -> Self {
        Self { router: router(state) }
    }

    /// The router, for binding the TCP listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Invoke a handler in-process. Never fails: any internal error is
    /// reported as a synthesized HTTP status so the tunnel always gets a
    /// response to forward.
    pub async fn invoke(
        &self,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
    ) -> (u16, HashMap<String, String>, Vec<u8>) {
        let Ok(method) = Method::from_bytes(method.as_bytes()) else {
            return error_response(StatusCode::BAD_REQUEST, "invalid method");
        };

        let uri = build_uri(path, query);
        let mut request = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    request = request.header(name, value);
                }
                _ => warn!("dropping unrepresentable header {name:?}"),
            }
        }
        let Ok(request) = request.body(Body::from(body)) else {
            return error_response(StatusCode::BAD_REQUEST, "invalid request");
        };

        let response = match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };

        let status = response.status().as_u16();
        let mut response_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        match axum::body::to_bytes(response.into_body(), usize::MAX).await {
            Ok(bytes) => (status, response_headers, bytes.to_vec()),
            Err(e) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to read response body: {e}"),
            ),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> (u16, HashMap<String, String>, Vec<u8>) {
    let body = serde_json::to_vec(&json!({"error": message})).unwrap_or_default();
    (
        status.as_u16(),
        HashMap::from([("content-type".to_string(), "application/json".to_string())]),
        body,
    )
}

fn build_uri(path: &str, query: &HashMap<String, String>) -> String {
    if query.is_empty() {
        return path.to_string();
    }
    let mut uri = String::with_capacity(path.len() + query.len() * 16);
    uri.push_str(path);
    for (i, (key, value)) in query.iter().enumerate() {
        uri.push(if i == 0 { '?' } else { '&' });
        encode_query_component(&mut uri, key);
        uri.push('=');
        encode_query_component(&mut uri, value);
    }
    uri
}

fn encode_query_component(out: &mut String, raw: &str) {
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
}
