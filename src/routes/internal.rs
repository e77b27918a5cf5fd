//! Internal and compatibility endpoints.

use std::sync::atomic::Ordering;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::state::AppState;

fn default_restart() -> bool {
    true
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    version: String,
    #[serde(default = "default_restart")]
    restart: bool,
}

/// `POST /internal/update` — accept a staged self-update request.
///
/// The agent only validates and acknowledges here; the download/replace/
/// restart machinery lives outside the core and picks the request up from the
/// log. `"latest"` or a `x.y.z` version are accepted.
pub async fn update(
    Json(payload): Json<UpdateRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let valid = payload.version == "latest"
        || {
            let parts: Vec<&str> = payload.version.split('.').collect();
            parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        };
    if !valid {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "version must be \"latest\" or a x.y.z semver"})),
        ));
    }
    info!(version = %payload.version, restart = payload.restart, "update requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "version": payload.version})),
    ))
}

/// `GET /internal/diagnostics` — one-stop status snapshot for operators.
pub async fn diagnostics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "version": state.config.identity.version,
        "fingerprint": state.config.identity.fingerprint,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "tunnel_connected": state.tunnel_connected.load(Ordering::Relaxed),
        "keepalive": {
            "enabled": state.keepalive.is_enabled(),
            "busy": state.keepalive.is_busy(),
            "idle_secs": state.clock.idle_for().as_secs(),
        },
    }))
}

/// `POST /internal/keepalive/remote/activity` — reset the idle timer.
///
/// Mirrors the activity bookkeeping of a real tunnel request (jitter
/// included), so a cloud-side keepalive delegate can suppress local actions.
pub async fn remote_keepalive_activity(State(state): State<AppState>) -> StatusCode {
    state.clock.touch_with_jitter();
    info!("remote keepalive: activity signal received, idle timer reset");
    StatusCode::NO_CONTENT
}

/// `POST /internal/keepalive/remote/enable` — turn the keepalive worker on.
pub async fn remote_keepalive_enable(State(state): State<AppState>) -> StatusCode {
    state.keepalive.enable();
    info!("remote keepalive: enabled");
    StatusCode::NO_CONTENT
}

/// `POST /internal/keepalive/remote/disable` — turn the keepalive worker off.
pub async fn remote_keepalive_disable(State(state): State<AppState>) -> StatusCode {
    state.keepalive.disable();
    info!("remote keepalive: disabled");
    StatusCode::NO_CONTENT
}

/// `POST /computer/shell/powershell/session` — compatibility no-op.
///
/// Gated like the rest of `/computer/shell/*`: 501 without the shell
/// capability. With it, the request is accepted with 204; the body is
/// ignored and nothing is tracked.
pub async fn powershell_session(
    State(state): State<AppState>,
    _body: Bytes,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    if !state.capabilities.shell {
        return Err(capability_fallback("shell", false));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Fallback for `/computer/file/*` without the `file` capability.
pub async fn file_fallback(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    capability_fallback("file", state.capabilities.file)
}

/// Fallback for `/computer/shell/*` without the `shell` capability.
pub async fn shell_fallback(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    capability_fallback("shell", state.capabilities.shell)
}

fn capability_fallback(name: &str, present: bool) -> (StatusCode, Json<Value>) {
    if present {
        // The capability is served by concrete routes; anything that fell
        // through to here is simply an unknown endpoint.
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown {name} endpoint")})),
        )
    } else {
        (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({"error": format!("{name} capability not available")})),
        )
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use super::super::test_support::headless_state;

    async fn post_json(router: axum::Router, path: &str, body: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn update_accepts_latest_and_semver() {
        let (state, _backend) = headless_state();
        let router = crate::routes::router(state);
        let (status, _) = post_json(
            router.clone(),
            "/internal/update",
            r#"{"version":"latest","restart":true}"#,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = post_json(router.clone(), "/internal/update", r#"{"version":"1.2.3"}"#).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = post_json(router, "/internal/update", r#"{"version":"not-a-version"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn diagnostics_reports_identity_and_keepalive() {
        let (state, _backend) = headless_state();
        let router = crate::routes::router(state.clone());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/internal/diagnostics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["fingerprint"], state.config.identity.fingerprint.as_str());
        assert_eq!(parsed["tunnel_connected"], false);
        assert_eq!(parsed["keepalive"]["enabled"], false);
    }

    #[tokio::test]
    async fn remote_keepalive_toggles_state() {
        let (state, _backend) = headless_state();
        let router = crate::routes::router(state.clone());
        assert!(!state.keepalive.is_enabled());

        let (status, _) = post_json(router.clone(), "/internal/keepalive/remote/enable", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.keepalive.is_enabled());

        let (status, _) = post_json(router.clone(), "/internal/keepalive/remote/disable", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.keepalive.is_enabled());

        let (status, _) = post_json(router, "/internal/keepalive/remote/activity", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
