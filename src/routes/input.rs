//! Keyboard and mouse endpoints.
//!
//! All mutating endpoints return `204 No Content` on success. Input synthesis
//! goes through [`Desktop::with_input`](crate::device::Desktop::with_input),
//! which serializes access to the physical device process-wide.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::device::xdo;
use crate::device::{ButtonAction, DeviceError, MouseButton, ScrollDirection};
use crate::state::AppState;

/// Steps used for a smooth mouse move.
const SMOOTH_MOVE_STEPS: i32 = 20;
/// Spacing between smooth-move steps.
const SMOOTH_MOVE_SPACING: Duration = Duration::from_millis(5);
/// Clipboard polls after the copy chord; remote-desktop clipboard sync can
/// lag the chord by hundreds of milliseconds.
const CLIPBOARD_POLL_ATTEMPTS: u64 = 8;

type HandlerError = (StatusCode, Json<Value>);

fn bad_request(message: &str) -> HandlerError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

fn device_error(e: DeviceError) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

#[derive(Deserialize)]
pub struct TypeRequest {
    text: String,
}

/// `POST /computer/input/keyboard/type` — type a literal string.
pub async fn keyboard_type(
    State(state): State<AppState>,
    Json(payload): Json<TypeRequest>,
) -> Result<StatusCode, HandlerError> {
    if payload.text.is_empty() {
        return Err(bad_request("missing 'text'"));
    }
    state
        .desktop
        .with_input(|input| input.type_text(&payload.text))
        .await
        .map_err(device_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct KeyRequest {
    sequence: String,
}

/// `POST /computer/input/keyboard/key` — execute an XDO-style key sequence
/// (e.g. `"ctrl+c ctrl+v"`).
///
/// Each chord is synthesized atomically under the device lock so concurrent
/// callers cannot interleave a half-pressed modifier.
pub async fn keyboard_key(
    State(state): State<AppState>,
    Json(payload): Json<KeyRequest>,
) -> Result<StatusCode, HandlerError> {
    let chords = xdo::parse(&payload.sequence);
    if chords.is_empty() {
        return Err(bad_request("missing or empty 'sequence'"));
    }
    for chord in chords {
        state
            .desktop
            .with_input(|input| {
                for event in &chord {
                    input.key(&event.key, event.down)?;
                }
                Ok(())
            })
            .await
            .map_err(device_error)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct CopyRequest {
    /// Key name under which the copied data is returned.
    text: String,
}

/// `POST /computer/copy_to_clipboard` — synthesize Ctrl+C and return the
/// clipboard contents keyed by the requested name.
///
/// The clipboard is cleared before the chord so stale contents cannot
/// masquerade as a successful copy, then polled with progressive delays.
/// An empty result is still a 200 — the caller decides what that means.
pub async fn copy_to_clipboard(
    State(state): State<AppState>,
    Json(payload): Json<CopyRequest>,
) -> Result<Json<Value>, HandlerError> {
    if payload.text.is_empty() {
        return Err(bad_request("missing 'text' (key name)"));
    }

    state
        .desktop
        .with_input(|input| {
            input.write_clipboard("")?;
            input.key("ctrl", true)?;
            input.key("c", true)?;
            input.key("c", false)?;
            input.key("ctrl", false)
        })
        .await
        .map_err(device_error)?;

    let mut contents = String::new();
    for attempt in 0..CLIPBOARD_POLL_ATTEMPTS {
        tokio::time::sleep(Duration::from_millis(200 + attempt * 100)).await;
        contents = state
            .desktop
            .with_input(|input| input.read_clipboard())
            .await
            .map_err(device_error)?;
        if !contents.is_empty() {
            break;
        }
    }

    let mut body = serde_json::Map::new();
    body.insert(payload.text, Value::String(contents));
    Ok(Json(Value::Object(body)))
}

/// `GET /computer/input/mouse/position` — current cursor position.
pub async fn mouse_position(
    State(state): State<AppState>,
) -> Result<Json<Value>, HandlerError> {
    let (x, y) = state
        .desktop
        .with_input(|input| input.cursor_position())
        .await
        .map_err(device_error)?;
    Ok(Json(json!({"x": x, "y": y})))
}

fn default_smooth() -> bool {
    true
}

#[derive(Deserialize)]
pub struct MoveRequest {
    x: i32,
    y: i32,
    #[serde(default = "default_smooth")]
    smooth: bool,
}

/// `POST /computer/input/mouse/move` — move the cursor.
///
/// Smooth moves interpolate in 20 steps with ~5 ms spacing; `"smooth":false`
/// jumps directly.
pub async fn mouse_move(
    State(state): State<AppState>,
    Json(payload): Json<MoveRequest>,
) -> Result<StatusCode, HandlerError> {
    if !payload.smooth {
        state
            .desktop
            .with_input(|input| input.move_cursor(payload.x, payload.y))
            .await
            .map_err(device_error)?;
        return Ok(StatusCode::NO_CONTENT);
    }

    let (start_x, start_y) = state
        .desktop
        .with_input(|input| input.cursor_position())
        .await
        .map_err(device_error)?;
    for step in 1..=SMOOTH_MOVE_STEPS {
        let x = start_x + (payload.x - start_x) * step / SMOOTH_MOVE_STEPS;
        let y = start_y + (payload.y - start_y) * step / SMOOTH_MOVE_STEPS;
        state
            .desktop
            .with_input(|input| input.move_cursor(x, y))
            .await
            .map_err(device_error)?;
        if step < SMOOTH_MOVE_STEPS {
            tokio::time::sleep(SMOOTH_MOVE_SPACING).await;
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ClickRequest {
    button: MouseButton,
    #[serde(default)]
    action: ButtonAction,
    x: Option<i32>,
    y: Option<i32>,
}

/// `POST /computer/input/mouse/click` — press, release, or click a button,
/// optionally moving to `(x, y)` first.
pub async fn mouse_click(
    State(state): State<AppState>,
    Json(payload): Json<ClickRequest>,
) -> Result<StatusCode, HandlerError> {
    state
        .desktop
        .with_input(|input| {
            if let (Some(x), Some(y)) = (payload.x, payload.y) {
                input.move_cursor(x, y)?;
            }
            input.button(payload.button, payload.action)
        })
        .await
        .map_err(device_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ScrollRequest {
    direction: ScrollDirection,
    amount: i32,
    x: Option<i32>,
    y: Option<i32>,
}

/// `POST /computer/input/mouse/scroll` — scroll the wheel, optionally moving
/// the cursor first.
pub async fn mouse_scroll(
    State(state): State<AppState>,
    Json(payload): Json<ScrollRequest>,
) -> Result<StatusCode, HandlerError> {
    if payload.amount < 0 {
        return Err(bad_request("'amount' must be non-negative"));
    }
    if payload.amount == 0 {
        return Ok(StatusCode::NO_CONTENT);
    }
    state
        .desktop
        .with_input(|input| {
            if let (Some(x), Some(y)) = (payload.x, payload.y) {
                input.move_cursor(x, y)?;
            }
            input.scroll(payload.direction, payload.amount)
        })
        .await
        .map_err(device_error)?;
    Ok(StatusCode::NO_CONTENT)
}
