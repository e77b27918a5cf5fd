//! Screen capture endpoints.
//!
//! - `GET /computer/display/screenshot` — PNG capture with optional scaling
//! - `GET /computer/display/dimensions` — primary display size

use std::io::Cursor;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::device::Frame;
use crate::state::AppState;

/// How to fit the capture into the requested dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    /// Stretch to exactly the requested size, ignoring aspect ratio.
    Exact,
    /// Largest size that fits inside the request, preserving aspect ratio.
    AspectFit,
    /// Smallest size that covers the request, preserving aspect ratio.
    AspectFill,
}

impl ScaleMode {
    /// Unrecognized values fall back to the default rather than erroring, so
    /// older callers with stale mode names keep working.
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("exact") => Self::Exact,
            Some("aspect_fill") => Self::AspectFill,
            _ => Self::AspectFit,
        }
    }
}

/// Compute output dimensions for a capture of `(width, height)` scaled into
/// `(target_w, target_h)` under `mode`.
pub fn scaled_dimensions(
    width: u32,
    height: u32,
    target_w: u32,
    target_h: u32,
    mode: ScaleMode,
) -> (u32, u32) {
    if mode == ScaleMode::Exact {
        return (target_w, target_h);
    }
    let orig_aspect = f64::from(width) / f64::from(height);
    let target_aspect = f64::from(target_w) / f64::from(target_h);
    let wider = orig_aspect > target_aspect;
    // aspect_fit pins the dimension that hits its bound first; aspect_fill
    // pins the other one.
    let fit_to_width = match mode {
        ScaleMode::AspectFit => wider,
        _ => !wider,
    };
    if fit_to_width {
        #[allow(clippy::cast_sign_loss)]
        let h = (f64::from(target_w) / orig_aspect).round().max(1.0) as u32;
        (target_w, h)
    } else {
        #[allow(clippy::cast_sign_loss)]
        let w = (f64::from(target_h) * orig_aspect).round().max(1.0) as u32;
        (w, target_h)
    }
}

#[derive(Deserialize)]
pub struct ScreenshotQuery {
    width: Option<u32>,
    height: Option<u32>,
    mode: Option<String>,
}

/// `GET /computer/display/screenshot?width=&height=&mode=` — capture the
/// primary display and return a PNG.
///
/// Defaults to 1024×768 `aspect_fit` when no dimensions are given; a single
/// given dimension pairs with the capture's own size for the other axis.
///
/// # Errors
///
/// `500` with `{"error": …}` on capture or encode failure.
pub async fn screenshot(
    State(state): State<AppState>,
    Query(params): Query<ScreenshotQuery>,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let mode = ScaleMode::parse(params.mode.as_deref());
    let frame = state
        .desktop
        .capture_frame()
        .await
        .map_err(internal_error)?;

    let (target_w, target_h) = match (params.width, params.height) {
        (None, None) => (1024, 768),
        (w, h) => (w.unwrap_or(frame.width).max(1), h.unwrap_or(frame.height).max(1)),
    };

    // Resizing and PNG encoding are CPU-bound; keep them off the async
    // workers so a large capture cannot stall the tunnel reader.
    let png = tokio::task::spawn_blocking(move || encode_png(frame, target_w, target_h, mode))
        .await
        .map_err(|e| internal_error(format!("encode task failed: {e}")))?
        .map_err(internal_error)?;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

fn encode_png(
    frame: Frame,
    target_w: u32,
    target_h: u32,
    mode: ScaleMode,
) -> Result<Vec<u8>, String> {
    let image = image::RgbImage::from_raw(frame.width, frame.height, frame.rgb)
        .ok_or_else(|| "capture returned a malformed frame".to_string())?;

    let (out_w, out_h) = scaled_dimensions(frame.width, frame.height, target_w, target_h, mode);
    let image = if (out_w, out_h) == (frame.width, frame.height) {
        image
    } else {
        image::imageops::resize(&image, out_w, out_h, image::imageops::FilterType::Lanczos3)
    };

    let mut png = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| format!("png encode failed: {e}"))?;
    Ok(png)
}

/// `GET /computer/display/dimensions` — width and height of the primary
/// display.
pub async fn dimensions(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (width, height) = state.desktop.dimensions().map_err(internal_error)?;
    Ok(Json(json!({"width": width, "height": height})))
}

fn internal_error(e: impl ToString) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}
