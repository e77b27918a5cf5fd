//! Desktop capability seams.
//!
//! The tunnel core never talks to a concrete screen or input stack; it goes
//! through the two traits here. Real platform backends (Win32 `SendInput`,
//! X11, …) and the [`headless`] simulator used by default and in tests all
//! plug in behind the same seam.
//!
//! The physical input device is a single shared resource: concurrent HTTP
//! handlers must not interleave their synthetic events. [`Desktop`] owns a
//! mutex that serializes every input operation process-wide, independent of
//! the keepalive gate — the gate only arbitrates between the dispatcher and
//! the keepalive worker, while this lock also covers direct local HTTP
//! callers.

pub mod headless;
pub mod xdo;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

/// One captured screen frame, tightly packed RGB8.
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Mouse buttons accepted by the click endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// What to do with a mouse button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonAction {
    #[default]
    Click,
    Down,
    Up,
}

/// Scroll directions accepted by the scroll endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Screen capture backend.
///
/// Implementations may block the calling OS thread; callers go through
/// [`Desktop::capture_frame`], which shifts the work onto the blocking pool.
pub trait ScreenCapture: Send + Sync {
    /// Width and height of the primary display in pixels.
    fn dimensions(&self) -> Result<(u32, u32), DeviceError>;
    /// Grab the current contents of the primary display.
    fn capture(&self) -> Result<Frame, DeviceError>;
}

/// Keyboard and mouse synthesis backend.
pub trait InputSynthesizer: Send + Sync {
    fn cursor_position(&self) -> Result<(i32, i32), DeviceError>;
    fn move_cursor(&self, x: i32, y: i32) -> Result<(), DeviceError>;
    fn button(&self, button: MouseButton, action: ButtonAction) -> Result<(), DeviceError>;
    fn scroll(&self, direction: ScrollDirection, amount: i32) -> Result<(), DeviceError>;
    /// Type literal text (no chord handling).
    fn type_text(&self, text: &str) -> Result<(), DeviceError>;
    /// Press or release a single named key.
    fn key(&self, key: &str, down: bool) -> Result<(), DeviceError>;
    /// Current clipboard contents. Remote-desktop clipboard sync can lag a
    /// copy chord by hundreds of milliseconds; callers poll.
    fn read_clipboard(&self) -> Result<String, DeviceError>;
    /// Replace the clipboard contents.
    fn write_clipboard(&self, text: &str) -> Result<(), DeviceError>;
}

/// A backend failure. Becomes a 500 at the HTTP surface.
#[derive(Debug, Clone)]
pub struct DeviceError(pub String);

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DeviceError {}

/// The assembled desktop: capture + serialized input.
pub struct Desktop {
    capture: Arc<dyn ScreenCapture>,
    input: Arc<dyn InputSynthesizer>,
    /// Process-wide serialization of the physical input device.
    input_lock: tokio::sync::Mutex<()>,
}

impl Desktop {
    pub fn new(capture: Arc<dyn ScreenCapture>, input: Arc<dyn InputSynthesizer>) -> Self {
        Self {
            capture,
            input,
            input_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Primary display dimensions.
    pub fn dimensions(&self) -> Result<(u32, u32), DeviceError> {
        self.capture.dimensions()
    }

    /// Capture a frame on the blocking pool (platform capture APIs may stall
    /// the calling thread).
    pub async fn capture_frame(&self) -> Result<Frame, DeviceError> {
        let capture = Arc::clone(&self.capture);
        tokio::task::spawn_blocking(move || capture.capture())
            .await
            .map_err(|e| DeviceError(format!("capture task failed: {e}")))?
    }

    /// Run one input operation while holding the device lock.
    pub async fn with_input<T>(
        &self,
        op: impl FnOnce(&dyn InputSynthesizer) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let _guard = self.input_lock.lock().await;
        op(self.input.as_ref())
    }
}

/// Which optional endpoint groups this agent actually serves. Advertised to
/// the cloud in `Hello` and consulted by the 501 fallbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub file: bool,
    pub shell: bool,
}

impl Capabilities {
    /// The capability set sent in the `Hello` frame, derived from what the
    /// HTTP surface serves.
    pub fn advertised(self) -> BTreeSet<String> {
        let mut set = BTreeSet::from(["display".to_string(), "input".to_string()]);
        if self.file {
            set.insert("file".to_string());
        }
        if self.shell {
            set.insert("shell".to_string());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_capabilities_track_flags() {
        let base = Capabilities::default().advertised();
        assert!(base.contains("display") && base.contains("input"));
        assert!(!base.contains("shell"));

        let full = Capabilities { file: true, shell: true }.advertised();
        assert!(full.contains("file") && full.contains("shell"));
    }
}
