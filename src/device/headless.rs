//! Simulated desktop backend.
//!
//! Used when no platform capture/input stack is compiled in, and as the test
//! double for the HTTP surface: it tracks the cursor, records every input
//! event in order, and renders a flat dark frame for screenshots.

use std::collections::HashSet;
use std::sync::Mutex;

use super::{
    ButtonAction, DeviceError, Frame, InputSynthesizer, MouseButton, ScreenCapture,
    ScrollDirection,
};

/// Every input operation the backend has been asked to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Move { x: i32, y: i32 },
    Button { button: MouseButton, action: ButtonAction },
    Scroll { direction: ScrollDirection, amount: i32 },
    Text(String),
    Key { key: String, down: bool },
}

/// In-memory desktop with a fixed virtual resolution.
///
/// Copy semantics are simulated: a `ctrl+c` chord moves the current
/// *selection* (set via [`HeadlessDesktop::set_selection`]) into the
/// clipboard, the way a focused application would.
pub struct HeadlessDesktop {
    width: u32,
    height: u32,
    cursor: Mutex<(i32, i32)>,
    events: Mutex<Vec<InputEvent>>,
    pressed: Mutex<HashSet<String>>,
    clipboard: Mutex<String>,
    selection: Mutex<String>,
}

impl HeadlessDesktop {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cursor: Mutex::new((0, 0)),
            events: Mutex::new(Vec::new()),
            pressed: Mutex::new(HashSet::new()),
            clipboard: Mutex::new(String::new()),
            selection: Mutex::new(String::new()),
        }
    }

    /// Drain the recorded event log.
    pub fn take_events(&self) -> Vec<InputEvent> {
        std::mem::take(&mut *self.events.lock().expect("event log poisoned"))
    }

    /// Set the text a `ctrl+c` chord would copy.
    pub fn set_selection(&self, text: &str) {
        *self.selection.lock().expect("selection poisoned") = text.to_string();
    }

    fn record(&self, event: InputEvent) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}

impl Default for HeadlessDesktop {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl ScreenCapture for HeadlessDesktop {
    fn dimensions(&self) -> Result<(u32, u32), DeviceError> {
        Ok((self.width, self.height))
    }

    fn capture(&self) -> Result<Frame, DeviceError> {
        let pixels = self.width as usize * self.height as usize;
        Ok(Frame {
            width: self.width,
            height: self.height,
            rgb: [0x1e, 0x1e, 0x2e].repeat(pixels),
        })
    }
}

impl InputSynthesizer for HeadlessDesktop {
    fn cursor_position(&self) -> Result<(i32, i32), DeviceError> {
        Ok(*self.cursor.lock().expect("cursor poisoned"))
    }

    fn move_cursor(&self, x: i32, y: i32) -> Result<(), DeviceError> {
        *self.cursor.lock().expect("cursor poisoned") = (x, y);
        self.record(InputEvent::Move { x, y });
        Ok(())
    }

    fn button(&self, button: MouseButton, action: ButtonAction) -> Result<(), DeviceError> {
        self.record(InputEvent::Button { button, action });
        Ok(())
    }

    fn scroll(&self, direction: ScrollDirection, amount: i32) -> Result<(), DeviceError> {
        self.record(InputEvent::Scroll { direction, amount });
        Ok(())
    }

    fn type_text(&self, text: &str) -> Result<(), DeviceError> {
        self.record(InputEvent::Text(text.to_string()));
        Ok(())
    }

    fn key(&self, key: &str, down: bool) -> Result<(), DeviceError> {
        self.record(InputEvent::Key { key: key.to_string(), down });
        let mut pressed = self.pressed.lock().expect("pressed set poisoned");
        if down {
            pressed.insert(key.to_string());
            if key == "c" && pressed.contains("ctrl") {
                *self.clipboard.lock().expect("clipboard poisoned") =
                    self.selection.lock().expect("selection poisoned").clone();
            }
        } else {
            pressed.remove(key);
        }
        Ok(())
    }

    fn read_clipboard(&self) -> Result<String, DeviceError> {
        Ok(self.clipboard.lock().expect("clipboard poisoned").clone())
    }

    fn write_clipboard(&self, text: &str) -> Result<(), DeviceError> {
        *self.clipboard.lock().expect("clipboard poisoned") = text.to_string();
        Ok(())
    }
}
