//! # Keyboard Driver
//!
//! Trait abstraction over the key-press sink so the sequencer can be tested
//! without a uinput device, plus the Linux uinput implementation.

use async_trait::async_trait;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key};
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::error::{Result, TswControllerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Down,
    Up,
}

/// Sink for simulated key presses
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyboardDriver: Send {
    /// Press or release one named key
    async fn set_key(&mut self, key: &str, state: KeyState) -> Result<()>;

    /// Pause between key groups
    async fn sleep_ms(&mut self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }
}

/// Resolve a lowercase key name to its evdev key.
#[must_use]
pub fn key_code(name: &str) -> Option<Key> {
    let key = match name {
        "a" => Key::KEY_A,
        "b" => Key::KEY_B,
        "c" => Key::KEY_C,
        "d" => Key::KEY_D,
        "e" => Key::KEY_E,
        "f" => Key::KEY_F,
        "g" => Key::KEY_G,
        "h" => Key::KEY_H,
        "i" => Key::KEY_I,
        "j" => Key::KEY_J,
        "k" => Key::KEY_K,
        "l" => Key::KEY_L,
        "m" => Key::KEY_M,
        "n" => Key::KEY_N,
        "o" => Key::KEY_O,
        "p" => Key::KEY_P,
        "q" => Key::KEY_Q,
        "r" => Key::KEY_R,
        "s" => Key::KEY_S,
        "t" => Key::KEY_T,
        "u" => Key::KEY_U,
        "v" => Key::KEY_V,
        "w" => Key::KEY_W,
        "x" => Key::KEY_X,
        "y" => Key::KEY_Y,
        "z" => Key::KEY_Z,
        "0" => Key::KEY_0,
        "1" => Key::KEY_1,
        "2" => Key::KEY_2,
        "3" => Key::KEY_3,
        "4" => Key::KEY_4,
        "5" => Key::KEY_5,
        "6" => Key::KEY_6,
        "7" => Key::KEY_7,
        "8" => Key::KEY_8,
        "9" => Key::KEY_9,
        "f1" => Key::KEY_F1,
        "f2" => Key::KEY_F2,
        "f3" => Key::KEY_F3,
        "f4" => Key::KEY_F4,
        "f5" => Key::KEY_F5,
        "f6" => Key::KEY_F6,
        "f7" => Key::KEY_F7,
        "f8" => Key::KEY_F8,
        "f9" => Key::KEY_F9,
        "f10" => Key::KEY_F10,
        "f11" => Key::KEY_F11,
        "f12" => Key::KEY_F12,
        "num0" => Key::KEY_KP0,
        "num1" => Key::KEY_KP1,
        "num2" => Key::KEY_KP2,
        "num3" => Key::KEY_KP3,
        "num4" => Key::KEY_KP4,
        "num5" => Key::KEY_KP5,
        "num6" => Key::KEY_KP6,
        "num7" => Key::KEY_KP7,
        "num8" => Key::KEY_KP8,
        "num9" => Key::KEY_KP9,
        "num_enter" => Key::KEY_KPENTER,
        "num_plus" => Key::KEY_KPPLUS,
        "num_minus" => Key::KEY_KPMINUS,
        "space" | "spacebar" => Key::KEY_SPACE,
        "enter" | "return" => Key::KEY_ENTER,
        "tab" => Key::KEY_TAB,
        "escape" | "esc" => Key::KEY_ESC,
        "backspace" => Key::KEY_BACKSPACE,
        "delete" => Key::KEY_DELETE,
        "insert" => Key::KEY_INSERT,
        "home" => Key::KEY_HOME,
        "end" => Key::KEY_END,
        "pageup" => Key::KEY_PAGEUP,
        "pagedown" => Key::KEY_PAGEDOWN,
        "up" | "arrowup" => Key::KEY_UP,
        "down" | "arrowdown" => Key::KEY_DOWN,
        "left" | "arrowleft" => Key::KEY_LEFT,
        "right" | "arrowright" => Key::KEY_RIGHT,
        "capslock" => Key::KEY_CAPSLOCK,
        "-" | "minus" => Key::KEY_MINUS,
        "=" | "equal" => Key::KEY_EQUAL,
        "[" => Key::KEY_LEFTBRACE,
        "]" => Key::KEY_RIGHTBRACE,
        ";" => Key::KEY_SEMICOLON,
        "'" => Key::KEY_APOSTROPHE,
        "`" => Key::KEY_GRAVE,
        "\\" => Key::KEY_BACKSLASH,
        "," | "comma" => Key::KEY_COMMA,
        "." => Key::KEY_DOT,
        "/" => Key::KEY_SLASH,
        "cmd" | "lcmd" => Key::KEY_LEFTMETA,
        "rcmd" => Key::KEY_RIGHTMETA,
        "alt" | "lalt" => Key::KEY_LEFTALT,
        "ralt" => Key::KEY_RIGHTALT,
        "ctrl" | "lctrl" | "control" => Key::KEY_LEFTCTRL,
        "rctrl" => Key::KEY_RIGHTCTRL,
        "shift" | "lshift" => Key::KEY_LEFTSHIFT,
        "rshift" => Key::KEY_RIGHTSHIFT,
        _ => return None,
    };
    Some(key)
}

/// Every key the virtual keyboard advertises.
const ADVERTISED_KEYS: &[&str] = &[
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", "q", "r", "s", "t",
    "u", "v", "w", "x", "y", "z", "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "f1", "f2", "f3",
    "f4", "f5", "f6", "f7", "f8", "f9", "f10", "f11", "f12", "num0", "num1", "num2", "num3", "num4",
    "num5", "num6", "num7", "num8", "num9", "num_enter", "num_plus", "num_minus", "space", "enter",
    "tab", "escape", "backspace", "delete", "insert", "home", "end", "pageup", "pagedown", "up", "down",
    "left", "right", "capslock", "-", "=", "[", "]", ";", "'", "`", "\\", ",", ".", "/", "cmd", "rcmd",
    "alt", "ralt", "ctrl", "rctrl", "shift", "rshift",
];

/// Virtual keyboard backed by `/dev/uinput`.
pub struct UinputKeyboard {
    device: VirtualDevice,
}

impl UinputKeyboard {
    /// Create the virtual keyboard.
    ///
    /// # Errors
    ///
    /// Returns `Keyboard` if `/dev/uinput` cannot be opened (usually a
    /// permissions problem) or the device cannot be created.
    pub fn create(name: &str) -> Result<Self> {
        let mut keys = AttributeSet::<Key>::new();
        for key in ADVERTISED_KEYS.iter().filter_map(|name| key_code(name)) {
            keys.insert(key);
        }

        let device = VirtualDeviceBuilder::new()
            .and_then(|builder| builder.name(name).with_keys(&keys))
            .and_then(|builder| builder.build())
            .map_err(|e| TswControllerError::Keyboard(format!("Failed to create uinput keyboard: {}", e)))?;

        info!("Virtual keyboard '{}' created", name);
        Ok(Self { device })
    }
}

#[async_trait]
impl KeyboardDriver for UinputKeyboard {
    async fn set_key(&mut self, key: &str, state: KeyState) -> Result<()> {
        let code = key_code(key).ok_or_else(|| TswControllerError::UnknownKey(key.to_string()))?;
        let value = match state {
            KeyState::Down => 1,
            KeyState::Up => 0,
        };
        let event = InputEvent::new(EventType::KEY, code.code(), value);
        self.device
            .emit(&[event])
            .map_err(|e| TswControllerError::Keyboard(format!("Failed to emit {}: {}", key, e)))
    }
}
