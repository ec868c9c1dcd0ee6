//! # Evdev Joystick Source
//!
//! Reads joysticks through the Linux evdev interface and turns their events
//! into [`DeviceNotification`]s.
//!
//! ## Input Addressing
//!
//! Inputs are numbered the way mapping documents expect them:
//!
//! | Kind | Index |
//! |------|-------|
//! | axis | position among the device's non-hat absolute axes, in code order |
//! | button | position among the device's supported keys, in code order |
//! | hat | `code - ABS_HAT0X`, so `HAT0X = 0`, `HAT0Y = 1`, ... (values -1/0/1) |
//!
//! ## Usage
//!
//! ```no_run
//! use tsw_controller::controller::evdev_source::EvdevJoystick;
//!
//! for joystick in EvdevJoystick::discover(&[])? {
//!     println!("{} at {}", joystick.name(), joystick.device_path());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use chrono::Utc;
use evdev::{AbsoluteAxisType, Device, InputEvent, InputEventKind, Key};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::{DeviceEvent, DeviceInfo, DeviceNotification};
use super::sdl_mapping::ControlKind;
use crate::error::{Result, TswControllerError};

/// First hat axis code.
const ABS_HAT_FIRST: u16 = AbsoluteAxisType::ABS_HAT0X.0;
/// Last hat axis code.
const ABS_HAT_LAST: u16 = AbsoluteAxisType::ABS_HAT3Y.0;

fn is_hat(code: u16) -> bool {
    (ABS_HAT_FIRST..=ABS_HAT_LAST).contains(&code)
}

/// Maps evdev codes to mapping indices for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputIndex {
    axes: HashMap<u16, u16>,
    buttons: HashMap<u16, u16>,
}

impl InputIndex {
    /// Build from the supported absolute axis codes and key codes.
    #[must_use]
    pub fn new(axis_codes: impl IntoIterator<Item = u16>, key_codes: impl IntoIterator<Item = u16>) -> Self {
        let mut axis_codes: Vec<u16> = axis_codes.into_iter().filter(|c| !is_hat(*c)).collect();
        axis_codes.sort_unstable();
        let mut key_codes: Vec<u16> = key_codes.into_iter().collect();
        key_codes.sort_unstable();

        Self {
            axes: axis_codes.into_iter().zip(0u16..).collect(),
            buttons: key_codes.into_iter().zip(0u16..).collect(),
        }
    }

    /// Translate an evdev event into `(kind, index, raw value)`.
    ///
    /// Sync, key-repeat and unsupported events yield `None`.
    #[must_use]
    pub fn translate(&self, event: &InputEvent) -> Option<(ControlKind, u16, f64)> {
        match event.kind() {
            InputEventKind::AbsAxis(axis) if is_hat(axis.0) => {
                Some((ControlKind::Hat, axis.0 - ABS_HAT_FIRST, f64::from(event.value())))
            }
            InputEventKind::AbsAxis(axis) => self
                .axes
                .get(&axis.0)
                .map(|index| (ControlKind::Axis, *index, f64::from(event.value()))),
            // value 2 is autorepeat
            InputEventKind::Key(key) if event.value() != 2 => self
                .buttons
                .get(&key.code())
                .map(|index| (ControlKind::Button, *index, if event.value() != 0 { 1.0 } else { 0.0 })),
            _ => None,
        }
    }
}

/// An opened joystick.
pub struct EvdevJoystick {
    device: Device,
    device_path: PathBuf,
    guid: String,
    usb_id: String,
    index: InputIndex,
}

impl EvdevJoystick {
    /// Open the device at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Device` if the node cannot be opened (usually permissions).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let device = Device::open(path)
            .map_err(|e| TswControllerError::Device(format!("Failed to open {}: {}", path.display(), e)))?;
        Ok(Self::from_device(device, path.to_path_buf()))
    }

    fn from_device(device: Device, device_path: PathBuf) -> Self {
        let id = device.input_id();
        let usb_id = format!("0x{:04x}:0x{:04x}", id.vendor(), id.product());
        let guid = format!("{}@{}", usb_id, device_path.display());

        let axis_codes: Vec<u16> = device
            .supported_absolute_axes()
            .map(|axes| axes.iter().map(|a| a.0).collect())
            .unwrap_or_default();
        let key_codes: Vec<u16> = device
            .supported_keys()
            .map(|keys| keys.iter().map(|k| k.code()).collect())
            .unwrap_or_default();

        Self {
            device,
            device_path,
            guid,
            usb_id,
            index: InputIndex::new(axis_codes, key_codes),
        }
    }

    fn looks_like_joystick(device: &Device) -> bool {
        let has_stick_axis = device
            .supported_absolute_axes()
            .map_or(false, |axes| axes.contains(AbsoluteAxisType::ABS_X) || axes.contains(AbsoluteAxisType::ABS_THROTTLE));
        let has_joystick_button = device.supported_keys().map_or(false, |keys| {
            keys.contains(Key::BTN_TRIGGER) || keys.contains(Key::BTN_SOUTH)
        });
        has_stick_axis && has_joystick_button
    }

    /// Open the configured device paths, or every joystick under `/dev/input`
    /// when none are configured.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` when nothing usable was found.
    pub fn discover(paths: &[PathBuf]) -> Result<Vec<Self>> {
        let mut joysticks = Vec::new();

        if paths.is_empty() {
            let input_dir = Path::new("/dev/input");
            if !input_dir.exists() {
                return Err(TswControllerError::Device("/dev/input directory not found".to_string()));
            }

            let mut entries: Vec<PathBuf> = std::fs::read_dir(input_dir)
                .map_err(|e| TswControllerError::Device(format!("Failed to read /dev/input: {}", e)))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    path.file_name()
                        .map_or(false, |name| name.to_string_lossy().starts_with("event"))
                })
                .collect();
            // Deterministic order across runs
            entries.sort();

            for path in entries {
                match Device::open(&path) {
                    Ok(device) if Self::looks_like_joystick(&device) => {
                        info!("Found joystick {} at {}", device.name().unwrap_or("unnamed"), path.display());
                        joysticks.push(Self::from_device(device, path));
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Could not open {}: {}", path.display(), e),
                }
            }
        } else {
            for path in paths {
                match Self::open(path) {
                    Ok(joystick) => joysticks.push(joystick),
                    Err(e) => warn!("{}", e),
                }
            }
        }

        if joysticks.is_empty() {
            return Err(TswControllerError::DeviceNotFound);
        }
        Ok(joysticks)
    }

    #[must_use]
    pub fn device_path(&self) -> String {
        self.device_path.display().to_string()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.device.name().unwrap_or("Unnamed joystick")
    }

    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Describe the device, including its current input positions.
    pub fn info(&self) -> Result<DeviceInfo> {
        let mut initial_values = HashMap::new();

        let abs_state = self
            .device
            .get_abs_state()
            .map_err(|e| TswControllerError::Device(format!("Failed to read axes: {}", e)))?;
        for (code, index) in &self.index.axes {
            if let Some(info) = abs_state.get(usize::from(*code)) {
                initial_values.insert((ControlKind::Axis, *index), f64::from(info.value));
            }
        }
        for code in ABS_HAT_FIRST..=ABS_HAT_LAST {
            if let Some(info) = abs_state.get(usize::from(code)) {
                initial_values.insert((ControlKind::Hat, code - ABS_HAT_FIRST), f64::from(info.value));
            }
        }

        let key_state = self
            .device
            .get_key_state()
            .map_err(|e| TswControllerError::Device(format!("Failed to read buttons: {}", e)))?;
        for (code, index) in &self.index.buttons {
            let pressed = key_state.contains(Key::new(*code));
            initial_values.insert((ControlKind::Button, *index), if pressed { 1.0 } else { 0.0 });
        }

        Ok(DeviceInfo {
            guid: self.guid.clone(),
            usb_id: self.usb_id.clone(),
            name: self.name().to_string(),
            initial_values,
        })
    }

    /// Block until events arrive and translate them.
    ///
    /// # Errors
    ///
    /// Returns `Device` if reading fails (e.g. the device was unplugged).
    pub fn fetch_events(&mut self) -> Result<Vec<DeviceEvent>> {
        let timestamp = Utc::now();
        let guid = self.guid.clone();
        let events: Vec<InputEvent> = self
            .device
            .fetch_events()
            .map_err(|e| TswControllerError::Device(format!("Failed to fetch events: {}", e)))?
            .collect();

        Ok(events
            .iter()
            .filter_map(|event| self.index.translate(event))
            .map(|(kind, index, raw_value)| DeviceEvent {
                device: guid.clone(),
                kind,
                index,
                raw_value,
                timestamp,
            })
            .collect())
    }

    /// Read the device on a dedicated thread until it fails, the receiver
    /// goes away or `cancel` fires.
    ///
    /// The reader blocks inside evdev, so it runs on a plain OS thread rather
    /// than a runtime worker.
    pub fn spawn_reader(
        mut self,
        notifications: mpsc::Sender<DeviceNotification>,
        cancel: CancellationToken,
    ) -> Result<std::thread::JoinHandle<()>> {
        let info = self.info()?;
        std::thread::Builder::new()
            .name(format!("evdev-{}", self.device_path()))
            .spawn(move || {
                if notifications.blocking_send(DeviceNotification::Added(info)).is_err() {
                    return;
                }
                while !cancel.is_cancelled() {
                    match self.fetch_events() {
                        Ok(events) => {
                            for event in events {
                                if notifications.blocking_send(DeviceNotification::Input(event)).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("{} ({}): {}", self.name(), self.device_path(), e);
                            break;
                        }
                    }
                }
                let _ = notifications.blocking_send(DeviceNotification::Removed { guid: self.guid.clone() });
            })
            .map_err(TswControllerError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::EventType;

    fn index() -> InputIndex {
        InputIndex::new(
            [
                AbsoluteAxisType::ABS_RZ.0,
                AbsoluteAxisType::ABS_X.0,
                AbsoluteAxisType::ABS_HAT0X.0,
                AbsoluteAxisType::ABS_Y.0,
            ],
            [Key::BTN_THUMB.code(), Key::BTN_TRIGGER.code()],
        )
    }

    #[test]
    fn test_axes_numbered_in_code_order() {
        let index = index();
        let x = InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_X.0, 120);
        let rz = InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_RZ.0, 7);
        assert_eq!(index.translate(&x), Some((ControlKind::Axis, 0, 120.0)));
        assert_eq!(index.translate(&rz), Some((ControlKind::Axis, 2, 7.0)));
    }

    #[test]
    fn test_hat_axes() {
        let index = index();
        let hat_x = InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_HAT0X.0, -1);
        let hat_y = InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_HAT0Y.0, 1);
        assert_eq!(index.translate(&hat_x), Some((ControlKind::Hat, 0, -1.0)));
        assert_eq!(index.translate(&hat_y), Some((ControlKind::Hat, 1, 1.0)));
    }

    #[test]
    fn test_buttons() {
        let index = index();
        let press = InputEvent::new(EventType::KEY, Key::BTN_THUMB.code(), 1);
        let release = InputEvent::new(EventType::KEY, Key::BTN_TRIGGER.code(), 0);
        assert_eq!(index.translate(&press), Some((ControlKind::Button, 1, 1.0)));
        assert_eq!(index.translate(&release), Some((ControlKind::Button, 0, 0.0)));
    }

    #[test]
    fn test_autorepeat_and_sync_ignored() {
        let index = index();
        let repeat = InputEvent::new(EventType::KEY, Key::BTN_TRIGGER.code(), 2);
        let sync = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);
        assert!(index.translate(&repeat).is_none());
        assert!(index.translate(&sync).is_none());
    }

    #[test]
    fn test_unsupported_axis_ignored() {
        let index = index();
        let wheel = InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_WHEEL.0, 10);
        assert!(index.translate(&wheel).is_none());
    }

    // Integration test - only runs with real hardware
    #[test]
    #[ignore]
    fn test_discover_with_real_hardware() {
        let joysticks = EvdevJoystick::discover(&[]).expect("No joystick found");
        let info = joysticks[0].info().unwrap();
        assert!(info.usb_id.starts_with("0x"));
        assert!(!info.initial_values.is_empty());
    }
}
