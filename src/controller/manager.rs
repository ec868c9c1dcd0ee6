//! # Controller Manager
//!
//! Tracks connected devices and the state of every mapped control.
//!
//! A device becomes *configured* once both a control mapping and a
//! calibration exist for its usb id. Until then it is kept as *unconfigured*
//! and its input is only remembered so a later configuration can start from
//! the real stick positions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::calibration::{ControlCalibration, ControllerCalibration};
use super::sdl_mapping::{ControlKind, SdlMapping};
use super::state::ControlState;
use crate::error::{Result, TswControllerError};
use crate::pubsub::PubSub;

/// Stable identifier of a connected device.
pub type DeviceGuid = String;

/// Physical input address on a device.
pub type InputAddress = (ControlKind, u16);

/// A device as reported by the input layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub guid: DeviceGuid,
    /// `0xVENDOR:0xPRODUCT`
    pub usb_id: String,
    pub name: String,
    /// Positions read when the device was opened
    pub initial_values: HashMap<InputAddress, f64>,
}

/// One raw reading from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub device: DeviceGuid,
    pub kind: ControlKind,
    pub index: u16,
    pub raw_value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Everything the input layer reports.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceNotification {
    Added(DeviceInfo),
    Removed { guid: DeviceGuid },
    Input(DeviceEvent),
}

/// Emitted after a mapped control changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlChangeEvent {
    pub device: DeviceGuid,
    pub usb_id: String,
    pub control_name: String,
    pub kind: ControlKind,
    pub index: u16,
    pub state: ControlState,
    pub timestamp: DateTime<Utc>,
}

/// Read-only view of a device for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub guid: DeviceGuid,
    pub usb_id: String,
    pub name: String,
    pub configured: bool,
    pub controls: Vec<(String, ControlState)>,
}

#[derive(Debug, Clone)]
struct ConfiguredControl {
    name: String,
    kind: ControlKind,
    index: u16,
    calibration: ControlCalibration,
    state: ControlState,
}

#[derive(Debug, Clone)]
struct ConfiguredDevice {
    info: DeviceInfo,
    controls: Vec<ConfiguredControl>,
}

/// Calibration for a mapped control that has no calibration entry.
fn default_calibration(name: &str, kind: ControlKind) -> ControlCalibration {
    match kind {
        ControlKind::Hat => ControlCalibration::new(name, -1.0, 1.0).with_idle(0.0),
        ControlKind::Axis | ControlKind::Button => ControlCalibration::uncalibrated(name),
    }
}

/// Device registry and control state tracker.
#[derive(Debug, Default)]
pub struct ControllerManager {
    sdl_mappings: HashMap<String, SdlMapping>,
    calibrations: HashMap<String, ControllerCalibration>,
    configured: HashMap<DeviceGuid, ConfiguredDevice>,
    unconfigured: HashMap<DeviceGuid, DeviceInfo>,
    last_raw: HashMap<DeviceGuid, HashMap<InputAddress, f64>>,
}

impl ControllerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(&self, info: DeviceInfo, mapping: &SdlMapping, calibration: &ControllerCalibration) -> ConfiguredDevice {
        let last_raw = self.last_raw.get(&info.guid);
        let controls = mapping
            .data
            .iter()
            .map(|control| {
                let calibration = calibration
                    .find(&control.name)
                    .cloned()
                    .unwrap_or_else(|| default_calibration(&control.name, control.kind));
                let address = (control.kind, control.index);
                let raw = last_raw
                    .and_then(|values| values.get(&address))
                    .or_else(|| info.initial_values.get(&address))
                    .copied()
                    .unwrap_or_else(|| calibration.idle());
                ConfiguredControl {
                    name: control.name.clone(),
                    kind: control.kind,
                    index: control.index,
                    state: ControlState::at_rest(raw, &calibration),
                    calibration,
                }
            })
            .collect();

        ConfiguredDevice { info, controls }
    }

    /// Store a mapping and calibration pair and (re)configure every matching device.
    ///
    /// # Returns
    ///
    /// The guids of devices that were configured or reconfigured.
    ///
    /// # Errors
    ///
    /// Returns `Calibration` when the two documents describe different usb ids
    /// or either fails validation.
    pub fn register_calibration(&mut self, mapping: SdlMapping, calibration: ControllerCalibration) -> Result<Vec<DeviceGuid>> {
        mapping.validate()?;
        calibration.validate()?;
        if mapping.usb_id != calibration.usb_id {
            return Err(TswControllerError::Calibration(format!(
                "mapping usb_id {} does not match calibration usb_id {}",
                mapping.usb_id, calibration.usb_id
            )));
        }

        let usb_id = mapping.usb_id.clone();
        let mut affected = Vec::new();

        let pending: Vec<DeviceGuid> = self
            .unconfigured
            .iter()
            .filter(|(_, info)| info.usb_id == usb_id)
            .map(|(guid, _)| guid.clone())
            .collect();
        for guid in pending {
            if let Some(info) = self.unconfigured.remove(&guid) {
                let device = self.configure(info, &mapping, &calibration);
                self.configured.insert(guid.clone(), device);
                affected.push(guid);
            }
        }

        let existing: Vec<DeviceGuid> = self
            .configured
            .iter()
            .filter(|(guid, device)| device.info.usb_id == usb_id && !affected.contains(guid))
            .map(|(guid, _)| guid.clone())
            .collect();
        for guid in existing {
            if let Some(previous) = self.configured.remove(&guid) {
                let device = self.configure(previous.info, &mapping, &calibration);
                self.configured.insert(guid.clone(), device);
                affected.push(guid);
            }
        }

        self.sdl_mappings.insert(usb_id.clone(), mapping);
        self.calibrations.insert(usb_id, calibration);

        for guid in &affected {
            info!("Configured device {}", guid);
        }
        Ok(affected)
    }

    /// Register a newly connected device.
    ///
    /// # Returns
    ///
    /// `true` when the device could be configured immediately.
    pub fn device_added(&mut self, info: DeviceInfo) -> bool {
        let guid = info.guid.clone();
        self.last_raw
            .insert(guid.clone(), info.initial_values.clone());

        let mapping = self.sdl_mappings.get(&info.usb_id);
        let calibration = self.calibrations.get(&info.usb_id);
        match (mapping, calibration) {
            (Some(mapping), Some(calibration)) => {
                info!("Device {} ({}) connected and configured", info.name, info.usb_id);
                let device = self.configure(info, mapping, calibration);
                self.configured.insert(guid, device);
                true
            }
            _ => {
                info!("Device {} ({}) connected without mapping or calibration", info.name, info.usb_id);
                self.unconfigured.insert(guid, info);
                false
            }
        }
    }

    /// Forget a disconnected device. Returns `true` if it was known.
    pub fn device_removed(&mut self, guid: &str) -> bool {
        self.last_raw.remove(guid);
        let removed = self.configured.remove(guid).is_some() | self.unconfigured.remove(guid).is_some();
        if removed {
            info!("Device {} disconnected", guid);
        }
        removed
    }

    /// Apply a raw reading.
    ///
    /// # Returns
    ///
    /// A change event when the reading belongs to a mapped control of a
    /// configured device.
    pub fn handle_input(&mut self, event: &DeviceEvent) -> Option<ControlChangeEvent> {
        if let Some(values) = self.last_raw.get_mut(&event.device) {
            values.insert((event.kind, event.index), event.raw_value);
        }

        let device = self.configured.get_mut(&event.device)?;
        let control = device
            .controls
            .iter_mut()
            .find(|c| c.kind == event.kind && c.index == event.index)?;

        control.state.update(event.raw_value, &control.calibration);
        debug!(
            "{} {} -> {:.4} (raw {})",
            device.info.name, control.name, control.state.normalized.value, event.raw_value
        );

        Some(ControlChangeEvent {
            device: event.device.clone(),
            usb_id: device.info.usb_id.clone(),
            control_name: control.name.clone(),
            kind: control.kind,
            index: control.index,
            state: control.state,
            timestamp: event.timestamp,
        })
    }

    /// Current normalized value of every control on a device.
    #[must_use]
    pub fn control_values(&self, guid: &str) -> HashMap<String, f64> {
        self.configured
            .get(guid)
            .map(|device| {
                device
                    .controls
                    .iter()
                    .map(|c| (c.name.clone(), c.state.normalized.value))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_configured(&self, guid: &str) -> bool {
        self.configured.contains_key(guid)
    }

    /// Usb id of a known device.
    #[must_use]
    pub fn usb_id(&self, guid: &str) -> Option<&str> {
        self.configured
            .get(guid)
            .map(|d| d.info.usb_id.as_str())
            .or_else(|| self.unconfigured.get(guid).map(|i| i.usb_id.as_str()))
    }

    /// Snapshot of all devices, sorted by guid.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let configured = self.configured.values().map(|device| DeviceSnapshot {
            guid: device.info.guid.clone(),
            usb_id: device.info.usb_id.clone(),
            name: device.info.name.clone(),
            configured: true,
            controls: device
                .controls
                .iter()
                .map(|c| (c.name.clone(), c.state))
                .collect(),
        });
        let unconfigured = self.unconfigured.values().map(|info| DeviceSnapshot {
            guid: info.guid.clone(),
            usb_id: info.usb_id.clone(),
            name: info.name.clone(),
            configured: false,
            controls: Vec::new(),
        });

        let mut devices: Vec<DeviceSnapshot> = configured.chain(unconfigured).collect();
        devices.sort_by(|a, b| a.guid.cmp(&b.guid));
        devices
    }
}

/// Shared controller manager plus change-event fan-out.
#[derive(Clone)]
pub struct ControllerService {
    manager: Arc<RwLock<ControllerManager>>,
    changes: Arc<PubSub<ControlChangeEvent>>,
}

impl ControllerService {
    #[must_use]
    pub fn new(subscriber_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            manager: Arc::new(RwLock::new(ControllerManager::new())),
            changes: Arc::new(PubSub::new(subscriber_capacity, send_timeout)),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ControlChangeEvent> {
        self.changes.subscribe()
    }

    pub async fn register_calibration(&self, mapping: SdlMapping, calibration: ControllerCalibration) -> Result<Vec<DeviceGuid>> {
        self.manager.write().await.register_calibration(mapping, calibration)
    }

    pub async fn control_values(&self, guid: &str) -> HashMap<String, f64> {
        self.manager.read().await.control_values(guid)
    }

    pub async fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.manager.read().await.snapshot()
    }

    /// Apply one notification and publish the resulting change, if any.
    pub async fn handle_notification(&self, notification: DeviceNotification) {
        let change = {
            let mut manager = self.manager.write().await;
            match notification {
                DeviceNotification::Added(info) => {
                    manager.device_added(info);
                    None
                }
                DeviceNotification::Removed { guid } => {
                    if !manager.device_removed(&guid) {
                        warn!("Removal of unknown device {}", guid);
                    }
                    None
                }
                DeviceNotification::Input(event) => manager.handle_input(&event),
            }
        };

        if let Some(change) = change {
            self.changes.emit(change).await;
        }
    }

    /// Consume device notifications until cancelled or the source closes.
    pub async fn run(self, mut notifications: mpsc::Receiver<DeviceNotification>, cancel: CancellationToken) {
        info!("Controller service started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => self.handle_notification(notification).await,
                    None => {
                        info!("Device notification source closed");
                        break;
                    }
                },
            }
        }
        info!("Controller service stopped");
    }
}
