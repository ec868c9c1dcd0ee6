//! # Control Mapping
//!
//! Binds physical `(kind, index)` inputs of a controller model to control
//! names. The same document shape is embedded in profiles to rename controls
//! for a single profile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{Result, TswControllerError};

/// Kind of physical input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Axis,
    Button,
    Hat,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlKind::Axis => write!(f, "axis"),
            ControlKind::Button => write!(f, "button"),
            ControlKind::Hat => write!(f, "hat"),
        }
    }
}

/// One mapped input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SdlMappingControl {
    pub kind: ControlKind,
    pub index: u16,
    pub name: String,
}

/// Mapping document for one controller model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SdlMapping {
    pub name: String,
    pub usb_id: String,
    pub data: Vec<SdlMappingControl>,
}

impl SdlMapping {
    /// Parse and validate a mapping document.
    pub fn from_json(json: &str) -> Result<Self> {
        let mapping: SdlMapping = serde_json::from_str(json)?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Names must be present and every `(kind, index)` pair unique.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.usb_id.is_empty() {
            return Err(TswControllerError::Calibration(
                "mapping name and usb_id cannot be empty".to_string(),
            ));
        }
        for (i, control) in self.data.iter().enumerate() {
            if control.name.is_empty() {
                return Err(TswControllerError::Calibration(format!(
                    "{}: control {} {} has no name",
                    self.name, control.kind, control.index
                )));
            }
            let duplicate = self.data[..i]
                .iter()
                .any(|c| c.kind == control.kind && c.index == control.index);
            if duplicate {
                return Err(TswControllerError::Calibration(format!(
                    "{}: {} {} is mapped twice",
                    self.name, control.kind, control.index
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn find_by_kind_and_index(&self, kind: ControlKind, index: u16) -> Option<&SdlMappingControl> {
        self.data.iter().find(|c| c.kind == kind && c.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"{
        "name": "TSW Joystick",
        "usb_id": "0x044f:0xb10a",
        "data": [
            { "kind": "axis", "index": 0, "name": "Throttle1" },
            { "kind": "button", "index": 0, "name": "Horn" },
            { "kind": "hat", "index": 0, "name": "Hat" }
        ]
    }"#;

    #[test]
    fn test_from_json() {
        let mapping = SdlMapping::from_json(MAPPING).unwrap();
        assert_eq!(mapping.name, "TSW Joystick");
        assert_eq!(mapping.data.len(), 3);
    }

    #[test]
    fn test_find_by_kind_and_index() {
        let mapping = SdlMapping::from_json(MAPPING).unwrap();
        let found = mapping.find_by_kind_and_index(ControlKind::Button, 0).unwrap();
        assert_eq!(found.name, "Horn");
        assert!(mapping.find_by_kind_and_index(ControlKind::Axis, 5).is_none());
    }

    #[test]
    fn test_duplicate_input_rejected() {
        let json = r#"{ "name": "x", "usb_id": "0x1:0x2", "data": [
            { "kind": "axis", "index": 1, "name": "A" },
            { "kind": "axis", "index": 1, "name": "B" }
        ] }"#;
        assert!(SdlMapping::from_json(json).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{ "name": "x", "usb_id": "0x1:0x2", "data": [ { "kind": "slider", "index": 1, "name": "A" } ] }"#;
        assert!(matches!(SdlMapping::from_json(json), Err(TswControllerError::Json(_))));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ControlKind::Axis.to_string(), "axis");
        assert_eq!(ControlKind::Hat.to_string(), "hat");
    }
}
