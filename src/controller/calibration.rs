//! # Calibration Module
//!
//! Maps raw device readings to normalized control values in `[-1, 1]`.
//!
//! ## Idle Window
//!
//! Every control has an idle (rest) position and an optional deadzone around
//! it. Readings inside `[idle - deadzone, idle + deadzone]` normalize to `0.0`
//! and are flagged as within the deadzone.
//!
//! ## Ranges
//!
//! Outside the window the reading is expressed as the fractional distance from
//! the nearest window edge toward `min` (negative result) or `max` (positive
//! result), clamped to `[0, 1]` and passed through the control's easing curve.
//!
//! ## Usage
//!
//! ```
//! use tsw_controller::controller::calibration::ControlCalibration;
//!
//! let cal = ControlCalibration::new("throttle", 0.0, 100.0).with_idle(50.0).with_deadzone(5.0);
//!
//! // Resting stick
//! assert!(cal.normalize(52.0).is_within_deadzone);
//!
//! // Full deflection either way
//! assert_eq!(cal.normalize(100.0).value, 1.0);
//! assert_eq!(cal.normalize(0.0).value, -1.0);
//! ```

use serde::Deserialize;
use std::fs;
use std::path::Path;

use super::easing::CubicBezier;
use crate::error::{Result, TswControllerError};

/// Number of decimals kept for normalized values.
pub const NORMALIZED_DECIMALS: i32 = 4;

/// Round to `decimals` decimal places.
#[must_use]
pub fn round_decimals(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Result of normalizing a raw reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedValue {
    /// Normalized value in `[-1, 1]`
    pub value: f64,
    /// True when the reading fell inside the idle window
    pub is_within_deadzone: bool,
}

/// Calibration of a single named control.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlCalibration {
    /// Control name as defined by the SDL mapping
    pub id: String,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub idle: Option<f64>,
    #[serde(default)]
    pub deadzone: Option<f64>,
    #[serde(default)]
    pub invert: Option<bool>,
    /// Cubic-bezier control points `x1, y1, x2, y2`
    #[serde(default)]
    pub easing_curve: Option<Vec<f64>>,
}

impl ControlCalibration {
    #[must_use]
    pub fn new(id: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            id: id.into(),
            min,
            max,
            idle: None,
            deadzone: None,
            invert: None,
            easing_curve: None,
        }
    }

    /// Calibration used for controls that have no entry: `[0, 1]`, idle at 0.
    #[must_use]
    pub fn uncalibrated(id: impl Into<String>) -> Self {
        Self::new(id, 0.0, 1.0)
    }

    #[must_use]
    pub fn with_idle(mut self, idle: f64) -> Self {
        self.idle = Some(idle);
        self
    }

    #[must_use]
    pub fn with_deadzone(mut self, deadzone: f64) -> Self {
        self.deadzone = Some(deadzone);
        self
    }

    #[must_use]
    pub fn with_invert(mut self, invert: bool) -> Self {
        self.invert = Some(invert);
        self
    }

    #[must_use]
    pub fn with_easing_curve(mut self, curve: [f64; 4]) -> Self {
        self.easing_curve = Some(curve.to_vec());
        self
    }

    /// Idle position, defaulting to `min`.
    #[must_use]
    pub fn idle(&self) -> f64 {
        self.idle.unwrap_or(self.min)
    }

    #[must_use]
    pub fn deadzone(&self) -> f64 {
        self.deadzone.unwrap_or(0.0)
    }

    #[must_use]
    pub fn is_inverted(&self) -> bool {
        self.invert.unwrap_or(false)
    }

    /// Check the calibration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `Calibration` error when the range, idle position, deadzone or
    /// easing curve is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TswControllerError::Calibration("control id cannot be empty".to_string()));
        }
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(TswControllerError::Calibration(format!(
                "{}: min ({}) must not exceed max ({})",
                self.id, self.min, self.max
            )));
        }
        if let Some(idle) = self.idle {
            if idle < self.min || idle > self.max {
                return Err(TswControllerError::Calibration(format!(
                    "{}: idle ({}) must be within [{}, {}]",
                    self.id, idle, self.min, self.max
                )));
            }
        }
        if self.deadzone() < 0.0 {
            return Err(TswControllerError::Calibration(format!(
                "{}: deadzone cannot be negative",
                self.id
            )));
        }
        if let Some(curve) = &self.easing_curve {
            if curve.len() != 4 {
                return Err(TswControllerError::Calibration(format!(
                    "{}: easing_curve must have exactly 4 numbers, got {}",
                    self.id,
                    curve.len()
                )));
            }
        }
        Ok(())
    }

    /// Normalize a raw reading.
    ///
    /// # Arguments
    ///
    /// * `raw` - Raw device value
    ///
    /// # Returns
    ///
    /// The normalized value in `[-1, 1]` and whether the reading was inside
    /// the idle window.
    #[must_use]
    pub fn normalize(&self, raw: f64) -> NormalizedValue {
        let idle = self.idle();
        let deadzone = self.deadzone();
        let (low_edge, high_edge) = (idle - deadzone, idle + deadzone);

        let value = if self.is_inverted() { -raw } else { raw };

        if value >= low_edge && value <= high_edge {
            return NormalizedValue { value: 0.0, is_within_deadzone: true };
        }

        let curve = CubicBezier::from_points(self.easing_curve.as_deref());

        if value < low_edge && self.min != low_edge {
            let fraction = ((value - low_edge) / (self.min - low_edge)).clamp(0.0, 1.0);
            return NormalizedValue { value: -curve.ease(fraction), is_within_deadzone: false };
        }

        let span = self.max - high_edge;
        let fraction = if span == 0.0 {
            if value > high_edge { 1.0 } else { 0.0 }
        } else {
            ((value - high_edge) / span).clamp(0.0, 1.0)
        };
        NormalizedValue { value: curve.ease(fraction), is_within_deadzone: false }
    }
}

/// Calibration document for one controller model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerCalibration {
    /// `{0xVENDOR}:{0xPRODUCT}` identifier
    pub usb_id: String,
    pub data: Vec<ControlCalibration>,
}

impl ControllerCalibration {
    /// Parse and validate a calibration document.
    ///
    /// # Errors
    ///
    /// Returns `Json` on malformed input or `Calibration` when validation fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let calibration: ControllerCalibration = serde_json::from_str(json)?;
        calibration.validate()?;
        Ok(calibration)
    }

    /// Load a calibration document from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.usb_id.is_empty() {
            return Err(TswControllerError::Calibration("usb_id cannot be empty".to_string()));
        }
        self.data.iter().try_for_each(ControlCalibration::validate)
    }

    /// Calibration entry for a control name.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&ControlCalibration> {
        self.data.iter().find(|c| c.id == id)
    }
}
