//! # Control State
//!
//! Per-control raw and normalized values plus a direction-of-travel marker.
//!
//! The direction only flips once the normalized value has moved more than
//! [`DIRECTION_CHANGE_THRESHOLD`] away from the value at the last flip, so
//! sensor jitter does not toggle it.

use serde::Serialize;

use super::calibration::{round_decimals, ControlCalibration, NORMALIZED_DECIMALS};

/// Minimum travel before the direction marker changes.
pub const DIRECTION_CHANGE_THRESHOLD: f64 = 0.05;

/// Current, previous and initial values of one scale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ControlStateValues {
    pub value: f64,
    pub previous: f64,
    pub initial: f64,
}

impl ControlStateValues {
    fn reset(&mut self, value: f64) {
        *self = Self { value, previous: value, initial: value };
    }

    fn advance(&mut self, value: f64) {
        self.previous = self.value;
        self.value = value;
    }
}

/// Direction of travel and the normalized value where it last changed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DirectionMarker {
    /// -1, 0 or 1
    pub sign: i8,
    pub change_value: f64,
}

/// Full state of one control.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ControlState {
    pub raw: ControlStateValues,
    pub normalized: ControlStateValues,
    pub direction: DirectionMarker,
}

impl ControlState {
    /// State for a control resting at `raw`.
    #[must_use]
    pub fn at_rest(raw: f64, calibration: &ControlCalibration) -> Self {
        let mut state = Self::default();
        state.reset(raw, calibration);
        state
    }

    /// Force all values to the reading `raw` and clear the direction.
    pub fn reset(&mut self, raw: f64, calibration: &ControlCalibration) {
        self.raw.reset(raw);
        let normalized = calibration.normalize(raw);
        let value = if normalized.is_within_deadzone {
            0.0
        } else {
            round_decimals(normalized.value, NORMALIZED_DECIMALS)
        };
        self.normalized.reset(value);
        self.direction = DirectionMarker { sign: 0, change_value: value };
    }

    /// Apply a new raw reading.
    ///
    /// Readings inside the idle window leave the normalized values untouched.
    pub fn update(&mut self, raw: f64, calibration: &ControlCalibration) {
        self.raw.advance(raw);

        let normalized = calibration.normalize(raw);
        if !normalized.is_within_deadzone {
            self.normalized
                .advance(round_decimals(normalized.value, NORMALIZED_DECIMALS));
        }

        let diff = self.normalized.value - self.direction.change_value;
        if diff.abs() > DIRECTION_CHANGE_THRESHOLD {
            self.direction = DirectionMarker {
                sign: if diff > 0.0 { 1 } else { -1 },
                change_value: self.normalized.value,
            };
        }
    }
}
