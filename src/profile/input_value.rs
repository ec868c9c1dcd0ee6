//! # Output Value Quantization
//!
//! Converts a normalized control value into the value sent to the simulator
//! for direct, sync and API assignments.
//!
//! The normalized value is scaled onto `[min, max]` and then optionally
//! snapped to a step ladder. A `null` entry in `steps` opens a *free-range
//! zone* between its neighbouring steps (or up to `max` when trailing) where
//! the value passes through unsnapped.
//!
//! ```
//! use tsw_controller::profile::input_value::InputValue;
//!
//! let reverser = InputValue::stepped(0.0, 1.0, vec![Some(0.0), Some(0.5), None, Some(1.0)]);
//! assert_eq!(reverser.calculate_output_value(0.2), 0.0);
//! assert_eq!(reverser.calculate_output_value(0.7), 0.7);
//! ```

use serde::Deserialize;

use crate::error::{Result, TswControllerError};

/// Smallest uniform `step`; finer ladders do not change the output.
pub const MIN_STEP: f64 = 0.0001;

/// Most rungs a uniform `step` may generate between `min` and `max`.
pub const MAX_GENERATED_STEPS: usize = 100_000;

/// A span of output values that bypasses step snapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreeRangeZone {
    pub start: f64,
    pub end: f64,
}

impl FreeRangeZone {
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.start && value <= self.end
    }
}

/// Output range and quantization of a value-producing assignment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InputValue {
    pub min: f64,
    pub max: f64,
    /// Uniform step used when `steps` is absent
    #[serde(default)]
    pub step: Option<f64>,
    /// Explicit steps; `null` marks a free-range gap
    #[serde(default)]
    pub steps: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub invert: Option<bool>,
}

fn clamp_between(value: f64, a: f64, b: f64) -> f64 {
    value.clamp(a.min(b), a.max(b))
}

impl InputValue {
    /// Continuous output over `[min, max]`.
    #[must_use]
    pub fn range(min: f64, max: f64) -> Self {
        Self { min, max, step: None, steps: None, invert: None }
    }

    #[must_use]
    pub fn stepped(min: f64, max: f64, steps: Vec<Option<f64>>) -> Self {
        Self { steps: Some(steps), ..Self::range(min, max) }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(TswControllerError::Profile("input_value min and max must be finite".to_string()));
        }
        if let Some(step) = self.step {
            if !step.is_finite() || step < MIN_STEP {
                return Err(TswControllerError::Profile(format!(
                    "input_value step must be at least {}, got {}",
                    MIN_STEP, step
                )));
            }
            if (self.max - self.min).abs() / step > MAX_GENERATED_STEPS as f64 {
                return Err(TswControllerError::Profile(format!(
                    "input_value step {} generates more than {} steps",
                    step, MAX_GENERATED_STEPS
                )));
            }
        }
        if let Some(steps) = &self.steps {
            if steps.iter().all(Option::is_none) {
                return Err(TswControllerError::Profile(
                    "input_value steps must contain at least one number".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn is_inverted(&self) -> bool {
        self.invert.unwrap_or(false)
    }

    /// Free-range zones described by `null` entries in `steps`.
    #[must_use]
    pub fn free_range_zones(&self) -> Vec<FreeRangeZone> {
        let Some(steps) = &self.steps else {
            return Vec::new();
        };

        let mut zones = Vec::new();
        let mut previous = self.min;
        let mut in_gap = false;
        for step in steps {
            match step {
                None => in_gap = true,
                Some(value) => {
                    if in_gap {
                        zones.push(FreeRangeZone { start: previous, end: *value });
                    }
                    in_gap = false;
                    previous = *value;
                }
            }
        }
        if in_gap {
            zones.push(FreeRangeZone { start: previous, end: self.max });
        }
        zones
    }

    /// The real (non-null) steps, if explicit steps are configured.
    #[must_use]
    pub fn normal_steps(&self) -> Option<Vec<f64>> {
        self.steps
            .as_ref()
            .map(|steps| steps.iter().flatten().copied().collect())
    }

    /// Uniform ladder `min, min + step, ..., max`.
    ///
    /// Closes with `max` as soon as the ladder stops rising or holds
    /// `MAX_GENERATED_STEPS` rungs, so `min > max` yields `[min, max]`.
    fn generated_steps(&self) -> Option<Vec<f64>> {
        let step = self.step.filter(|s| *s > 0.0)?;
        let mut ladder = Vec::new();
        let mut current = self.min;
        loop {
            ladder.push(current);
            let next = (current + step).min(self.max);
            if next >= self.max || next <= current || ladder.len() >= MAX_GENERATED_STEPS {
                ladder.push(self.max);
                break;
            }
            current = next;
        }
        Some(ladder)
    }

    /// Map a normalized value in `[-1, 1]` to the output value.
    ///
    /// # Arguments
    ///
    /// * `value` - Normalized control value
    ///
    /// # Returns
    ///
    /// The scaled value, clamped to the output range, snapped to the closest
    /// step unless it falls inside a free-range zone. Equidistant values snap
    /// to the lower step.
    #[must_use]
    pub fn calculate_output_value(&self, value: f64) -> f64 {
        let value = if self.is_inverted() {
            if value < 0.0 { -1.0 - value } else { 1.0 - value }
        } else {
            value
        };

        let scaled = value * (self.max - self.min).abs() + self.min;

        let steps = match self.normal_steps().or_else(|| self.generated_steps()) {
            Some(steps) if !steps.is_empty() => steps,
            _ => return clamp_between(scaled, self.min, self.max),
        };

        if self.free_range_zones().iter().any(|zone| zone.contains(scaled)) {
            return clamp_between(scaled, self.min, self.max);
        }

        let mut closest = steps[0];
        for step in &steps[1..] {
            let distance = (scaled - step).abs();
            let best = (scaled - closest).abs();
            if distance < best || (distance == best && *step < closest) {
                closest = *step;
            }
        }
        closest
    }
}
