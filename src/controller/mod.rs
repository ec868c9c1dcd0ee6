//! # Controller Module
//!
//! Joystick input handling.
//!
//! This module handles:
//! - Joystick detection and reading via evdev
//! - Mapping physical inputs to named controls
//! - Calibration: range, idle deadzone, inversion and easing
//! - Per-control state with direction tracking

pub mod calibration;
pub mod easing;
pub mod evdev_source;
pub mod manager;
pub mod sdl_mapping;
pub mod state;
