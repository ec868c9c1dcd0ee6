//! # TSW Controller Library
//!
//! Drive a train simulator from a joystick.
//!
//! Raw device readings are calibrated into normalized control states,
//! matched against the assignments of the active profile and turned into
//! simulated key presses, direct control values, remote API writes or
//! closed-loop sync targets.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod output;
pub mod profile;
pub mod pubsub;
pub mod remote_api;
pub mod sequencer;
pub mod sync;
pub mod transport;
