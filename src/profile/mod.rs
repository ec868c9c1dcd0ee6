//! # Profiles
//!
//! Profile documents and everything that turns a control state into output
//! effects under a profile.
//!
//! ## Architecture
//!
//! ```text
//! ControlChangeEvent ─> runner ─> resolver ─> evaluator ─> effects
//!                         │                                  │
//!                         └──── sync feedback <── sync ──────┘
//! ```

pub mod evaluator;
pub mod input_value;
pub mod model;
pub mod resolver;
pub mod runner;

pub use evaluator::{AssignmentEvaluator, Effect};
pub use model::{Assignment, Profile};
pub use resolver::{resolve, ConditionContext};
pub use runner::{EngineSettings, OutputSinks, ProfileRunner};
