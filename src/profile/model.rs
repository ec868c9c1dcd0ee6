//! # Profile Model
//!
//! Serde model of a controller profile: named controls, each bound to one or
//! more assignments which decide what a control movement does.
//!
//! ## Document shape
//!
//! ```json
//! {
//!   "name": "BR 146",
//!   "auto_select": true,
//!   "controller": { "usb_id": "0x044f:0xb10a" },
//!   "controls": [
//!     { "name": "Horn", "assignment": {
//!         "type": "momentary", "threshold": 0.5,
//!         "action_activate": { "keys": "space" } } }
//!   ]
//! }
//! ```
//!
//! Assignments are tagged by `type`. Actions are untagged and recognised by
//! their fields: `api_value` marks an API action, `controls` a direct action,
//! anything else must carry `keys`.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fs;
use std::path::Path;

use super::input_value::InputValue;
use crate::controller::calibration::{round_decimals, NORMALIZED_DECIMALS};
use crate::controller::sdl_mapping::SdlMapping;
use crate::error::{Result, TswControllerError};

fn invalid(message: String) -> TswControllerError {
    TswControllerError::Profile(message)
}

// ============================================================================
// Actions
// ============================================================================

/// Simulated key combo such as `ctrl+shift+a`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KeysAction {
    pub keys: String,
    /// Hold time in seconds before automatic release
    #[serde(default)]
    pub press_time: Option<f64>,
    /// Pause in seconds after the combo
    #[serde(default)]
    pub wait_time: Option<f64>,
}

impl KeysAction {
    #[must_use]
    pub fn new(keys: impl Into<String>) -> Self {
        Self { keys: keys.into(), press_time: None, wait_time: None }
    }

    fn validate(&self) -> Result<()> {
        if self.keys.trim().is_empty() {
            return Err(invalid("keys action cannot be empty".to_string()));
        }
        let negative = |t: Option<f64>| t.map_or(false, |t| t < 0.0 || !t.is_finite());
        if negative(self.press_time) || negative(self.wait_time) {
            return Err(invalid(format!("{}: press_time and wait_time must be >= 0", self.keys)));
        }
        Ok(())
    }
}

/// One-shot value sent straight to a simulator control.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DirectControlAction {
    pub controls: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub relative: Option<bool>,
    #[serde(default)]
    pub hold: Option<bool>,
    #[serde(default)]
    pub use_normalized: Option<bool>,
}

/// One-shot value written through the remote API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiControlAction {
    pub controls: String,
    pub api_value: f64,
}

/// Action fired by momentary, linear and toggle assignments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Api(ApiControlAction),
    Direct(DirectControlAction),
    Keys(KeysAction),
}

impl Action {
    #[must_use]
    pub fn keys(keys: impl Into<String>) -> Self {
        Action::Keys(KeysAction::new(keys))
    }

    #[must_use]
    pub fn is_keys(&self) -> bool {
        matches!(self, Action::Keys(_))
    }

    fn validate(&self) -> Result<()> {
        match self {
            Action::Keys(keys) => keys.validate(),
            Action::Direct(DirectControlAction { controls, .. })
            | Action::Api(ApiControlAction { controls, .. }) => {
                if controls.is_empty() {
                    return Err(invalid("action controls cannot be empty".to_string()));
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Conditions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Gte,
    Lte,
    Gt,
    Lt,
}

impl ConditionOperator {
    #[must_use]
    pub fn compare(self, lhs: f64, rhs: f64) -> bool {
        match self {
            ConditionOperator::Gte => lhs >= rhs,
            ConditionOperator::Lte => lhs <= rhs,
            ConditionOperator::Gt => lhs > rhs,
            ConditionOperator::Lt => lhs < rhs,
        }
    }
}

/// What a condition reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperand<'a> {
    /// Another control on the same device
    Control(&'a str),
    /// A simulator-side variable
    CabVariable(&'a str),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub control: Option<String>,
    #[serde(default)]
    pub cab_variable: Option<String>,
    pub operator: ConditionOperator,
    pub value: f64,
}

impl Condition {
    /// The operand, or `None` when the condition names zero or two sources.
    #[must_use]
    pub fn operand(&self) -> Option<ConditionOperand<'_>> {
        match (&self.control, &self.cab_variable) {
            (Some(control), None) => Some(ConditionOperand::Control(control)),
            (None, Some(variable)) => Some(ConditionOperand::CabVariable(variable)),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        match self.operand() {
            Some(ConditionOperand::Control(name)) | Some(ConditionOperand::CabVariable(name))
                if !name.is_empty() =>
            {
                Ok(())
            }
            _ => Err(invalid(
                "condition needs exactly one of control or cab_variable".to_string(),
            )),
        }
    }
}

// ============================================================================
// Assignments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MomentaryAssignment {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub threshold: f64,
    pub action_activate: Action,
    #[serde(default)]
    pub action_deactivate: Option<Action>,
}

/// Smallest `value_step` that still advances at four-decimal rounding.
pub const MIN_THRESHOLD_STEP: f64 = 0.0001;

/// Most thresholds a single ranged rung may expand into.
pub const MAX_GENERATED_THRESHOLDS: usize = 100_000;

/// One rung of a linear ladder. With `value_end` and `value_step` the rung
/// expands into a run of thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearThreshold {
    pub value: f64,
    #[serde(default)]
    pub value_end: Option<f64>,
    #[serde(default)]
    pub value_step: Option<f64>,
    pub action_activate: Action,
    #[serde(default)]
    pub action_deactivate: Option<Action>,
}

impl LinearThreshold {
    /// Negative thresholds are crossed from above, others from below.
    #[must_use]
    pub fn is_exceeded_by(&self, value: f64) -> bool {
        if self.value < 0.0 {
            value < self.value
        } else {
            value >= self.value
        }
    }

    #[must_use]
    pub fn is_ranged(&self) -> bool {
        self.value_end.is_some() && self.value_step.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearAssignment {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub neutral: Option<f64>,
    pub thresholds: Vec<LinearThreshold>,
}

impl LinearAssignment {
    /// Expand ranged thresholds, keeping configured order.
    ///
    /// A range runs from `value` while below `value_end`, every value rounded
    /// to four decimals. A range stops early once rounding no longer moves it
    /// or after `MAX_GENERATED_THRESHOLDS` entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsw_controller::profile::model::{Action, LinearAssignment, LinearThreshold};
    ///
    /// let linear = LinearAssignment {
    ///     conditions: vec![],
    ///     neutral: None,
    ///     thresholds: vec![LinearThreshold {
    ///         value: 0.3,
    ///         value_end: Some(0.4),
    ///         value_step: Some(0.03),
    ///         action_activate: Action::keys("a"),
    ///         action_deactivate: None,
    ///     }],
    /// };
    /// let values: Vec<f64> = linear.generate_thresholds().iter().map(|t| t.value).collect();
    /// assert_eq!(values, vec![0.3, 0.33, 0.36, 0.39]);
    /// ```
    #[must_use]
    pub fn generate_thresholds(&self) -> Vec<LinearThreshold> {
        let mut expanded = Vec::new();
        for threshold in &self.thresholds {
            match (threshold.value_end, threshold.value_step) {
                (Some(end), Some(step)) if step > 0.0 => {
                    let mut value = round_decimals(threshold.value, NORMALIZED_DECIMALS);
                    let mut generated = 0;
                    while value < end && generated < MAX_GENERATED_THRESHOLDS {
                        expanded.push(LinearThreshold {
                            value,
                            value_end: None,
                            value_step: None,
                            ..threshold.clone()
                        });
                        generated += 1;
                        let next = round_decimals(value + step, NORMALIZED_DECIMALS);
                        if next <= value {
                            break;
                        }
                        value = next;
                    }
                }
                _ => expanded.push(threshold.clone()),
            }
        }
        expanded
    }

    /// Thresholds to evaluate: borrowed when nothing needs expanding.
    #[must_use]
    pub fn expanded_thresholds(&self) -> Cow<'_, [LinearThreshold]> {
        if self.thresholds.iter().any(LinearThreshold::is_ranged) {
            Cow::Owned(self.generate_thresholds())
        } else {
            Cow::Borrowed(&self.thresholds)
        }
    }

    /// Shift a value so the configured neutral position reads as zero.
    #[must_use]
    pub fn neutralized(&self, value: f64) -> f64 {
        match self.neutral {
            Some(neutral) if neutral > 0.0 => (value - neutral) / neutral,
            _ => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToggleAssignment {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub threshold: f64,
    pub action_activate: Action,
    pub action_deactivate: Action,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DirectControlAssignment {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub controls: String,
    #[serde(default)]
    pub hold: Option<bool>,
    #[serde(default)]
    pub use_normalized: Option<bool>,
    pub input_value: InputValue,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncControlAssignment {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub identifier: String,
    pub input_value: InputValue,
    pub action_increase: KeysAction,
    pub action_decrease: KeysAction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiControlAssignment {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub controls: String,
    pub input_value: InputValue,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assignment {
    Momentary(MomentaryAssignment),
    Linear(LinearAssignment),
    Toggle(ToggleAssignment),
    DirectControl(DirectControlAssignment),
    SyncControl(SyncControlAssignment),
    ApiControl(ApiControlAssignment),
}

impl Assignment {
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        match self {
            Assignment::Momentary(a) => &a.conditions,
            Assignment::Linear(a) => &a.conditions,
            Assignment::Toggle(a) => &a.conditions,
            Assignment::DirectControl(a) => &a.conditions,
            Assignment::SyncControl(a) => &a.conditions,
            Assignment::ApiControl(a) => &a.conditions,
        }
    }

    /// Short type name used in log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Assignment::Momentary(_) => "momentary",
            Assignment::Linear(_) => "linear",
            Assignment::Toggle(_) => "toggle",
            Assignment::DirectControl(_) => "direct_control",
            Assignment::SyncControl(_) => "sync_control",
            Assignment::ApiControl(_) => "api_control",
        }
    }

    fn validate(&self) -> Result<()> {
        for condition in self.conditions() {
            condition.validate()?;
        }
        match self {
            Assignment::Momentary(a) => {
                a.action_activate.validate()?;
                a.action_deactivate.as_ref().map_or(Ok(()), Action::validate)
            }
            Assignment::Linear(a) => {
                if a.thresholds.is_empty() {
                    return Err(invalid("linear assignment needs at least one threshold".to_string()));
                }
                for threshold in &a.thresholds {
                    if let Some(step) = threshold.value_step {
                        if !step.is_finite() || step < MIN_THRESHOLD_STEP {
                            return Err(invalid(format!(
                                "linear threshold {}: value_step must be at least {}, got {}",
                                threshold.value, MIN_THRESHOLD_STEP, step
                            )));
                        }
                        if let Some(end) = threshold.value_end {
                            if !end.is_finite() || end <= threshold.value {
                                return Err(invalid(format!(
                                    "linear threshold {}: value_end must be greater than value",
                                    threshold.value
                                )));
                            }
                            if (end - threshold.value) / step > MAX_GENERATED_THRESHOLDS as f64 {
                                return Err(invalid(format!(
                                    "linear threshold {}: range expands to more than {} thresholds",
                                    threshold.value, MAX_GENERATED_THRESHOLDS
                                )));
                            }
                        }
                    }
                    threshold.action_activate.validate()?;
                    if let Some(action) = &threshold.action_deactivate {
                        action.validate()?;
                    }
                }
                Ok(())
            }
            Assignment::Toggle(a) => {
                a.action_activate.validate()?;
                a.action_deactivate.validate()
            }
            Assignment::DirectControl(a) => {
                if a.controls.is_empty() {
                    return Err(invalid("direct_control assignment needs controls".to_string()));
                }
                a.input_value.validate()
            }
            Assignment::SyncControl(a) => {
                if a.identifier.is_empty() {
                    return Err(invalid("sync_control assignment needs an identifier".to_string()));
                }
                a.action_increase.validate()?;
                a.action_decrease.validate()?;
                a.input_value.validate()
            }
            Assignment::ApiControl(a) => {
                if a.controls.is_empty() {
                    return Err(invalid("api_control assignment needs controls".to_string()));
                }
                a.input_value.validate()
            }
        }
    }
}

// ============================================================================
// Controls and profile
// ============================================================================

#[derive(Deserialize)]
struct ControlRepr {
    name: String,
    #[serde(default)]
    assignment: Option<Assignment>,
    #[serde(default)]
    assignments: Option<Vec<Assignment>>,
}

/// A named control and its ordered assignments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ControlRepr")]
pub struct Control {
    pub name: String,
    pub assignments: Vec<Assignment>,
}

impl TryFrom<ControlRepr> for Control {
    type Error = String;

    fn try_from(repr: ControlRepr) -> std::result::Result<Self, Self::Error> {
        let assignments = match (repr.assignment, repr.assignments) {
            (Some(single), None) => vec![single],
            (None, Some(list)) => list,
            (Some(_), Some(_)) => {
                return Err(format!("control {}: use either assignment or assignments, not both", repr.name))
            }
            (None, None) => return Err(format!("control {}: missing assignment", repr.name)),
        };
        Ok(Control { name: repr.name, assignments })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProfileController {
    #[serde(default)]
    pub usb_id: Option<String>,
    #[serde(default)]
    pub mapping: Option<SdlMapping>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Profile {
    #[serde(skip)]
    id: String,
    pub name: String,
    #[serde(default)]
    pub auto_select: Option<bool>,
    #[serde(default)]
    pub controller: Option<ProfileController>,
    pub controls: Vec<Control>,
}

/// Stable profile id: SHA-256 hex of `"<source>-<name>"`.
#[must_use]
pub fn profile_id(source: &str, name: &str) -> String {
    let digest = Sha256::digest(format!("{}-{}", source, name).as_bytes());
    hex::encode(digest)
}

impl Profile {
    /// Parse and validate a profile document.
    ///
    /// # Arguments
    ///
    /// * `json` - Profile document
    /// * `source` - Where the document came from, usually its path; part of the id
    ///
    /// # Errors
    ///
    /// Returns `Json` on malformed documents and `Profile` on validation failures.
    pub fn from_json(json: &str, source: &str) -> Result<Self> {
        let mut profile: Profile = serde_json::from_str(json)?;
        profile.id = profile_id(source, &profile.name);
        profile.validate()?;
        profile.expand_linear_thresholds();
        Ok(profile)
    }

    /// Replace ranged linear rungs by their expansion so evaluation never
    /// regenerates them.
    fn expand_linear_thresholds(&mut self) {
        for control in &mut self.controls {
            for assignment in &mut control.assignments {
                if let Assignment::Linear(linear) = assignment {
                    linear.thresholds = linear.generate_thresholds();
                }
            }
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents, &path.to_string_lossy())
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn is_auto_select(&self) -> bool {
        self.auto_select.unwrap_or(false)
    }

    #[must_use]
    pub fn usb_id(&self) -> Option<&str> {
        self.controller.as_ref().and_then(|c| c.usb_id.as_deref())
    }

    #[must_use]
    pub fn mapping(&self) -> Option<&SdlMapping> {
        self.controller.as_ref().and_then(|c| c.mapping.as_ref())
    }

    #[must_use]
    pub fn find_control(&self, name: &str) -> Option<&Control> {
        self.controls.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("profile name cannot be empty".to_string()));
        }
        if let Some(mapping) = self.mapping() {
            mapping.validate()?;
        }
        for (i, control) in self.controls.iter().enumerate() {
            if control.name.is_empty() {
                return Err(invalid(format!("{}: control {} has no name", self.name, i)));
            }
            if self.controls[..i].iter().any(|c| c.name == control.name) {
                return Err(invalid(format!("{}: control {} is defined twice", self.name, control.name)));
            }
            for assignment in &control.assignments {
                assignment
                    .validate()
                    .map_err(|e| invalid(format!("{}/{}: {}", self.name, control.name, e)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"{
        "name": "BR 146",
        "auto_select": true,
        "controller": { "usb_id": "0x044f:0xb10a" },
        "controls": [
            { "name": "Horn", "assignment": {
                "type": "momentary", "threshold": 0.5,
                "action_activate": { "keys": "space", "press_time": 0.2 } } },
            { "name": "Throttle1", "assignments": [
                { "type": "linear", "neutral": 0.5, "thresholds": [
                    { "value": 0.1, "value_end": 0.5, "value_step": 0.1,
                      "action_activate": { "keys": "a" } }
                ] },
                { "type": "direct_control", "controls": "Throttle(Lever)", "hold": true,
                  "input_value": { "min": 0, "max": 1, "steps": [0, 0.5, null, 1] } },
                { "type": "sync_control", "identifier": "Throttle(Lever)",
                  "input_value": { "min": 0, "max": 1 },
                  "action_increase": { "keys": "a" }, "action_decrease": { "keys": "d" } },
                { "type": "api_control", "controls": "Throttle(Lever)",
                  "input_value": { "min": 0, "max": 1 },
                  "conditions": [ { "control": "Reverser", "operator": "gt", "value": 0 } ] }
            ] },
            { "name": "Lights", "assignment": {
                "type": "toggle", "threshold": 0.9,
                "action_activate": { "controls": "Headlights", "value": 1 },
                "action_deactivate": { "controls": "Headlights", "api_value": 0 } } }
        ]
    }"#;

    // ==================== Parsing Tests ====================

    #[test]
    fn test_from_json() {
        let profile = Profile::from_json(PROFILE, "/profiles/br146.json").unwrap();
        assert_eq!(profile.name, "BR 146");
        assert!(profile.is_auto_select());
        assert_eq!(profile.usb_id(), Some("0x044f:0xb10a"));
        assert_eq!(profile.controls.len(), 3);
        assert_eq!(profile.find_control("Throttle1").unwrap().assignments.len(), 4);
        assert!(profile.find_control("Missing").is_none());
    }

    #[test]
    fn test_assignment_variants() {
        let profile = Profile::from_json(PROFILE, "x").unwrap();
        let kinds: Vec<&str> = profile
            .find_control("Throttle1")
            .unwrap()
            .assignments
            .iter()
            .map(Assignment::kind)
            .collect();
        assert_eq!(kinds, vec!["linear", "direct_control", "sync_control", "api_control"]);
    }

    #[test]
    fn test_action_decoding_by_fields() {
        let profile = Profile::from_json(PROFILE, "x").unwrap();
        match &profile.find_control("Lights").unwrap().assignments[0] {
            Assignment::Toggle(toggle) => {
                assert!(matches!(toggle.action_activate, Action::Direct(ref d) if d.controls == "Headlights" && d.value == 1.0));
                assert!(matches!(toggle.action_deactivate, Action::Api(ref a) if a.api_value == 0.0));
            }
            other => panic!("unexpected assignment {:?}", other),
        }
        match &profile.find_control("Horn").unwrap().assignments[0] {
            Assignment::Momentary(m) => {
                assert_eq!(m.action_activate, Action::Keys(KeysAction {
                    keys: "space".to_string(),
                    press_time: Some(0.2),
                    wait_time: None,
                }));
            }
            other => panic!("unexpected assignment {:?}", other),
        }
    }

    #[test]
    fn test_direct_action_value_defaults_to_zero() {
        let action: Action = serde_json::from_str(r#"{ "controls": "Wipers", "relative": true }"#).unwrap();
        assert!(matches!(action, Action::Direct(ref d) if d.value == 0.0 && d.relative == Some(true)));
    }

    #[test]
    fn test_profile_id_is_stable() {
        let a = Profile::from_json(PROFILE, "/p/a.json").unwrap();
        let b = Profile::from_json(PROFILE, "/p/a.json").unwrap();
        let c = Profile::from_json(PROFILE, "/p/c.json").unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 64);
        assert_eq!(a.id(), profile_id("/p/a.json", "BR 146"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("br146.json");
        std::fs::write(&path, PROFILE).unwrap();
        let profile = Profile::load(&path).unwrap();
        assert_eq!(profile.id(), profile_id(&path.to_string_lossy(), "BR 146"));
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_control_needs_an_assignment() {
        let json = r#"{ "name": "p", "controls": [ { "name": "Horn" } ] }"#;
        assert!(matches!(Profile::from_json(json, "x"), Err(TswControllerError::Json(_))));
    }

    #[test]
    fn test_control_rejects_both_assignment_forms() {
        let json = r#"{ "name": "p", "controls": [ { "name": "Horn",
            "assignment": { "type": "momentary", "threshold": 0.5, "action_activate": { "keys": "h" } },
            "assignments": [] } ] }"#;
        assert!(Profile::from_json(json, "x").is_err());
    }

    #[test]
    fn test_condition_needs_one_operand() {
        let json = r#"{ "name": "p", "controls": [ { "name": "Horn", "assignment": {
            "type": "momentary", "threshold": 0.5, "action_activate": { "keys": "h" },
            "conditions": [ { "control": "A", "cab_variable": "B", "operator": "gte", "value": 0 } ] } } ] }"#;
        assert!(matches!(Profile::from_json(json, "x"), Err(TswControllerError::Profile(_))));
    }

    #[test]
    fn test_zero_value_step_rejected() {
        let json = r#"{ "name": "p", "controls": [ { "name": "T", "assignment": {
            "type": "linear", "thresholds": [
                { "value": 0.1, "value_end": 0.5, "value_step": 0, "action_activate": { "keys": "a" } } ] } } ] }"#;
        assert!(matches!(Profile::from_json(json, "x"), Err(TswControllerError::Profile(_))));
    }

    fn linear_profile(threshold: &str) -> String {
        format!(
            r#"{{ "name": "p", "controls": [ {{ "name": "T", "assignment": {{
                "type": "linear", "thresholds": [ {} ] }} }} ] }}"#,
            threshold
        )
    }

    #[test]
    fn test_value_step_below_rounding_rejected() {
        let json = linear_profile(
            r#"{ "value": 0, "value_end": 1, "value_step": 0.00001, "action_activate": { "keys": "a" } }"#,
        );
        assert!(matches!(Profile::from_json(&json, "x"), Err(TswControllerError::Profile(_))));
    }

    #[test]
    fn test_degenerate_linear_ranges_rejected() {
        let cases = [
            ("step below rounding", r#""value": 0.1, "value_end": 0.5, "value_step": 0.00005"#),
            ("negative step", r#""value": 0.1, "value_end": 0.5, "value_step": -0.1"#),
            ("end below value", r#""value": 0.5, "value_end": 0.3, "value_step": 0.1"#),
            ("end equals value", r#""value": 0.5, "value_end": 0.5, "value_step": 0.1"#),
            ("too many rungs", r#""value": 0, "value_end": 100, "value_step": 0.0001"#),
        ];
        for (name, fields) in cases {
            let json = linear_profile(&format!(r#"{{ {}, "action_activate": {{ "keys": "a" }} }}"#, fields));
            assert!(
                matches!(Profile::from_json(&json, "x"), Err(TswControllerError::Profile(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_smallest_value_step_accepted() {
        let json = linear_profile(
            r#"{ "value": 0, "value_end": 0.001, "value_step": 0.0001, "action_activate": { "keys": "a" } }"#,
        );
        let profile = Profile::from_json(&json, "x").unwrap();
        let Assignment::Linear(linear) = &profile.find_control("T").unwrap().assignments[0] else {
            panic!("expected a linear assignment");
        };
        assert_eq!(linear.thresholds.len(), 10);
    }

    #[test]
    fn test_from_json_expands_ranges_once() {
        let profile = Profile::from_json(PROFILE, "x").unwrap();
        let Assignment::Linear(linear) = &profile.find_control("Throttle1").unwrap().assignments[0] else {
            panic!("expected a linear assignment");
        };
        let values: Vec<f64> = linear.thresholds.iter().map(|t| t.value).collect();
        assert_eq!(values, vec![0.1, 0.2, 0.3, 0.4]);
        assert!(linear.thresholds.iter().all(|t| !t.is_ranged()));
        assert!(matches!(linear.expanded_thresholds(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_unknown_assignment_type_rejected() {
        let json = r#"{ "name": "p", "controls": [ { "name": "T", "assignment": { "type": "analog" } } ] }"#;
        assert!(Profile::from_json(json, "x").is_err());
    }

    #[test]
    fn test_duplicate_control_rejected() {
        let json = r#"{ "name": "p", "controls": [
            { "name": "T", "assignment": { "type": "momentary", "threshold": 0.5, "action_activate": { "keys": "a" } } },
            { "name": "T", "assignment": { "type": "momentary", "threshold": 0.5, "action_activate": { "keys": "b" } } } ] }"#;
        assert!(Profile::from_json(json, "x").is_err());
    }

    // ==================== Linear Threshold Tests ====================

    fn ladder(value: f64, value_end: Option<f64>, value_step: Option<f64>) -> LinearAssignment {
        LinearAssignment {
            conditions: vec![],
            neutral: None,
            thresholds: vec![LinearThreshold {
                value,
                value_end,
                value_step,
                action_activate: Action::keys("a"),
                action_deactivate: None,
            }],
        }
    }

    #[test]
    fn test_generate_thresholds_end_exclusive() {
        let values: Vec<f64> = ladder(0.3, Some(0.4), Some(0.03))
            .generate_thresholds()
            .iter()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![0.3, 0.33, 0.36, 0.39]);
    }

    #[test]
    fn test_generate_thresholds_no_drift() {
        let values: Vec<f64> = ladder(0.0, Some(1.0), Some(0.1))
            .generate_thresholds()
            .iter()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
    }

    #[test]
    fn test_single_threshold_kept() {
        let thresholds = ladder(0.7, None, None).generate_thresholds();
        assert_eq!(thresholds.len(), 1);
        assert_eq!(thresholds[0].value, 0.7);
    }

    #[test]
    fn test_generate_thresholds_stops_when_rounding_stalls() {
        // 0.00001 rounds away at four decimals, so the range cannot advance
        let values: Vec<f64> = ladder(0.0, Some(1.0), Some(0.00001))
            .generate_thresholds()
            .iter()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![0.0]);
    }

    #[test]
    fn test_generate_thresholds_degenerate_ranges() {
        let cases = [
            ("end below value", 0.5, 0.3, 0.1, 0),
            ("end equals value", 0.5, 0.5, 0.1, 0),
            ("step below rounding", 0.2, 0.9, 0.00004, 1),
            ("step larger than range", 0.2, 0.3, 0.5, 1),
            ("huge range", 0.0, 1.0e9, 0.0001, MAX_GENERATED_THRESHOLDS),
        ];
        for (name, value, end, step, expected) in cases {
            let thresholds = ladder(value, Some(end), Some(step)).generate_thresholds();
            assert_eq!(thresholds.len(), expected, "{}", name);
        }
    }

    #[test]
    fn test_expanded_thresholds_borrows_plain_rungs() {
        let plain = ladder(0.7, None, None);
        assert!(matches!(plain.expanded_thresholds(), Cow::Borrowed(_)));

        let ranged = ladder(0.3, Some(0.4), Some(0.03));
        let expanded = ranged.expanded_thresholds();
        assert!(matches!(expanded, Cow::Owned(_)));
        assert_eq!(expanded.len(), 4);
    }

    #[test]
    fn test_neutralized() {
        let mut linear = ladder(0.1, None, None);
        assert_eq!(linear.neutralized(0.75), 0.75);
        linear.neutral = Some(0.5);
        assert_eq!(linear.neutralized(0.75), 0.5);
        assert_eq!(linear.neutralized(0.25), -0.5);
    }

    #[test]
    fn test_negative_threshold_exceeded_from_above() {
        let threshold = &ladder(-0.5, None, None).thresholds[0];
        assert!(threshold.is_exceeded_by(-0.6));
        assert!(!threshold.is_exceeded_by(-0.5));
        let threshold = &ladder(0.5, None, None).thresholds[0];
        assert!(threshold.is_exceeded_by(0.5));
        assert!(!threshold.is_exceeded_by(0.49));
    }

    #[test]
    fn test_condition_operators() {
        assert!(ConditionOperator::Gte.compare(0.5, 0.5));
        assert!(!ConditionOperator::Gt.compare(0.5, 0.5));
        assert!(ConditionOperator::Lte.compare(0.5, 0.5));
        assert!(ConditionOperator::Lt.compare(0.4, 0.5));
    }
}
