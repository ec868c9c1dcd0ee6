//! # Assignment Evaluator
//!
//! Turns a control state into output effects according to the resolved
//! assignments, remembering the last call of every assignment.
//!
//! The history entry of `(control, position)` is the only memory of whether a
//! threshold or toggle is currently engaged:
//!
//! * an emitted action overwrites the entry with the current state and the
//!   action
//! * a *re-arm* overwrites only the recorded state and keeps the action, so a
//!   momentary can fire again and a toggle still knows what it did last
//! * nothing else touches it
//!
//! Direct, API and sync assignments pass every evaluation through.

use std::collections::HashMap;
use tracing::debug;

use super::model::{
    Action, ApiControlAssignment, Assignment, DirectControlAssignment, LinearAssignment, MomentaryAssignment,
    SyncControlAssignment, ToggleAssignment,
};
use crate::controller::state::ControlState;
use crate::output::{ApiCommand, DirectCommand, OutputAction};
use crate::sequencer::SequencerAction;

/// Last call of one assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentCall {
    pub control_state: ControlState,
    pub action: OutputAction,
}

impl AssignmentCall {
    fn value(&self) -> f64 {
        self.control_state.normalized.value
    }
}

/// Result of an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Key action, direct or API command to route to its consumer
    Action(OutputAction),
    /// New convergence target for a sync control
    SyncTarget { identifier: String, value: f64 },
}

/// Convert a configured action into an output.
#[must_use]
pub fn to_output(action: &Action, release: bool) -> OutputAction {
    match action {
        Action::Keys(keys) => OutputAction::Keys(SequencerAction::from_keys_action(keys, release)),
        Action::Direct(direct) => OutputAction::Direct(DirectCommand {
            controls: direct.controls.clone(),
            value: direct.value,
            hold: direct.hold.unwrap_or(false),
            relative: direct.relative.unwrap_or(false),
            normalized: direct.use_normalized.unwrap_or(false),
        }),
        Action::Api(api) => OutputAction::Api(ApiCommand { controls: api.controls.clone(), value: api.api_value }),
    }
}

/// Deactivation of a threshold: the explicit action, else a release of the
/// activation keys. `None` means re-arm.
fn deactivation(activate: &Action, deactivate: Option<&Action>) -> Option<OutputAction> {
    match (deactivate, activate) {
        (Some(action), _) => Some(to_output(action, false)),
        (None, Action::Keys(_)) => Some(to_output(activate, true)),
        (None, _) => None,
    }
}

/// Rule engine with per-assignment call history.
#[derive(Debug, Default)]
pub struct AssignmentEvaluator {
    history: HashMap<String, Vec<Option<AssignmentCall>>>,
}

impl AssignmentEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every recorded call.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    #[must_use]
    pub fn previous(&self, control: &str, position: usize) -> Option<&AssignmentCall> {
        self.history.get(control)?.get(position)?.as_ref()
    }

    fn slot(&mut self, control: &str, position: usize) -> &mut Option<AssignmentCall> {
        let calls = self.history.entry(control.to_string()).or_default();
        if calls.len() <= position {
            calls.resize(position + 1, None);
        }
        &mut calls[position]
    }

    /// Record an emitted action and queue it as an effect.
    fn call(
        &mut self,
        control: &str,
        position: usize,
        state: &ControlState,
        action: OutputAction,
        effects: &mut Vec<Effect>,
    ) {
        debug!("{}[{}] -> {}", control, position, action.canonical());
        *self.slot(control, position) = Some(AssignmentCall { control_state: *state, action: action.clone() });
        effects.push(Effect::Action(action));
    }

    /// Overwrite the recorded state without emitting. No-op without an entry.
    fn rearm(&mut self, control: &str, position: usize, state: &ControlState) {
        if let Some(call) = self.slot(control, position) {
            debug!("{}[{}] re-armed", control, position);
            call.control_state = *state;
        }
    }

    /// Evaluate resolved assignments of `control` against `state`.
    ///
    /// # Arguments
    ///
    /// * `control` - Control name the history is keyed by
    /// * `resolved` - `(position, assignment)` pairs from the resolver
    /// * `state` - Current control state
    ///
    /// # Returns
    ///
    /// Effects in the order they must be applied.
    pub fn evaluate(&mut self, control: &str, resolved: &[(usize, &Assignment)], state: &ControlState) -> Vec<Effect> {
        let mut effects = Vec::new();
        for (position, assignment) in resolved {
            let position = *position;
            match assignment {
                Assignment::Momentary(a) => self.momentary(control, position, a, state, &mut effects),
                Assignment::Linear(a) => self.linear(control, position, a, state, &mut effects),
                Assignment::Toggle(a) => self.toggle(control, position, a, state, &mut effects),
                Assignment::DirectControl(a) => self.direct(control, position, a, state, &mut effects),
                Assignment::SyncControl(a) => Self::sync(a, state, &mut effects),
                Assignment::ApiControl(a) => self.api(control, position, a, state, &mut effects),
            }
        }
        effects
    }

    fn momentary(
        &mut self,
        control: &str,
        position: usize,
        assignment: &MomentaryAssignment,
        state: &ControlState,
        effects: &mut Vec<Effect>,
    ) {
        let value = state.normalized.value;
        let threshold = assignment.threshold;
        let previous_value = self.previous(control, position).map(AssignmentCall::value);

        if value >= threshold {
            if previous_value.map_or(true, |p| p < threshold) {
                let action = to_output(&assignment.action_activate, false);
                self.call(control, position, state, action, effects);
            }
        } else if previous_value.map_or(false, |p| p >= threshold) {
            match deactivation(&assignment.action_activate, assignment.action_deactivate.as_ref()) {
                Some(action) => self.call(control, position, state, action, effects),
                None => self.rearm(control, position, state),
            }
        }
    }

    fn linear(
        &mut self,
        control: &str,
        position: usize,
        assignment: &LinearAssignment,
        state: &ControlState,
        effects: &mut Vec<Effect>,
    ) {
        let current = assignment.neutralized(state.normalized.value);
        let baseline = match self.previous(control, position) {
            Some(call) => assignment.neutralized(call.value()),
            None => assignment.neutralized(state.normalized.initial),
        };

        let thresholds = assignment.expanded_thresholds();
        let exceeding: Vec<_> = thresholds.iter().filter(|t| t.is_exceeded_by(current)).collect();
        let passed: Vec<_> = thresholds.iter().filter(|t| t.is_exceeded_by(baseline)).collect();

        if exceeding.len() > passed.len() {
            for threshold in &exceeding[passed.len()..] {
                let action = to_output(&threshold.action_activate, false);
                self.call(control, position, state, action, effects);
            }
        } else if exceeding.len() < passed.len() {
            for threshold in passed[exceeding.len()..].iter().rev() {
                match deactivation(&threshold.action_activate, threshold.action_deactivate.as_ref()) {
                    Some(action) => self.call(control, position, state, action, effects),
                    None => self.rearm(control, position, state),
                }
            }
        }
    }

    fn toggle(
        &mut self,
        control: &str,
        position: usize,
        assignment: &ToggleAssignment,
        state: &ControlState,
        effects: &mut Vec<Effect>,
    ) {
        let value = state.normalized.value;
        let threshold = assignment.threshold;
        let previous = self.previous(control, position).cloned();

        if value >= threshold {
            if previous.as_ref().map_or(false, |p| p.value() >= threshold) {
                return;
            }
            let mut action = to_output(&assignment.action_activate, false);
            if previous.as_ref().map_or(false, |p| p.action.canonical() == action.canonical()) {
                action = to_output(&assignment.action_deactivate, false);
            }
            self.call(control, position, state, action, effects);
        } else if let Some(previous) = previous.filter(|p| p.value() >= threshold) {
            match previous.action.as_keys() {
                Some(keys) => self.call(control, position, state, OutputAction::Keys(keys.released()), effects),
                None => self.rearm(control, position, state),
            }
        }
    }

    fn direct(
        &mut self,
        control: &str,
        position: usize,
        assignment: &DirectControlAssignment,
        state: &ControlState,
        effects: &mut Vec<Effect>,
    ) {
        let command = DirectCommand {
            controls: assignment.controls.clone(),
            value: assignment.input_value.calculate_output_value(state.normalized.value),
            hold: assignment.hold.unwrap_or(false),
            relative: false,
            normalized: assignment.use_normalized.unwrap_or(false),
        };
        self.call(control, position, state, OutputAction::Direct(command), effects);
    }

    fn sync(assignment: &SyncControlAssignment, state: &ControlState, effects: &mut Vec<Effect>) {
        effects.push(Effect::SyncTarget {
            identifier: assignment.identifier.clone(),
            value: assignment.input_value.calculate_output_value(state.normalized.value),
        });
    }

    fn api(
        &mut self,
        control: &str,
        position: usize,
        assignment: &ApiControlAssignment,
        state: &ControlState,
        effects: &mut Vec<Effect>,
    ) {
        let command = ApiCommand {
            controls: assignment.controls.clone(),
            value: assignment.input_value.calculate_output_value(state.normalized.value),
        };
        self.call(control, position, state, OutputAction::Api(command), effects);
    }
}
