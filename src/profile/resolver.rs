//! # Assignment Resolver
//!
//! Picks which of a control's assignments take part in an evaluation.
//!
//! 1. Conditions are checked against the current values of other controls
//!    and of cab variables. A condition whose operand is unknown, or whose
//!    comparison fails, removes the whole assignment.
//! 2. The survivors are partitioned into direct, sync, API and generic
//!    (momentary, linear, toggle) assignments. Generic ones always stay; of
//!    the others only the partition matching the preferred control mode is
//!    kept.

use std::collections::HashMap;
use tracing::{debug, warn};

use super::model::{Assignment, ConditionOperand};
use crate::config::PreferredControlMode;

/// Values conditions are evaluated against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionContext {
    /// Normalized values of the device's controls, by control name
    pub controls: HashMap<String, f64>,
    /// Latest simulator-side values, by variable name
    pub external: HashMap<String, f64>,
}

impl ConditionContext {
    fn lookup(&self, operand: ConditionOperand<'_>) -> Option<f64> {
        match operand {
            ConditionOperand::Control(name) => self.controls.get(name).copied(),
            ConditionOperand::CabVariable(name) => self.external.get(name).copied(),
        }
    }
}

fn conditions_pass(assignment: &Assignment, context: &ConditionContext) -> bool {
    for condition in assignment.conditions() {
        let Some(operand) = condition.operand() else {
            warn!("Skipping {} assignment: condition has no operand", assignment.kind());
            return false;
        };
        let Some(current) = context.lookup(operand) else {
            warn!("Skipping {} assignment: {:?} is unknown", assignment.kind(), operand);
            return false;
        };
        if !condition.operator.compare(current, condition.value) {
            debug!(
                "Skipping {} assignment: {:?} = {} fails {:?} {}",
                assignment.kind(),
                operand,
                current,
                condition.operator,
                condition.value
            );
            return false;
        }
    }
    true
}

/// Select the assignments to evaluate, with their configured positions.
///
/// # Arguments
///
/// * `assignments` - The control's assignments in configured order
/// * `context` - Condition values; `None` skips condition checks
/// * `mode` - Preferred control mode
///
/// # Returns
///
/// `(position, assignment)` pairs in configured order.
#[must_use]
pub fn resolve<'a>(
    assignments: &'a [Assignment],
    context: Option<&ConditionContext>,
    mode: PreferredControlMode,
) -> Vec<(usize, &'a Assignment)> {
    let mut generic = Vec::new();
    let mut direct = Vec::new();
    let mut sync = Vec::new();
    let mut api = Vec::new();

    for (index, assignment) in assignments.iter().enumerate() {
        if let Some(context) = context {
            if !conditions_pass(assignment, context) {
                continue;
            }
        }
        match assignment {
            Assignment::DirectControl(_) => direct.push((index, assignment)),
            Assignment::SyncControl(_) => sync.push((index, assignment)),
            Assignment::ApiControl(_) => api.push((index, assignment)),
            Assignment::Momentary(_) | Assignment::Linear(_) | Assignment::Toggle(_) => {
                generic.push((index, assignment))
            }
        }
    }

    let preferred = match mode {
        PreferredControlMode::DirectControl => direct,
        PreferredControlMode::SyncControl => sync,
        PreferredControlMode::ApiControl => api,
    };

    let mut resolved = generic;
    resolved.extend(preferred);
    resolved.sort_by_key(|(index, _)| *index);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::input_value::InputValue;
    use crate::profile::model::{
        Action, ApiControlAssignment, Condition, ConditionOperator, DirectControlAssignment, KeysAction,
        MomentaryAssignment, SyncControlAssignment,
    };

    fn momentary(conditions: Vec<Condition>) -> Assignment {
        Assignment::Momentary(MomentaryAssignment {
            conditions,
            threshold: 0.5,
            action_activate: Action::keys("a"),
            action_deactivate: None,
        })
    }

    fn direct() -> Assignment {
        Assignment::DirectControl(DirectControlAssignment {
            conditions: vec![],
            controls: "Throttle".to_string(),
            hold: None,
            use_normalized: None,
            input_value: InputValue::range(0.0, 1.0),
        })
    }

    fn sync() -> Assignment {
        Assignment::SyncControl(SyncControlAssignment {
            conditions: vec![],
            identifier: "Throttle".to_string(),
            input_value: InputValue::range(0.0, 1.0),
            action_increase: KeysAction::new("a"),
            action_decrease: KeysAction::new("d"),
        })
    }

    fn api() -> Assignment {
        Assignment::ApiControl(ApiControlAssignment {
            conditions: vec![],
            controls: "Throttle".to_string(),
            input_value: InputValue::range(0.0, 1.0),
        })
    }

    fn on_control(name: &str, operator: ConditionOperator, value: f64) -> Condition {
        Condition { control: Some(name.to_string()), cab_variable: None, operator, value }
    }

    fn positions(resolved: &[(usize, &Assignment)]) -> Vec<usize> {
        resolved.iter().map(|(i, _)| *i).collect()
    }

    // ==================== Mode Partition Tests ====================

    #[test]
    fn test_direct_mode_keeps_generic_and_direct() {
        let assignments = vec![momentary(vec![]), direct(), sync(), api()];
        let resolved = resolve(&assignments, None, PreferredControlMode::DirectControl);
        assert_eq!(positions(&resolved), vec![0, 1]);
    }

    #[test]
    fn test_sync_mode_keeps_generic_and_sync() {
        let assignments = vec![direct(), sync(), momentary(vec![])];
        let resolved = resolve(&assignments, None, PreferredControlMode::SyncControl);
        assert_eq!(positions(&resolved), vec![1, 2]);
    }

    #[test]
    fn test_api_mode_keeps_generic_and_api() {
        let assignments = vec![api(), direct(), momentary(vec![])];
        let resolved = resolve(&assignments, None, PreferredControlMode::ApiControl);
        assert_eq!(positions(&resolved), vec![0, 2]);
    }

    #[test]
    fn test_missing_preferred_partition_keeps_generic_only() {
        let assignments = vec![direct(), momentary(vec![])];
        let resolved = resolve(&assignments, None, PreferredControlMode::SyncControl);
        assert_eq!(positions(&resolved), vec![1]);
    }

    // ==================== Condition Tests ====================

    #[test]
    fn test_condition_pass_and_fail() {
        let assignments = vec![
            momentary(vec![on_control("Reverser", ConditionOperator::Gt, 0.0)]),
            momentary(vec![on_control("Reverser", ConditionOperator::Lt, 0.0)]),
        ];
        let context = ConditionContext {
            controls: HashMap::from([("Reverser".to_string(), 1.0)]),
            external: HashMap::new(),
        };
        let resolved = resolve(&assignments, Some(&context), PreferredControlMode::DirectControl);
        assert_eq!(positions(&resolved), vec![0]);
    }

    #[test]
    fn test_missing_dependency_skips_assignment() {
        let assignments = vec![momentary(vec![on_control("Missing", ConditionOperator::Gte, 0.0)])];
        let resolved = resolve(&assignments, Some(&ConditionContext::default()), PreferredControlMode::DirectControl);
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_all_conditions_must_pass() {
        let assignments = vec![momentary(vec![
            on_control("A", ConditionOperator::Gte, 0.5),
            on_control("B", ConditionOperator::Gte, 0.5),
        ])];
        let context = ConditionContext {
            controls: HashMap::from([("A".to_string(), 0.6), ("B".to_string(), 0.4)]),
            external: HashMap::new(),
        };
        assert!(resolve(&assignments, Some(&context), PreferredControlMode::DirectControl).is_empty());
    }

    #[test]
    fn test_cab_variable_condition() {
        let assignments = vec![momentary(vec![Condition {
            control: None,
            cab_variable: Some("Reverser".to_string()),
            operator: ConditionOperator::Gte,
            value: 1.0,
        }])];
        let context = ConditionContext {
            controls: HashMap::new(),
            external: HashMap::from([("Reverser".to_string(), 1.0)]),
        };
        assert_eq!(resolve(&assignments, Some(&context), PreferredControlMode::DirectControl).len(), 1);
    }

    #[test]
    fn test_no_context_skips_conditions() {
        let assignments = vec![momentary(vec![on_control("Missing", ConditionOperator::Gte, 0.0)])];
        assert_eq!(resolve(&assignments, None, PreferredControlMode::DirectControl).len(), 1);
    }
}
