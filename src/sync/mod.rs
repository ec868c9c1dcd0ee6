//! # Sync Control
//!
//! Closed-loop convergence of simulator controls that can only be moved with
//! increase/decrease keys.
//!
//! A sync assignment sets a *target*. The simulator reports the control's
//! *current* value back, either through `sync_control` transport messages or
//! a periodic remote API poll. On every feedback update the runner calls
//! [`decide`]: hold the increase or decrease key until the current value
//! reaches the target, then release it.
//!
//! ```text
//!   target 0.8      feedback 0.2 -> press increase (moving = 1)
//!                   feedback 0.5 -> hold
//!                   feedback 0.8 -> release increase (moving = 0)
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::manager::DeviceGuid;
use crate::error::Result;
use crate::profile::model::SyncControlAssignment;
use crate::pubsub::PubSub;
use crate::remote_api::RemoteApi;
use crate::sequencer::{ActionSequencer, SequencerAction};
use crate::transport::TransportMessage;

/// Default distance at which current and target count as equal.
pub const DEFAULT_MARGIN_OF_ERROR: f64 = 0.005;

/// Transport event carrying sync feedback.
pub const SYNC_CONTROL_EVENT: &str = "sync_control";

/// Device control whose assignment last set the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncBinding {
    pub device: DeviceGuid,
    pub control_name: String,
}

/// Convergence state of one simulator control.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncControlState {
    pub identifier: String,
    /// Simulator property name; empty until feedback arrives
    pub property_name: String,
    pub current_value: f64,
    pub current_normalized_value: f64,
    pub target_value: Option<f64>,
    /// -1 decreasing, 0 idle, 1 increasing
    pub moving: i8,
    pub binding: Option<SyncBinding>,
}

impl SyncControlState {
    fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            property_name: String::new(),
            current_value: 0.0,
            current_normalized_value: 0.0,
            target_value: None,
            moving: 0,
            binding: None,
        }
    }
}

/// What caused a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncUpdateOrigin {
    Target,
    Feedback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStateUpdate {
    pub state: SyncControlState,
    pub origin: SyncUpdateOrigin,
}

/// Outcome of one convergence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Hold,
    /// Release the key moving in this direction
    Stop { moving: i8 },
    StartIncreasing,
    StartDecreasing,
}

/// Decide the next convergence step from current value, target and the
/// moving marker. Never stops and starts in the same step.
#[must_use]
pub fn decide(state: &SyncControlState, margin: f64) -> SyncDecision {
    let Some(target) = state.target_value else {
        return SyncDecision::Hold;
    };
    let current = state.current_value;
    let moving = state.moving;

    let overshot = (moving == 1 && current >= target) || (moving == -1 && current <= target);
    if overshot || (moving != 0 && (current - target).abs() < margin) {
        return SyncDecision::Stop { moving };
    }
    if moving == 0 && (target - current).abs() > margin {
        return if target > current {
            SyncDecision::StartIncreasing
        } else {
            SyncDecision::StartDecreasing
        };
    }
    SyncDecision::Hold
}

/// Shared sync states plus update fan-out.
#[derive(Clone)]
pub struct SyncController {
    states: Arc<RwLock<HashMap<String, SyncControlState>>>,
    updates: Arc<PubSub<SyncStateUpdate>>,
}

impl SyncController {
    #[must_use]
    pub fn new(subscriber_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            updates: Arc::new(PubSub::new(subscriber_capacity, send_timeout)),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<SyncStateUpdate> {
        self.updates.subscribe()
    }

    pub async fn get(&self, identifier: &str) -> Option<SyncControlState> {
        self.states.read().await.get(identifier).cloned()
    }

    /// All states, ordered by identifier.
    pub async fn snapshot(&self) -> Vec<SyncControlState> {
        let mut states: Vec<_> = self.states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        states
    }

    /// Latest simulator values keyed by identifier and by property name.
    pub async fn external_values(&self) -> HashMap<String, f64> {
        let states = self.states.read().await;
        let mut values = HashMap::new();
        for state in states.values() {
            values.insert(state.identifier.clone(), state.current_value);
            if !state.property_name.is_empty() {
                values.insert(state.property_name.clone(), state.current_value);
            }
        }
        values
    }

    async fn publish(&self, state: SyncControlState, origin: SyncUpdateOrigin) {
        self.updates.emit(SyncStateUpdate { state, origin }).await;
    }

    /// Set the convergence target, creating the state if needed.
    pub async fn set_target(&self, identifier: &str, target: f64, binding: SyncBinding) {
        let state = {
            let mut states = self.states.write().await;
            let state = states
                .entry(identifier.to_string())
                .or_insert_with(|| SyncControlState::new(identifier));
            state.target_value = Some(target);
            state.binding = Some(binding);
            state.clone()
        };
        debug!("Sync target {} = {}", identifier, target);
        self.publish(state, SyncUpdateOrigin::Target).await;
    }

    /// Record the simulator's current value, creating the state if needed.
    pub async fn apply_feedback(&self, identifier: &str, property_name: &str, value: f64, normalized_value: f64) {
        let state = {
            let mut states = self.states.write().await;
            let state = states
                .entry(identifier.to_string())
                .or_insert_with(|| SyncControlState::new(identifier));
            state.property_name = property_name.to_string();
            state.current_value = value;
            state.current_normalized_value = normalized_value;
            state.clone()
        };
        self.publish(state, SyncUpdateOrigin::Feedback).await;
    }

    /// Update the moving marker. Publishes nothing.
    pub async fn update_moving(&self, identifier: &str, moving: i8) {
        if let Some(state) = self.states.write().await.get_mut(identifier) {
            state.moving = moving;
        }
    }

    /// Carry out `decision` with the keys of `assignment`.
    ///
    /// # Errors
    ///
    /// Propagates enqueue failures; the moving marker is only updated once
    /// the key action was queued.
    pub async fn apply(
        &self,
        identifier: &str,
        decision: SyncDecision,
        assignment: &SyncControlAssignment,
        sequencer: &ActionSequencer,
    ) -> Result<()> {
        let (action, moving) = match decision {
            SyncDecision::Hold => return Ok(()),
            SyncDecision::Stop { moving } => {
                let keys = if moving == -1 { &assignment.action_decrease } else { &assignment.action_increase };
                (SequencerAction::from_keys_action(keys, true), 0)
            }
            SyncDecision::StartIncreasing => (SequencerAction::from_keys_action(&assignment.action_increase, false), 1),
            SyncDecision::StartDecreasing => (SequencerAction::from_keys_action(&assignment.action_decrease, false), -1),
        };
        debug!("Sync {} {:?}", identifier, decision);
        sequencer.enqueue(action).await?;
        self.update_moving(identifier, moving).await;
        Ok(())
    }

    /// Apply a `sync_control` feedback message. Other events are ignored.
    pub async fn handle_message(&self, message: &TransportMessage) {
        if message.event != SYNC_CONTROL_EVENT {
            return;
        }
        let Some(identifier) = message.get("name").filter(|n| !n.is_empty()) else {
            debug!("sync_control message without name");
            return;
        };
        let number = |key: &str| message.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
        self.apply_feedback(
            identifier,
            message.get("property").unwrap_or_default(),
            number("value"),
            number("normalized_value"),
        )
        .await;
    }

    /// Consume transport messages until cancelled or the subscription closes.
    pub async fn run_transport_listener(self, mut messages: mpsc::Receiver<TransportMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => self.handle_message(&message).await,
                    None => break,
                },
            }
        }
    }

    /// Poll a remote API subscription and forward changed values as feedback.
    pub async fn run_api_poller(
        self,
        api: Arc<dyn RemoteApi>,
        subscription_id: u32,
        period: Duration,
        cancel: CancellationToken,
    ) {
        info!("Polling subscription {} every {:?}", subscription_id, period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut object_class = String::new();
        let mut last_values: HashMap<String, f64> = HashMap::new();
        let mut failing = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = match api.poll_subscription(subscription_id).await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            if !failing {
                                warn!("Subscription poll failed: {}", e);
                            }
                            failing = true;
                            continue;
                        }
                    };
                    if failing {
                        info!("Subscription poll recovered");
                        failing = false;
                    }
                    if snapshot.object_class != object_class {
                        info!("Driving {}", snapshot.object_class);
                        object_class = snapshot.object_class.clone();
                        last_values.clear();
                    }
                    for (property, control) in &snapshot.controls {
                        if last_values.get(property) == Some(&control.value) {
                            continue;
                        }
                        last_values.insert(property.clone(), control.value);
                        self.apply_feedback(&control.identifier, property, control.value, control.normalized_value).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TswControllerError;
    use crate::profile::model::KeysAction;
    use crate::remote_api::{CabControlValue, MockRemoteApi, SubscriptionSnapshot};
    use crate::sequencer::{self, mocks::RecordingKeyboard};

    fn state(current: f64, target: Option<f64>, moving: i8) -> SyncControlState {
        SyncControlState {
            current_value: current,
            target_value: target,
            moving,
            ..SyncControlState::new("Throttle")
        }
    }

    fn binding() -> SyncBinding {
        SyncBinding { device: "dev".to_string(), control_name: "Throttle1".to_string() }
    }

    fn assignment() -> SyncControlAssignment {
        SyncControlAssignment {
            conditions: vec![],
            identifier: "Throttle".to_string(),
            input_value: crate::profile::input_value::InputValue::range(0.0, 1.0),
            action_increase: KeysAction::new("a"),
            action_decrease: KeysAction::new("d"),
        }
    }

    // ==================== Decision Tests ====================

    #[test]
    fn test_decide_without_target_holds() {
        assert_eq!(decide(&state(0.0, None, 0), 0.005), SyncDecision::Hold);
    }

    #[test]
    fn test_decide_start() {
        assert_eq!(decide(&state(0.0, Some(1.0), 0), 0.005), SyncDecision::StartIncreasing);
        assert_eq!(decide(&state(1.0, Some(0.0), 0), 0.005), SyncDecision::StartDecreasing);
    }

    #[test]
    fn test_decide_within_margin_idle_holds() {
        assert_eq!(decide(&state(0.498, Some(0.5), 0), 0.005), SyncDecision::Hold);
    }

    #[test]
    fn test_decide_stop_on_overshoot() {
        assert_eq!(decide(&state(1.02, Some(1.0), 1), 0.005), SyncDecision::Stop { moving: 1 });
        assert_eq!(decide(&state(0.1, Some(0.2), -1), 0.005), SyncDecision::Stop { moving: -1 });
    }

    #[test]
    fn test_decide_stop_within_margin() {
        assert_eq!(decide(&state(0.997, Some(1.0), 1), 0.005), SyncDecision::Stop { moving: 1 });
    }

    #[test]
    fn test_decide_keep_moving() {
        assert_eq!(decide(&state(0.5, Some(1.0), 1), 0.005), SyncDecision::Hold);
    }

    // ==================== State Tests ====================

    #[tokio::test]
    async fn test_set_target_creates_and_publishes() {
        let controller = SyncController::new(8, Duration::from_secs(1));
        let mut updates = controller.subscribe();
        controller.set_target("Throttle", 0.8, binding()).await;

        let update = updates.recv().await.unwrap();
        assert_eq!(update.origin, SyncUpdateOrigin::Target);
        assert_eq!(update.state.target_value, Some(0.8));
        assert_eq!(update.state.binding, Some(binding()));
        assert_eq!(controller.get("Throttle").await.unwrap().current_value, 0.0);
    }

    #[tokio::test]
    async fn test_feedback_keeps_target() {
        let controller = SyncController::new(8, Duration::from_secs(1));
        controller.set_target("Throttle", 0.8, binding()).await;
        controller.apply_feedback("Throttle", "Throttle(Lever)", 0.3, 0.3).await;

        let state = controller.get("Throttle").await.unwrap();
        assert_eq!(state.target_value, Some(0.8));
        assert_eq!(state.current_value, 0.3);
        assert_eq!(state.property_name, "Throttle(Lever)");
    }

    #[tokio::test]
    async fn test_update_moving_does_not_publish() {
        let controller = SyncController::new(8, Duration::from_secs(1));
        controller.apply_feedback("Throttle", "p", 0.0, 0.0).await;
        let mut updates = controller.subscribe();
        controller.update_moving("Throttle", 1).await;
        controller.update_moving("Unknown", 1).await;

        assert!(updates.try_recv().is_err());
        assert_eq!(controller.get("Throttle").await.unwrap().moving, 1);
        assert!(controller.get("Unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_external_values() {
        let controller = SyncController::new(8, Duration::from_secs(1));
        controller.apply_feedback("Reverser", "Reverser(Lever)", 1.0, 1.0).await;
        let values = controller.external_values().await;
        assert_eq!(values.get("Reverser"), Some(&1.0));
        assert_eq!(values.get("Reverser(Lever)"), Some(&1.0));
    }

    // ==================== Feedback Source Tests ====================

    #[tokio::test]
    async fn test_handle_sync_control_message() {
        let controller = SyncController::new(8, Duration::from_secs(1));
        let message =
            TransportMessage::from_wire("sync_control,name=Throttle,property=Throttle(Lever),value=0.4,normalized_value=0.2")
                .unwrap();
        controller.handle_message(&message).await;
        controller.handle_message(&TransportMessage::new("direct_control").with("name", "Other")).await;

        let states = controller.snapshot().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].current_value, 0.4);
        assert_eq!(states[0].current_normalized_value, 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_poller_forwards_changes_only() {
        let mut api = MockRemoteApi::new();
        let mut polls = 0;
        api.expect_poll_subscription().withf(|id| *id == 83211).returning(move |_| {
            polls += 1;
            if polls == 1 {
                return Err(TswControllerError::RemoteApi("not ready".to_string()));
            }
            let value = if polls < 4 { 0.25 } else { 0.5 };
            Ok(SubscriptionSnapshot {
                object_class: "BR146".to_string(),
                controls: HashMap::from([(
                    "Throttle(Lever)".to_string(),
                    CabControlValue { identifier: "Throttle".to_string(), value, normalized_value: value },
                )]),
            })
        });

        let controller = SyncController::new(8, Duration::from_secs(1));
        let mut updates = controller.subscribe();
        let cancel = CancellationToken::new();
        let poller = tokio::spawn(controller.clone().run_api_poller(
            Arc::new(api),
            83211,
            Duration::from_millis(333),
            cancel.clone(),
        ));

        let first = updates.recv().await.unwrap();
        assert_eq!(first.state.current_value, 0.25);
        assert_eq!(first.origin, SyncUpdateOrigin::Feedback);
        let second = updates.recv().await.unwrap();
        assert_eq!(second.state.current_value, 0.5);

        cancel.cancel();
        poller.await.unwrap();
    }

    // ==================== Convergence Tests ====================

    #[tokio::test]
    async fn test_apply_moves_and_stops() {
        let keyboard = RecordingKeyboard::default();
        let (seq, worker) = sequencer::channel(8, Duration::from_secs(1), keyboard.clone(), 0);
        let controller = SyncController::new(8, Duration::from_secs(1));
        let assignment = assignment();

        controller.set_target("Throttle", 1.0, binding()).await;
        controller.apply_feedback("Throttle", "p", 0.0, 0.0).await;

        let mut stops = 0;
        for feedback in [0.0, 0.4, 0.8, 0.997, 0.997] {
            controller.apply_feedback("Throttle", "p", feedback, feedback).await;
            let current = controller.get("Throttle").await.unwrap();
            let decision = decide(&current, DEFAULT_MARGIN_OF_ERROR);
            if matches!(decision, SyncDecision::Stop { .. }) {
                stops += 1;
            }
            controller.apply("Throttle", decision, &assignment, &seq).await.unwrap();
        }
        assert_eq!(stops, 1);
        assert_eq!(controller.get("Throttle").await.unwrap().moving, 0);

        drop(seq);
        worker.run(CancellationToken::new()).await;
        assert_eq!(
            keyboard.keys(),
            vec![
                ("a".to_string(), sequencer::keyboard::KeyState::Down),
                ("a".to_string(), sequencer::keyboard::KeyState::Up),
            ]
        );
    }
}
