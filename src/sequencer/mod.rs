//! # Action Sequencer
//!
//! Serializes simulated key presses onto a single keyboard.
//!
//! Producers (the assignment evaluator, the sync controller and remote
//! `action_sequence` messages) share a cloneable [`ActionSequencer`] handle.
//! Exactly one [`SequencerWorker`] owns the keyboard and executes actions in
//! order, since overlapping combos would leave modifiers in a wrong state.
//!
//! ## Execution order
//!
//! For `ctrl+shift+a` with a press time:
//!
//! 1. press `ctrl`, `shift`; wait the key-group delay
//! 2. press `a`; wait the key-group delay
//! 3. sleep the press time
//! 4. release `a`; wait; release `ctrl`, `shift`; wait
//! 5. sleep the wait time

pub mod keyboard;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TswControllerError};
use crate::profile::model::KeysAction;
use crate::transport::TransportMessage;
use keyboard::{KeyState, KeyboardDriver};

/// Default backlog of queued actions.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Default time a producer waits on a full queue before dropping the action.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default pause between the modifier group and the other keys.
pub const DEFAULT_KEY_GROUP_DELAY_MS: u64 = 30;

/// Transport event carrying a remotely requested key action.
pub const ACTION_SEQUENCE_EVENT: &str = "action_sequence";

/// Keys pressed before, and released after, the rest of a combo.
pub const MODIFIER_KEYS: &[&str] = &[
    "cmd", "lcmd", "rcmd", "alt", "lalt", "ralt", "ctrl", "lctrl", "rctrl", "control", "shift", "lshift",
    "rshift",
];

/// One queued key action.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerAction {
    /// Combo such as `ctrl+shift+a`
    pub keys: String,
    /// Seconds to hold before releasing; 0 holds until an explicit release
    pub press_time: f64,
    /// Seconds to pause after the combo
    pub wait_time: f64,
    /// Release the combo instead of pressing it
    pub release: bool,
}

impl SequencerAction {
    /// Press and hold `keys`.
    #[must_use]
    pub fn press(keys: impl Into<String>) -> Self {
        Self { keys: keys.into(), press_time: 0.0, wait_time: 0.0, release: false }
    }

    /// Release `keys`.
    #[must_use]
    pub fn release(keys: impl Into<String>) -> Self {
        Self { release: true, ..Self::press(keys) }
    }

    #[must_use]
    pub fn from_keys_action(action: &KeysAction, release: bool) -> Self {
        Self {
            keys: action.keys.clone(),
            press_time: action.press_time.unwrap_or(0.0),
            wait_time: action.wait_time.unwrap_or(0.0),
            release,
        }
    }

    /// The same combo as a release.
    #[must_use]
    pub fn released(&self) -> Self {
        Self { release: true, ..self.clone() }
    }

    /// Decode a remote `action_sequence` message.
    ///
    /// Unparseable times read as 0 and an unparseable release flag as false.
    #[must_use]
    pub fn from_message(message: &TransportMessage) -> Option<Self> {
        if message.event != ACTION_SEQUENCE_EVENT {
            return None;
        }
        let keys = message.get("keys").filter(|k| !k.is_empty())?;
        let number = |key: &str| message.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
        Some(Self {
            keys: keys.to_string(),
            press_time: number("press_time"),
            wait_time: number("wait_time"),
            release: message.get("release").and_then(|v| v.parse::<bool>().ok()).unwrap_or(false),
        })
    }
}

/// Split a combo into `(modifiers, other keys)`, lowercased, order kept.
///
/// # Examples
///
/// ```
/// use tsw_controller::sequencer::split_keys;
///
/// let (modifiers, keys) = split_keys("Ctrl+Shift+A");
/// assert_eq!(modifiers, vec!["ctrl", "shift"]);
/// assert_eq!(keys, vec!["a"]);
/// ```
#[must_use]
pub fn split_keys(keys: &str) -> (Vec<String>, Vec<String>) {
    keys.split('+')
        .map(|key| key.trim().to_lowercase())
        .filter(|key| !key.is_empty())
        .partition(|key| MODIFIER_KEYS.contains(&key.as_str()))
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct ActionSequencer {
    tx: mpsc::Sender<SequencerAction>,
    enqueue_timeout: Duration,
}

impl ActionSequencer {
    /// Queue an action for the worker.
    ///
    /// # Errors
    ///
    /// * `QueueTimeout` - the queue stayed full past the enqueue timeout; the
    ///   action was dropped
    /// * `QueueClosed` - the worker has shut down
    pub async fn enqueue(&self, action: SequencerAction) -> Result<()> {
        match self.tx.send_timeout(action, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(action)) => {
                warn!("Action queue full, dropping {:?}", action);
                Err(TswControllerError::QueueTimeout)
            }
            Err(SendTimeoutError::Closed(_)) => Err(TswControllerError::QueueClosed),
        }
    }

    /// Enqueue `action_sequence` messages from a transport subscription.
    pub async fn run_transport_listener(self, mut messages: mpsc::Receiver<TransportMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = messages.recv() => {
                    let Some(message) = message else { break };
                    if let Some(action) = SequencerAction::from_message(&message) {
                        debug!("Remote action {:?}", action);
                        if let Err(e) = self.enqueue(action).await {
                            warn!("Failed to enqueue remote action: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// Single consumer that owns the keyboard.
pub struct SequencerWorker<K> {
    rx: mpsc::Receiver<SequencerAction>,
    keyboard: K,
    key_group_delay_ms: u64,
}

/// Create a connected producer handle and worker.
///
/// # Arguments
///
/// * `capacity` - Queue backlog
/// * `enqueue_timeout` - How long a producer waits on a full queue
/// * `keyboard` - Key sink owned by the worker
/// * `key_group_delay_ms` - Pause between key groups
pub fn channel<K: KeyboardDriver>(
    capacity: usize,
    enqueue_timeout: Duration,
    keyboard: K,
    key_group_delay_ms: u64,
) -> (ActionSequencer, SequencerWorker<K>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ActionSequencer { tx, enqueue_timeout },
        SequencerWorker { rx, keyboard, key_group_delay_ms },
    )
}

impl<K: KeyboardDriver> SequencerWorker<K> {
    /// Execute actions until cancelled or every producer is gone.
    ///
    /// On shutdown the queue is closed and drained: pending releases still
    /// run so no key stays held, pending presses are dropped.
    pub async fn run(mut self, cancel: CancellationToken) -> K {
        info!("Action sequencer started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                action = self.rx.recv() => match action {
                    Some(action) => self.execute(&action).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        while let Ok(action) = self.rx.try_recv() {
            if action.release {
                self.execute(&action).await;
            } else {
                warn!("Dropping queued press of '{}' on shutdown", action.keys);
            }
        }
        info!("Action sequencer stopped");
        self.keyboard
    }

    async fn execute(&mut self, action: &SequencerAction) {
        debug!("Executing {:?}", action);
        let (modifiers, keys) = split_keys(&action.keys);

        if action.release {
            self.toggle_groups(&keys, &modifiers, KeyState::Up).await;
            return;
        }

        self.toggle_groups(&modifiers, &keys, KeyState::Down).await;
        if action.press_time > 0.0 {
            self.keyboard.sleep_ms(seconds_to_ms(action.press_time)).await;
            self.toggle_groups(&keys, &modifiers, KeyState::Up).await;
        }
        if action.wait_time > 0.0 {
            self.keyboard.sleep_ms(seconds_to_ms(action.wait_time)).await;
        }
    }

    async fn toggle_groups(&mut self, first: &[String], second: &[String], state: KeyState) {
        for group in [first, second] {
            for key in group {
                if let Err(e) = self.keyboard.set_key(key, state).await {
                    warn!("Failed to set {} {:?}: {}", key, state, e);
                }
            }
            self.keyboard.sleep_ms(self.key_group_delay_ms).await;
        }
    }
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round() as u64
}


#[cfg(test)]
mod tests {
    use super::keyboard::MockKeyboardDriver;
    use super::mocks::{KeyboardCall, RecordingKeyboard};
    use super::*;
    use std::collections::BTreeMap;
    use tokio_test::{assert_ok, assert_pending, assert_ready_ok, task};

    fn down(key: &str) -> (String, KeyState) {
        (key.to_string(), KeyState::Down)
    }

    fn up(key: &str) -> (String, KeyState) {
        (key.to_string(), KeyState::Up)
    }

    async fn run_actions(actions: Vec<SequencerAction>) -> RecordingKeyboard {
        let keyboard = RecordingKeyboard::default();
        let (sequencer, worker) = channel(8, DEFAULT_ENQUEUE_TIMEOUT, keyboard.clone(), 30);
        for action in actions {
            sequencer.enqueue(action).await.unwrap();
        }
        drop(sequencer);
        worker.run(CancellationToken::new()).await;
        keyboard
    }

    // ==================== Key Splitting Tests ====================

    #[test]
    fn test_split_keys() {
        let (modifiers, keys) = split_keys("ctrl+shift+a");
        assert_eq!(modifiers, vec!["ctrl", "shift"]);
        assert_eq!(keys, vec!["a"]);
    }

    #[test]
    fn test_split_keys_lowercases_and_keeps_order() {
        let (modifiers, keys) = split_keys("RShift+PageUp+LAlt+x");
        assert_eq!(modifiers, vec!["rshift", "lalt"]);
        assert_eq!(keys, vec!["pageup", "x"]);
    }

    #[test]
    fn test_split_single_key() {
        let (modifiers, keys) = split_keys("space");
        assert!(modifiers.is_empty());
        assert_eq!(keys, vec!["space"]);
    }

    // ==================== Execution Tests ====================

    #[tokio::test]
    async fn test_press_holds_keys() {
        let keyboard = run_actions(vec![SequencerAction::press("ctrl+a")]).await;
        assert_eq!(keyboard.keys(), vec![down("ctrl"), down("a")]);
        assert_eq!(
            keyboard.calls(),
            vec![
                KeyboardCall::Key("ctrl".into(), KeyState::Down),
                KeyboardCall::Sleep(30),
                KeyboardCall::Key("a".into(), KeyState::Down),
                KeyboardCall::Sleep(30),
            ]
        );
    }

    #[tokio::test]
    async fn test_press_time_releases_in_reverse_group_order() {
        let action = SequencerAction { press_time: 0.2, wait_time: 0.5, ..SequencerAction::press("ctrl+shift+a") };
        let keyboard = run_actions(vec![action]).await;
        assert_eq!(
            keyboard.keys(),
            vec![down("ctrl"), down("shift"), down("a"), up("a"), up("ctrl"), up("shift")]
        );
        let calls = keyboard.calls();
        assert!(calls.contains(&KeyboardCall::Sleep(200)));
        assert_eq!(calls.last(), Some(&KeyboardCall::Sleep(500)));
    }

    #[tokio::test]
    async fn test_release_skips_press_phase() {
        let keyboard = run_actions(vec![SequencerAction::release("ctrl+a")]).await;
        assert_eq!(keyboard.keys(), vec![up("a"), up("ctrl")]);
    }

    #[tokio::test]
    async fn test_actions_execute_in_order() {
        let keyboard = run_actions(vec![SequencerAction::press("a"), SequencerAction::release("a"), SequencerAction::press("b")]).await;
        assert_eq!(keyboard.keys(), vec![down("a"), up("a"), down("b")]);
    }

    #[tokio::test]
    async fn test_keyboard_error_does_not_stop_worker() {
        let mut keyboard = MockKeyboardDriver::new();
        keyboard
            .expect_set_key()
            .withf(|key, _| key == "hyper")
            .returning(|key, _| Err(TswControllerError::UnknownKey(key.to_string())));
        keyboard.expect_set_key().withf(|key, _| key == "b").times(1).returning(|_, _| Ok(()));
        keyboard.expect_sleep_ms().returning(|_| ());

        let (sequencer, worker) = channel(8, DEFAULT_ENQUEUE_TIMEOUT, keyboard, 30);
        sequencer.enqueue(SequencerAction::press("hyper")).await.unwrap();
        sequencer.enqueue(SequencerAction::press("b")).await.unwrap();
        drop(sequencer);
        worker.run(CancellationToken::new()).await;
    }

    // ==================== Queue Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_times_out_when_full() {
        let (sequencer, _worker) = channel(1, Duration::from_secs(1), RecordingKeyboard::default(), 30);
        sequencer.enqueue(SequencerAction::press("a")).await.unwrap();
        let result = sequencer.enqueue(SequencerAction::press("b")).await;
        assert!(matches!(result, Err(TswControllerError::QueueTimeout)));
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_free_slot() {
        let (sequencer, mut worker) = channel(1, Duration::from_secs(1), RecordingKeyboard::default(), 0);
        assert_ok!(sequencer.enqueue(SequencerAction::press("a")).await);

        let mut pending = task::spawn(sequencer.enqueue(SequencerAction::press("b")));
        assert_pending!(pending.poll());

        assert!(worker.rx.try_recv().is_ok());
        assert!(pending.is_woken());
        assert_ready_ok!(pending.poll());
    }

    #[tokio::test]
    async fn test_enqueue_after_worker_gone() {
        let (sequencer, worker) = channel(1, Duration::from_secs(1), RecordingKeyboard::default(), 30);
        drop(worker);
        let result = sequencer.enqueue(SequencerAction::press("a")).await;
        assert!(matches!(result, Err(TswControllerError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_drains_releases_only() {
        let keyboard = RecordingKeyboard::default();
        let (sequencer, worker) = channel(8, DEFAULT_ENQUEUE_TIMEOUT, keyboard.clone(), 30);
        sequencer.enqueue(SequencerAction::press("a")).await.unwrap();
        sequencer.enqueue(SequencerAction::release("b")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        worker.run(cancel).await;

        assert_eq!(keyboard.keys(), vec![up("b")]);
    }

    // ==================== Remote Action Tests ====================

    fn message(props: &[(&str, &str)]) -> TransportMessage {
        TransportMessage {
            event: ACTION_SEQUENCE_EVENT.to_string(),
            properties: props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_action_from_message() {
        let action = SequencerAction::from_message(&message(&[
            ("keys", "ctrl+a"),
            ("press_time", "0.500000"),
            ("wait_time", "x"),
            ("release", "false"),
        ]))
        .unwrap();
        assert_eq!(action, SequencerAction { press_time: 0.5, ..SequencerAction::press("ctrl+a") });
    }

    #[test]
    fn test_action_from_other_event_ignored() {
        let mut msg = message(&[("keys", "a")]);
        msg.event = "direct_control".to_string();
        assert!(SequencerAction::from_message(&msg).is_none());
        assert!(SequencerAction::from_message(&message(&[])).is_none());
    }

    #[tokio::test]
    async fn test_transport_listener_enqueues() {
        let keyboard = RecordingKeyboard::default();
        let (sequencer, worker) = channel(8, DEFAULT_ENQUEUE_TIMEOUT, keyboard.clone(), 30);
        let (tx, rx) = mpsc::channel(4);
        tx.send(message(&[("keys", "x"), ("release", "true")])).await.unwrap();
        drop(tx);

        sequencer.run_transport_listener(rx, CancellationToken::new()).await;
        worker.run(CancellationToken::new()).await;
        assert_eq!(keyboard.keys(), vec![up("x")]);
    }
}
