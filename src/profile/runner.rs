//! # Profile Runner
//!
//! Drives the engine from two event streams:
//!
//! 1. **Control changes** from the controller service. The device's profile
//!    is looked up (explicit selection first, then auto-select by usb id),
//!    the control's assignments are resolved and evaluated, and the effects
//!    go to the sequencer, the direct or API queue, or the sync controller.
//! 2. **Sync feedback** from the sync controller. For every feedback update
//!    the convergence decision is taken and carried out with the increase
//!    and decrease keys of the matching sync assignment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::evaluator::{AssignmentEvaluator, Effect};
use super::model::{Assignment, Profile, SyncControlAssignment};
use super::resolver::{resolve, ConditionContext};
use crate::config::PreferredControlMode;
use crate::controller::manager::{ControlChangeEvent, ControllerService, DeviceGuid};
use crate::error::{Result, TswControllerError};
use crate::output::{ApiCommand, DirectCommand, OutputAction};
use crate::sequencer::ActionSequencer;
use crate::sync::{decide, SyncBinding, SyncController, SyncStateUpdate, SyncUpdateOrigin};

/// Mutable engine settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    pub preferred_control_mode: PreferredControlMode,
    /// Explicitly selected profile id per device
    pub selected_profiles: HashMap<DeviceGuid, String>,
}

/// Consumers of evaluated effects.
#[derive(Clone)]
pub struct OutputSinks {
    pub sequencer: ActionSequencer,
    pub direct: mpsc::Sender<DirectCommand>,
    pub api: mpsc::Sender<ApiCommand>,
    /// How long to wait on a full direct or API queue
    pub enqueue_timeout: Duration,
}

async fn send_bounded<T>(tx: &mpsc::Sender<T>, value: T, timeout: Duration) -> Result<()> {
    match tx.send_timeout(value, timeout).await {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(_)) => Err(TswControllerError::QueueTimeout),
        Err(SendTimeoutError::Closed(_)) => Err(TswControllerError::QueueClosed),
    }
}

/// Profile registry, selection and evaluation loops.
///
/// Cheap to clone; clones share all state. The registry, the evaluator
/// history and the settings sit behind separate locks that are never held
/// at the same time.
#[derive(Clone)]
pub struct ProfileRunner {
    profiles: Arc<RwLock<Vec<Arc<Profile>>>>,
    evaluator: Arc<RwLock<AssignmentEvaluator>>,
    settings: Arc<RwLock<EngineSettings>>,
    controllers: ControllerService,
    sync: SyncController,
    sinks: OutputSinks,
    margin_of_error: f64,
}

impl ProfileRunner {
    #[must_use]
    pub fn new(
        controllers: ControllerService,
        sync: SyncController,
        sinks: OutputSinks,
        preferred_control_mode: PreferredControlMode,
        margin_of_error: f64,
    ) -> Self {
        Self {
            profiles: Arc::new(RwLock::new(Vec::new())),
            evaluator: Arc::new(RwLock::new(AssignmentEvaluator::new())),
            settings: Arc::new(RwLock::new(EngineSettings {
                preferred_control_mode,
                selected_profiles: HashMap::new(),
            })),
            controllers,
            sync,
            sinks,
            margin_of_error,
        }
    }

    /// Add a profile, replacing one with the same id. Clears the call history.
    pub async fn register_profile(&self, profile: Profile) -> String {
        let id = profile.id().to_string();
        {
            let mut profiles = self.profiles.write().await;
            let profile = Arc::new(profile);
            match profiles.iter_mut().find(|p| p.id() == id) {
                Some(existing) => *existing = profile,
                None => profiles.push(profile),
            }
        }
        self.evaluator.write().await.clear();
        info!("Registered profile {}", id);
        id
    }

    /// Registered profiles in registration order.
    pub async fn profiles(&self) -> Vec<Arc<Profile>> {
        self.profiles.read().await.clone()
    }

    async fn find_profile(&self, id: &str) -> Option<Arc<Profile>> {
        self.profiles.read().await.iter().find(|p| p.id() == id).cloned()
    }

    /// Select a profile for a device.
    ///
    /// # Errors
    ///
    /// Returns `ProfileNotFound` if no profile has this id; the current
    /// selection is left unchanged.
    pub async fn set_profile(&self, device: &str, profile_id: &str) -> Result<()> {
        if self.find_profile(profile_id).await.is_none() {
            return Err(TswControllerError::ProfileNotFound(profile_id.to_string()));
        }
        let previous = self
            .settings
            .write()
            .await
            .selected_profiles
            .insert(device.to_string(), profile_id.to_string());
        if previous.as_deref() != Some(profile_id) {
            self.evaluator.write().await.clear();
            info!("Device {} now uses profile {}", device, profile_id);
        }
        Ok(())
    }

    pub async fn clear_profile(&self, device: &str) {
        let removed = self.settings.write().await.selected_profiles.remove(device);
        if removed.is_some() {
            self.evaluator.write().await.clear();
            info!("Cleared profile of device {}", device);
        }
    }

    pub async fn set_preferred_control_mode(&self, mode: PreferredControlMode) {
        self.settings.write().await.preferred_control_mode = mode;
        info!("Preferred control mode: {:?}", mode);
    }

    pub async fn settings(&self) -> EngineSettings {
        self.settings.read().await.clone()
    }

    async fn selected_profile(&self, device: &str) -> Option<Arc<Profile>> {
        let id = self.settings.read().await.selected_profiles.get(device).cloned()?;
        self.find_profile(&id).await
    }

    /// The explicitly selected profile, else the first auto-select profile
    /// for `usb_id`.
    async fn active_profile(&self, device: &str, usb_id: &str) -> Option<Arc<Profile>> {
        if let Some(profile) = self.selected_profile(device).await {
            return Some(profile);
        }
        self.profiles
            .read()
            .await
            .iter()
            .find(|p| p.is_auto_select() && p.usb_id() == Some(usb_id))
            .cloned()
    }

    /// Evaluate one control change and route its effects.
    pub async fn handle_change(&self, event: &ControlChangeEvent) {
        let Some(profile) = self.active_profile(&event.device, &event.usb_id).await else {
            debug!("No profile for device {}, skipping {}", event.device, event.control_name);
            return;
        };

        let control_name = profile
            .mapping()
            .and_then(|mapping| mapping.find_by_kind_and_index(event.kind, event.index))
            .map_or(event.control_name.as_str(), |control| control.name.as_str());
        let Some(control) = profile.find_control(control_name) else {
            debug!("Profile {} has no control {}", profile.name, control_name);
            return;
        };

        let context = ConditionContext {
            controls: self.controllers.control_values(&event.device).await,
            external: self.sync.external_values().await,
        };
        let mode = self.settings.read().await.preferred_control_mode;
        let resolved = resolve(&control.assignments, Some(&context), mode);

        let effects = self
            .evaluator
            .write()
            .await
            .evaluate(control_name, &resolved, &event.state);

        for effect in effects {
            if let Err(e) = self.route(effect, &event.device, control_name).await {
                warn!("Dropped effect of {}: {}", control_name, e);
            }
        }
    }

    async fn route(&self, effect: Effect, device: &str, control_name: &str) -> Result<()> {
        match effect {
            Effect::Action(OutputAction::Keys(action)) => self.sinks.sequencer.enqueue(action).await,
            Effect::Action(OutputAction::Direct(command)) => {
                send_bounded(&self.sinks.direct, command, self.sinks.enqueue_timeout).await
            }
            Effect::Action(OutputAction::Api(command)) => {
                send_bounded(&self.sinks.api, command, self.sinks.enqueue_timeout).await
            }
            Effect::SyncTarget { identifier, value } => {
                let binding = SyncBinding { device: device.to_string(), control_name: control_name.to_string() };
                self.sync.set_target(&identifier, value, binding).await;
                Ok(())
            }
        }
    }

    /// First sync assignment for `identifier` in `profile`.
    fn find_sync_assignment<'a>(profile: &'a Profile, identifier: &str) -> Option<&'a SyncControlAssignment> {
        profile.controls.iter().find_map(|control| {
            resolve(&control.assignments, None, PreferredControlMode::SyncControl)
                .into_iter()
                .find_map(|(_, assignment)| match assignment {
                    Assignment::SyncControl(sync) if sync.identifier == identifier => Some(sync),
                    _ => None,
                })
        })
    }

    /// Take the convergence step for one sync state update.
    pub async fn handle_sync_update(&self, update: &SyncStateUpdate) {
        if update.origin != SyncUpdateOrigin::Feedback {
            return;
        }
        if self.settings.read().await.preferred_control_mode != PreferredControlMode::SyncControl {
            return;
        }
        let identifier = &update.state.identifier;
        // Re-read so the moving marker reflects steps already taken.
        let Some(state) = self.sync.get(identifier).await else {
            return;
        };
        let Some(binding) = state.binding.as_ref() else {
            return;
        };
        if state.target_value.is_none() {
            return;
        }
        let Some(profile) = self.selected_profile(&binding.device).await else {
            debug!("Device {} has no selected profile, not syncing {}", binding.device, identifier);
            return;
        };
        let Some(assignment) = Self::find_sync_assignment(&profile, identifier) else {
            debug!("Profile {} has no sync assignment for {}", profile.name, identifier);
            return;
        };

        let decision = decide(&state, self.margin_of_error);
        if let Err(e) = self.sync.apply(identifier, decision, assignment, &self.sinks.sequencer).await {
            warn!("Sync step for {} failed: {}", identifier, e);
        }
    }

    /// Consume control changes until cancelled or the source closes.
    pub async fn run_changes(self, mut changes: mpsc::Receiver<ControlChangeEvent>, cancel: CancellationToken) {
        info!("Profile runner started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = changes.recv() => match event {
                    Some(event) => self.handle_change(&event).await,
                    None => break,
                },
            }
        }
        info!("Profile runner stopped");
    }

    /// Consume sync state updates until cancelled or the source closes.
    pub async fn run_sync(self, mut updates: mpsc::Receiver<SyncStateUpdate>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => self.handle_sync_update(&update).await,
                    None => break,
                },
            }
        }
    }
}
