//! # Engine
//!
//! Wires the controller service, profile runner, sync controller, action
//! sequencer and output controllers together and spawns one task per
//! consumer loop. All tasks observe the same cancellation token.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{PreferredControlMode, ProgramConfig};
use crate::controller::calibration::ControllerCalibration;
use crate::controller::manager::{ControlChangeEvent, ControllerService, DeviceGuid, DeviceNotification, DeviceSnapshot};
use crate::controller::sdl_mapping::SdlMapping;
use crate::error::Result;
use crate::output::{ApiController, DirectController};
use crate::profile::model::Profile;
use crate::profile::runner::{EngineSettings, OutputSinks, ProfileRunner};
use crate::remote_api::RemoteApi;
use crate::sequencer::{self, keyboard::KeyboardDriver};
use crate::sync::{SyncControlState, SyncController, SyncStateUpdate};
use crate::transport::Transport;

/// Running engine.
pub struct Engine {
    controllers: ControllerService,
    sync: SyncController,
    runner: ProfileRunner,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build the engine and spawn its tasks.
    ///
    /// # Arguments
    ///
    /// * `config` - Program configuration
    /// * `notifications` - Device notification stream
    /// * `keyboard` - Key sink owned by the sequencer worker
    /// * `transport` - Link to the simulator bridge
    /// * `api` - Remote API of the simulator
    /// * `cancel` - Stops every task when cancelled
    pub fn start<K>(
        config: &ProgramConfig,
        notifications: mpsc::Receiver<DeviceNotification>,
        keyboard: K,
        transport: Arc<dyn Transport>,
        api: Arc<dyn RemoteApi>,
        cancel: CancellationToken,
    ) -> Self
    where
        K: KeyboardDriver + 'static,
    {
        let fanout_timeout = Duration::from_millis(config.engine.fanout_timeout_ms);
        let capacity = config.engine.event_queue_capacity;
        let enqueue_timeout = Duration::from_millis(config.sequencer.enqueue_timeout_ms);

        let controllers = ControllerService::new(capacity, fanout_timeout);
        let sync = SyncController::new(capacity, fanout_timeout);
        let (sequencer, worker) = sequencer::channel(
            config.sequencer.queue_capacity,
            enqueue_timeout,
            keyboard,
            config.sequencer.key_group_delay_ms,
        );
        let (direct_tx, direct_rx) = mpsc::channel(capacity);
        let (api_tx, api_rx) = mpsc::channel(capacity);

        let runner = ProfileRunner::new(
            controllers.clone(),
            sync.clone(),
            OutputSinks { sequencer: sequencer.clone(), direct: direct_tx, api: api_tx, enqueue_timeout },
            config.engine.preferred_control_mode,
            config.sync.margin_of_error,
        );

        // Subscribe before any producer runs so no early event is lost
        let changes = controllers.subscribe();
        let sync_updates = sync.subscribe();
        let sync_messages = transport.subscribe();
        let sequence_messages = transport.subscribe();

        let mut tasks = vec![
            tokio::spawn(controllers.clone().run(notifications, cancel.clone())),
            tokio::spawn(runner.clone().run_changes(changes, cancel.clone())),
            tokio::spawn(runner.clone().run_sync(sync_updates, cancel.clone())),
            tokio::spawn(sync.clone().run_transport_listener(sync_messages, cancel.clone())),
            tokio::spawn(sequencer.run_transport_listener(sequence_messages, cancel.clone())),
            tokio::spawn(DirectController::new(transport).run(direct_rx, cancel.clone())),
            tokio::spawn(ApiController::new(api.clone()).run(api_rx, cancel.clone())),
        ];
        let worker_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            worker.run(worker_cancel).await;
        }));
        if config.sync.poll_subscription {
            tasks.push(tokio::spawn(sync.clone().run_api_poller(
                api,
                config.sync.subscription_id,
                Duration::from_millis(config.sync.poll_interval_ms),
                cancel.clone(),
            )));
        }

        info!("Engine started with {} tasks", tasks.len());
        Self { controllers, sync, runner, cancel, tasks }
    }

    /// Register a profile, returning its id.
    pub async fn register_profile(&self, profile: Profile) -> String {
        self.runner.register_profile(profile).await
    }

    /// Register a mapping and calibration, returning the devices that became
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns `Calibration` if the documents are invalid or disagree on the
    /// usb id.
    pub async fn register_calibration(
        &self,
        mapping: SdlMapping,
        calibration: ControllerCalibration,
    ) -> Result<Vec<DeviceGuid>> {
        self.controllers.register_calibration(mapping, calibration).await
    }

    /// # Errors
    ///
    /// Returns `ProfileNotFound` for unknown ids.
    pub async fn set_profile(&self, device: &str, profile_id: &str) -> Result<()> {
        self.runner.set_profile(device, profile_id).await
    }

    pub async fn clear_profile(&self, device: &str) {
        self.runner.clear_profile(device).await;
    }

    pub async fn set_preferred_control_mode(&self, mode: PreferredControlMode) {
        self.runner.set_preferred_control_mode(mode).await;
    }

    pub fn subscribe_control_changes(&self) -> mpsc::Receiver<ControlChangeEvent> {
        self.controllers.subscribe()
    }

    pub fn subscribe_sync_state(&self) -> mpsc::Receiver<SyncStateUpdate> {
        self.sync.subscribe()
    }

    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        self.controllers.snapshot().await
    }

    pub async fn sync_states(&self) -> Vec<SyncControlState> {
        self.sync.snapshot().await
    }

    pub async fn profiles(&self) -> Vec<Arc<Profile>> {
        self.runner.profiles().await
    }

    pub async fn settings(&self) -> EngineSettings {
        self.runner.settings().await
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        info!("Engine stopped");
    }
}
