//! # Output Controllers
//!
//! One-shot value commands produced by the evaluator and the consumers that
//! deliver them: direct commands go over the transport, API commands through
//! the remote API.
//!
//! Every output has a canonical string. The evaluator compares these strings
//! to decide whether a toggle should flip.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::remote_api::RemoteApi;
use crate::sequencer::SequencerAction;
use crate::transport::{Transport, TransportMessage};

/// Transport event of a direct command.
pub const DIRECT_CONTROL_EVENT: &str = "direct_control";

/// Value written straight to a simulator control.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectCommand {
    pub controls: String,
    pub value: f64,
    pub hold: bool,
    pub relative: bool,
    /// `value` is normalized rather than in control units
    pub normalized: bool,
}

impl DirectCommand {
    /// Set flags in wire order.
    #[must_use]
    pub fn flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.hold {
            flags.push("hold");
        }
        if self.relative {
            flags.push("relative");
        }
        if self.normalized {
            flags.push("normalized");
        }
        flags
    }

    /// `controls,value,flag|flag` with six decimals.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsw_controller::output::DirectCommand;
    ///
    /// let command = DirectCommand {
    ///     controls: "Throttle1".to_string(),
    ///     value: 0.5,
    ///     hold: true,
    ///     relative: false,
    ///     normalized: true,
    /// };
    /// assert_eq!(command.canonical(), "Throttle1,0.500000,hold|normalized");
    /// ```
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{},{:.6},{}", self.controls, self.value, self.flags().join("|"))
    }

    #[must_use]
    pub fn to_message(&self) -> TransportMessage {
        TransportMessage::new(DIRECT_CONTROL_EVENT)
            .with("controls", self.controls.as_str())
            .with("value", format!("{:.6}", self.value))
            .with("flags", self.flags().join("|"))
    }
}

/// Value written through the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCommand {
    pub controls: String,
    pub value: f64,
}

impl ApiCommand {
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("api_control_command:{}:{:.6}", self.controls, self.value)
    }
}

/// Anything an assignment can emit besides a sync target.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputAction {
    Keys(SequencerAction),
    Direct(DirectCommand),
    Api(ApiCommand),
}

impl OutputAction {
    /// Comparison key for toggle flipping. Key actions compare by combo only.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            OutputAction::Keys(action) => action.keys.clone(),
            OutputAction::Direct(command) => command.canonical(),
            OutputAction::Api(command) => command.canonical(),
        }
    }

    #[must_use]
    pub fn as_keys(&self) -> Option<&SequencerAction> {
        match self {
            OutputAction::Keys(action) => Some(action),
            _ => None,
        }
    }
}

/// Sends direct commands over the transport.
pub struct DirectController {
    transport: Arc<dyn Transport>,
}

impl DirectController {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Forward commands until cancelled or the queue closes.
    pub async fn run(self, mut commands: mpsc::Receiver<DirectCommand>, cancel: CancellationToken) {
        info!("Direct controller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    debug!("Direct command {}", command.canonical());
                    if let Err(e) = self.transport.send(command.to_message()).await {
                        error!("Failed to send direct command {}: {}", command.canonical(), e);
                    }
                }
            }
        }
        info!("Direct controller stopped");
    }
}

/// Writes API commands through the remote API.
pub struct ApiController {
    api: Arc<dyn RemoteApi>,
}

impl ApiController {
    #[must_use]
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self { api }
    }

    /// Forward commands until cancelled or the queue closes. Failed writes are
    /// logged and skipped.
    pub async fn run(self, mut commands: mpsc::Receiver<ApiCommand>, cancel: CancellationToken) {
        info!("API controller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    debug!("API command {}", command.canonical());
                    if let Err(e) = self.api.set_control_value(&command.controls, command.value).await {
                        error!("Failed to set {} to {}: {}", command.controls, command.value, e);
                    }
                }
            }
        }
        info!("API controller stopped");
    }
}
