//! # Remote API
//!
//! Request/response access to simulator controls, used for API-mode writes
//! and for polling the cab subscription that feeds sync control.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TswControllerError};
use crate::transport::{Transport, TransportMessage};

/// Current value of one cab control.
#[derive(Debug, Clone, PartialEq)]
pub struct CabControlValue {
    /// Input identifier as used by sync assignments
    pub identifier: String,
    pub value: f64,
    pub normalized_value: f64,
}

/// Result of polling a subscription.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionSnapshot {
    /// Class of the currently driven vehicle
    pub object_class: String,
    /// Keyed by control property name
    pub controls: HashMap<String, CabControlValue>,
}

/// Remote control API of the simulator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Write the input value of a control
    async fn set_control_value(&self, controls: &str, value: f64) -> Result<()>;

    /// Read the current values of a subscription
    async fn poll_subscription(&self, subscription_id: u32) -> Result<SubscriptionSnapshot>;
}

/// Event used by [`TransportRemoteApi`] for control writes.
pub const API_CONTROL_EVENT: &str = "api_control";

/// Remote API that forwards writes over a transport.
///
/// The bridge on the other end performs the request. Subscriptions are not
/// available this way; sync feedback arrives as `sync_control` messages instead.
pub struct TransportRemoteApi {
    transport: Arc<dyn Transport>,
}

impl TransportRemoteApi {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl RemoteApi for TransportRemoteApi {
    async fn set_control_value(&self, controls: &str, value: f64) -> Result<()> {
        let message = TransportMessage::new(API_CONTROL_EVENT)
            .with("controls", controls)
            .with("value", format!("{:.6}", value));
        self.transport.send(message).await
    }

    async fn poll_subscription(&self, subscription_id: u32) -> Result<SubscriptionSnapshot> {
        Err(TswControllerError::RemoteApi(format!(
            "subscription {} cannot be polled over the transport",
            subscription_id
        )))
    }
}
