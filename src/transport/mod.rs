//! # Transport
//!
//! Text messages exchanged with the simulator-side bridge.
//!
//! ## Wire format
//!
//! One message per line: the event name followed by comma separated
//! `key=value` pairs, keys sorted.
//!
//! ```text
//! direct_control,controls=Throttle1,flags=hold|normalized,value=0.500000
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TswControllerError};
use crate::pubsub::PubSub;

/// One transport message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportMessage {
    pub event: String,
    pub properties: BTreeMap<String, String>,
}

impl TransportMessage {
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        Self { event: event.into(), properties: BTreeMap::new() }
    }

    /// Builder-style property setter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Encode as one wire line, without the trailing newline.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut line = self.event.clone();
        for (key, value) in &self.properties {
            line.push(',');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line
    }

    /// Decode one wire line.
    ///
    /// Parts without `=` are ignored. Returns `None` for an empty event name.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsw_controller::transport::TransportMessage;
    ///
    /// let msg = TransportMessage::from_wire("sync_control, name = Throttle ,value=0.5,junk").unwrap();
    /// assert_eq!(msg.event, "sync_control");
    /// assert_eq!(msg.get("name"), Some("Throttle"));
    /// assert_eq!(msg.properties.len(), 2);
    /// ```
    #[must_use]
    pub fn from_wire(line: &str) -> Option<Self> {
        let mut parts = line.trim().split(',');
        let event = parts.next()?.trim();
        if event.is_empty() {
            return None;
        }
        let properties = parts
            .filter_map(|part| part.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Some(Self { event: event.to_string(), properties })
    }
}

/// Bidirectional message channel to the simulator bridge
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message
    async fn send(&self, message: TransportMessage) -> Result<()>;

    /// Receive every incoming message from now on
    fn subscribe(&self) -> mpsc::Receiver<TransportMessage>;
}

/// In-process transport.
///
/// Outgoing messages land on a bounded queue owned by whoever created the
/// transport; incoming messages are injected and fanned out to subscribers.
#[derive(Clone)]
pub struct LocalTransport {
    outgoing: mpsc::Sender<TransportMessage>,
    incoming: Arc<PubSub<TransportMessage>>,
    send_timeout: Duration,
}

impl LocalTransport {
    /// Create a transport and the receiver of its outgoing messages.
    #[must_use]
    pub fn new(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<TransportMessage>) {
        let (outgoing, rx) = mpsc::channel(capacity.max(1));
        let transport = Self {
            outgoing,
            incoming: Arc::new(PubSub::new(capacity, send_timeout)),
            send_timeout,
        };
        (transport, rx)
    }

    /// Deliver an incoming message to all subscribers.
    pub async fn inject(&self, message: TransportMessage) {
        self.incoming.emit(message).await;
    }

    /// Pump wire lines from `reader` into the transport until EOF or cancel.
    pub async fn read_lines<R>(&self, reader: R, cancel: CancellationToken) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => match line? {
                    Some(line) => match TransportMessage::from_wire(&line) {
                        Some(message) => self.inject(message).await,
                        None => debug!("Ignoring empty transport line"),
                    },
                    None => {
                        info!("Transport input closed");
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, message: TransportMessage) -> Result<()> {
        self.outgoing
            .send_timeout(message, self.send_timeout)
            .await
            .map_err(|e| TswControllerError::Transport(format!("Failed to send message: {}", e)))
    }

    fn subscribe(&self) -> mpsc::Receiver<TransportMessage> {
        self.incoming.subscribe()
    }
}

/// Write outgoing messages to `writer`, one wire line each.
pub async fn write_lines<W>(mut messages: mpsc::Receiver<TransportMessage>, mut writer: W, cancel: CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.recv() => {
                let Some(message) = message else { break };
                let mut line = message.to_wire();
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("Failed to write transport message: {}", e);
                    return Err(e.into());
                }
                writer.flush().await?;
            }
        }
    }
    Ok(())
}
