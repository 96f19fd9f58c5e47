//! Go Dispatcher Transport Module
//!
//! The message bus seam: the dispatcher publishes envelopes onto named
//! connectors and never talks to a broker directly.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::Envelope;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Publish to {connector} failed: {reason}")]
    PublishFailed { connector: String, reason: String },
    #[error("Bus closed")]
    Closed,
}

/// One envelope on one connector. Also the worker's stdin/stdout line format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Published {
    pub connector: String,
    pub envelope: Envelope,
}

#[async_trait]
pub trait ConnectorBus: Send + Sync {
    async fn publish(&self, connector: &str, envelope: Envelope) -> Result<(), TransportError>;
}

/// Bus that records everything published, in order.
#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<Published>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything published so far.
    pub fn take(&self) -> Vec<Published> {
        std::mem::take(&mut *self.published.lock())
    }

    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.lock().is_empty()
    }
}

#[async_trait]
impl ConnectorBus for MemoryBus {
    async fn publish(&self, connector: &str, envelope: Envelope) -> Result<(), TransportError> {
        debug!(connector = %connector, kind = envelope.kind(), id = %envelope.id(), "Published");
        self.published.lock().push(Published {
            connector: connector.to_string(),
            envelope,
        });
        Ok(())
    }
}

/// Bus that forwards every publish to a channel consumer.
pub struct ChannelBus {
    tx: mpsc::UnboundedSender<Published>,
}

impl ChannelBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Published>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConnectorBus for ChannelBus {
    async fn publish(&self, connector: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.tx
            .send(Published {
                connector: connector.to_string(),
                envelope,
            })
            .map_err(|_| TransportError::Closed)
    }
}
