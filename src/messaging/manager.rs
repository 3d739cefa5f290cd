//! MessagingManager: Fan-in and routing for all adapters.

use crate::error::{MessagingError, Result};
use crate::messaging::traits::{InboundStream, Messaging, MessagingDyn};
use crate::{InboundMessage, OutboundResponse, StatusUpdate};

use futures::StreamExt as _;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// Manages all messaging adapters.
///
/// Adapter streams are forwarded into one channel. The merged stream ends
/// once every adapter stream has ended.
pub struct MessagingManager {
    adapters: RwLock<HashMap<String, Arc<dyn MessagingDyn>>>,
}

impl MessagingManager {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Register an adapter (before start).
    pub async fn register(&self, adapter: impl Messaging) {
        let name = adapter.name().to_string();
        tracing::info!(adapter = %name, "registered messaging adapter");
        self.adapters.write().await.insert(name, Arc::new(adapter));
    }

    /// Start all registered adapters and return the merged inbound stream.
    ///
    /// An adapter that fails to start is logged and skipped.
    pub async fn start(&self) -> Result<InboundStream> {
        let (fan_in_tx, fan_in_rx) = mpsc::channel(512);

        let adapters = self.adapters.read().await;
        for (name, adapter) in adapters.iter() {
            match adapter.start().await {
                Ok(stream) => Self::spawn_forwarder(name.clone(), stream, fan_in_tx.clone()),
                Err(error) => {
                    tracing::error!(adapter = %name, %error, "adapter failed to start, skipping")
                }
            }
        }

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(
            fan_in_rx,
        )))
    }

    /// Spawn a task that forwards messages from an adapter stream into the fan-in channel.
    fn spawn_forwarder(
        name: String,
        mut stream: InboundStream,
        fan_in_tx: mpsc::Sender<InboundMessage>,
    ) {
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                if fan_in_tx.send(message).await.is_err() {
                    tracing::warn!(adapter = %name, "fan-in channel closed, stopping forwarder");
                    break;
                }
            }
            tracing::info!(adapter = %name, "adapter stream ended");
        });
    }

    async fn adapter(&self, name: &str) -> Result<Arc<dyn MessagingDyn>> {
        self.adapters
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MessagingError::UnknownAdapter(name.to_string()).into())
    }

    /// Route a response back to the correct adapter based on message source.
    pub async fn respond(&self, message: &InboundMessage, response: OutboundResponse) -> Result<()> {
        let adapter = self.adapter(&message.source).await?;
        adapter.respond(message, response).await
    }

    /// Route a status update to the correct adapter.
    pub async fn send_status(&self, message: &InboundMessage, status: StatusUpdate) -> Result<()> {
        let adapter = self.adapter(&message.source).await?;
        adapter.send_status(message, status).await
    }

    /// Per-message length limit of the named adapter.
    pub async fn max_message_length(&self, source: &str) -> Result<usize> {
        Ok(self.adapter(source).await?.max_message_length())
    }

    /// Run every adapter's health check, returning the failures by name.
    pub async fn health_check(&self) -> Vec<(String, crate::Error)> {
        let adapters = self.adapters.read().await;
        let mut failures = Vec::new();
        for (name, adapter) in adapters.iter() {
            if let Err(error) = adapter.health_check().await {
                failures.push((name.clone(), error));
            }
        }
        failures
    }

    /// Shut down all adapters gracefully.
    pub async fn shutdown(&self) {
        let adapters = self.adapters.read().await;
        for (name, adapter) in adapters.iter() {
            if let Err(error) = adapter.shutdown().await {
                tracing::warn!(adapter = %name, %error, "failed to shut down adapter");
            }
        }
    }
}

impl Default for MessagingManager {
    fn default() -> Self {
        Self::new()
    }
}
