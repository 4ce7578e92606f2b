//! Event publishers
//!
//! [`TracingEventPublisher`] writes each event as a structured log line.
//! [`ChannelEventPublisher`] hands events to an in-process consumer through
//! a bounded channel; a full or closed channel is reported as a failure,
//! which callers log and move on from.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::ingestion::{BatchEvent, EventPublisher, FailureCategory, IngestionError};

#[derive(Debug, Clone, Default)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: &BatchEvent) -> Result<(), IngestionError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| IngestionError::Internal(format!("event encoding: {}", e)))?;
        info!(
            event = event.name(),
            batch_id = %event.batch_id(),
            terminal = event.is_terminal_notification(),
            payload = %payload,
            "Batch event"
        );
        Ok(())
    }
}

/// Sender side of the event channel
#[derive(Clone)]
pub struct ChannelEventPublisher {
    tx: mpsc::Sender<BatchEvent>,
}

/// Receiver side of the event channel
pub struct EventReceiver {
    rx: mpsc::Receiver<BatchEvent>,
}

impl EventReceiver {
    /// Try to receive an event (non-blocking)
    pub fn try_recv(&mut self) -> Option<BatchEvent> {
        self.rx.try_recv().ok()
    }

    /// Receive an event (waits until available or every sender is gone)
    pub async fn recv(&mut self) -> Option<BatchEvent> {
        self.rx.recv().await
    }
}

/// Create a new event channel pair
pub fn event_channel(buffer: usize) -> (ChannelEventPublisher, EventReceiver) {
    let (tx, rx) = mpsc::channel(buffer);
    (ChannelEventPublisher { tx }, EventReceiver { rx })
}

#[async_trait]
impl EventPublisher for ChannelEventPublisher {
    async fn publish(&self, event: &BatchEvent) -> Result<(), IngestionError> {
        self.tx.try_send(event.clone()).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "event channel full",
                mpsc::error::TrySendError::Closed(_) => "event channel closed",
            };
            IngestionError::dependency("event-channel", FailureCategory::Unavailable, reason)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{BankId, BatchId};
    use chrono::Utc;

    fn started(id: &str) -> BatchEvent {
        BatchEvent::ProcessingStarted {
            batch_id: BatchId::new(id),
            bank_id: BankId::new("B1"),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (publisher, mut receiver) = event_channel(4);
        publisher.publish(&started("a")).await.unwrap();
        publisher.publish(&started("b")).await.unwrap();

        assert_eq!(receiver.recv().await.unwrap().batch_id().as_str(), "a");
        assert_eq!(receiver.try_recv().unwrap().batch_id().as_str(), "b");
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_or_closed_channel_fails_publish() {
        let (publisher, receiver) = event_channel(1);
        publisher.publish(&started("a")).await.unwrap();
        let err = publisher.publish(&started("b")).await.unwrap_err();
        assert!(err.to_string().contains("full"));

        drop(receiver);
        let err = publisher.publish(&started("c")).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_tracing_publisher_never_fails() {
        TracingEventPublisher.publish(&started("a")).await.unwrap();
    }
}
