//! Message Bus for engine-to-UI communication
//!
//! The MessageBus provides a pub/sub pattern for the orchestrator, sequencer
//! and connector management to report progress without knowing who listens.
//! It uses bounded channels to prevent unbounded memory growth and supports
//! both specific event subscriptions and global "All" subscriptions.
//!
//! Publishing never waits on a subscriber: the coordination loop publishes
//! from inside its event loop, so a full channel drops the event for that
//! subscriber instead of stalling dispatch.

use sdk::TokenUsage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// An Output (or workflow lane cell) was created and dispatched
    OutputCreated,
    /// A run-matrix cell reached its terminal state
    OutputFinished,
    /// A workflow lane moved on to its next chain
    WorkflowAdvanced,
    /// A workflow lane became terminal
    WorkflowFinished,
    /// A connector package was installed or upgraded
    ConnectorInstalled,
    /// A connector package was removed
    ConnectorUninstalled,
    /// A connector failed while running a model
    ConnectorFailed,
    /// Subscribe to all event types
    All,
}

/// Result of one run-matrix cell
///
/// For workflow cells `output_id` is the WorkflowOutput id and
/// `workflow_id` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEvent {
    pub output_id: String,
    pub chain_id: String,
    pub model_id: String,
    pub workflow_id: Option<String>,
    pub content: Option<String>,
    pub error: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone)]
pub enum Event {
    OutputCreated {
        output_id: String,
        chain_id: String,
        model_id: String,
        workflow_id: Option<String>,
    },
    OutputFinished(OutputEvent),
    WorkflowAdvanced {
        workflow_output_id: String,
        workflow_id: String,
        chain_id: String,
        step: usize,
    },
    WorkflowFinished {
        workflow_output_id: String,
        workflow_id: String,
        error: Option<String>,
    },
    ConnectorInstalled {
        connector_id: String,
        version_tag: String,
    },
    ConnectorUninstalled {
        connector_id: String,
    },
    ConnectorFailed {
        connector_id: String,
        model_id: String,
        error: String,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::OutputCreated { .. } => EventType::OutputCreated,
            Event::OutputFinished(_) => EventType::OutputFinished,
            Event::WorkflowAdvanced { .. } => EventType::WorkflowAdvanced,
            Event::WorkflowFinished { .. } => EventType::WorkflowFinished,
            Event::ConnectorInstalled { .. } => EventType::ConnectorInstalled,
            Event::ConnectorUninstalled { .. } => EventType::ConnectorUninstalled,
            Event::ConnectorFailed { .. } => EventType::ConnectorFailed,
        }
    }
}

/// Message bus for pub/sub communication between the engine and its front end
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    /// Each subscriber gets a bounded channel with CHANNEL_BUFFER_SIZE capacity
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    /// Create a new MessageBus
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type
    ///
    /// # Arguments
    /// * `event_type` - The type of events to subscribe to, or EventType::All for all events
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to all subscribers
    ///
    /// The event is sent to all subscribers of the specific event type, as
    /// well as all subscribers of EventType::All. Closed subscribers are
    /// pruned; a full subscriber misses the event.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("Subscriber for {:?} is full, dropping event", key);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(output_id: &str) -> Event {
        Event::OutputFinished(OutputEvent {
            output_id: output_id.to_string(),
            chain_id: "chain-1".to_string(),
            model_id: "gpt".to_string(),
            workflow_id: None,
            content: Some("hello".to_string()),
            error: None,
            token_usage: None,
        })
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::OutputFinished).await;

        bus.publish(finished("out-1")).await;

        match rx.recv().await.unwrap() {
            Event::OutputFinished(event) => {
                assert_eq!(event.output_id, "out-1");
                assert_eq!(event.content.as_deref(), Some("hello"));
            }
            _ => panic!("Wrong event type received"),
        }
    }

    #[tokio::test]
    async fn test_all_event_type() {
        let bus = MessageBus::new();
        let mut rx_all = bus.subscribe(EventType::All).await;
        let mut rx_specific = bus.subscribe(EventType::ConnectorInstalled).await;

        bus.publish(Event::ConnectorInstalled {
            connector_id: "echo".to_string(),
            version_tag: "1.0.0".to_string(),
        })
        .await;

        assert!(matches!(
            rx_all.recv().await.unwrap(),
            Event::ConnectorInstalled { .. }
        ));
        assert!(matches!(
            rx_specific.recv().await.unwrap(),
            Event::ConnectorInstalled { .. }
        ));
    }

    #[tokio::test]
    async fn test_different_event_types() {
        let bus = MessageBus::new();
        let mut rx_created = bus.subscribe(EventType::OutputCreated).await;
        let mut rx_finished = bus.subscribe(EventType::OutputFinished).await;

        bus.publish(Event::OutputCreated {
            output_id: "out-2".to_string(),
            chain_id: "chain-1".to_string(),
            model_id: "gpt".to_string(),
            workflow_id: None,
        })
        .await;

        assert!(rx_created.recv().await.is_some());
        assert!(rx_finished.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::OutputFinished).await;

        for i in 0..CHANNEL_BUFFER_SIZE + 10 {
            bus.publish(finished(&format!("out-{}", i))).await;
        }

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, CHANNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let bus = MessageBus::new();
        let rx = bus.subscribe(EventType::OutputFinished).await;
        drop(rx);

        bus.publish(finished("out-3")).await;

        let channels = bus.channels.lock().await;
        assert!(channels
            .get(&EventType::OutputFinished)
            .map(|subs| subs.is_empty())
            .unwrap_or(true));
    }
}
