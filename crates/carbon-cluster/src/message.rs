//! Cluster messages and their receiving-side handling

use crate::error::Result;
use crate::member::ClusterMember;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// Marker recorded by a receiver once a message has been executed
pub const EXECUTED: &str = "Executed";

/// How long received messages are remembered for de-duplication
pub const RECEIVED_MESSAGE_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Period of the received-message cleanup task
pub const RECEIVED_CLEANUP_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Upper bound of entries dropped by one cleanup pass
pub const MAX_PURGE_PER_PASS: usize = 5000;

/// Application message carried across the cluster.
///
/// The payload is opaque to the messaging layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    execution_marker: Option<String>,
    /// Reply set by the executing handler and returned to the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<serde_json::Value>,
}

impl ClusterMessage {
    pub fn new<T: Into<String>>(topic: T, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            payload,
            execution_marker: None,
            response: None,
        }
    }

    /// Build a message from any serializable payload
    pub fn from_serializable<T: Into<String>, P: Serialize>(topic: T, payload: &P) -> Result<Self> {
        Ok(Self::new(topic, serde_json::to_value(payload)?))
    }

    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn mark_executed<T: Into<String>>(&mut self, marker: T) {
        self.execution_marker = Some(marker.into());
    }

    pub fn execution_marker(&self) -> Option<&str> {
        self.execution_marker.as_deref()
    }

    pub fn is_executed(&self) -> bool {
        self.execution_marker.is_some()
    }

    /// Set the reply returned to the sender once this message is executed
    pub fn set_response(&mut self, response: serde_json::Value) {
        self.response = Some(response);
    }

    pub fn response(&self) -> Option<&serde_json::Value> {
        self.response.as_ref()
    }
}

/// Reply a member returned for an executed message
#[derive(Debug, Clone, PartialEq)]
pub struct MemberResponse {
    pub member: ClusterMember,
    pub payload: serde_json::Value,
}

/// Application logic that executes received cluster messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Execute a message. Returning an error makes the receiver refuse it.
    ///
    /// A response set with [`ClusterMessage::set_response`] is returned to
    /// the sender.
    async fn execute(&self, message: &mut ClusterMessage, sender: &ClusterMember) -> Result<()>;
}

/// Handler used when the application registers none
#[derive(Debug, Default)]
pub struct LoggingMessageHandler;

#[async_trait]
impl MessageHandler for LoggingMessageHandler {
    async fn execute(&self, message: &mut ClusterMessage, sender: &ClusterMember) -> Result<()> {
        tracing::info!(
            "Received cluster message {} (topic '{}') from {}",
            message.id,
            message.topic,
            sender.address
        );
        Ok(())
    }
}

/// How the execution of a received message ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Executed, with the handler's response if it set one
    Executed(Option<serde_json::Value>),
    /// The handler refused the message
    Failed(String),
}

/// Result of claiming a received message id
#[derive(Debug)]
pub enum Reservation {
    /// First sighting; the caller executes the message
    Granted,
    /// Seen before; yields the outcome once the first execution settles
    Duplicate(watch::Receiver<Option<ExecutionOutcome>>),
}

#[derive(Debug)]
struct ReceivedEntry {
    received_at: Instant,
    message: Option<ClusterMessage>,
    outcome: watch::Sender<Option<ExecutionOutcome>>,
}

/// Messages received by this node, keyed by message id
#[derive(Debug, Default)]
pub struct ReceivedMessages {
    entries: DashMap<Uuid, ReceivedEntry>,
}

impl ReceivedMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a message id for execution
    pub fn reserve(&self, id: Uuid) -> Reservation {
        match self.entries.entry(id) {
            Entry::Occupied(occupied) => Reservation::Duplicate(occupied.get().outcome.subscribe()),
            Entry::Vacant(vacant) => {
                let (outcome, _) = watch::channel(None);
                vacant.insert(ReceivedEntry {
                    received_at: Instant::now(),
                    message: None,
                    outcome,
                });
                Reservation::Granted
            }
        }
    }

    /// Record the executed message under its reserved id
    pub fn complete(&self, message: ClusterMessage) {
        let outcome = ExecutionOutcome::Executed(message.response.clone());

        match self.entries.entry(message.id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.message = Some(message);
                entry.outcome.send_replace(Some(outcome));
            }
            Entry::Vacant(vacant) => {
                let (sender, _) = watch::channel(Some(outcome));
                vacant.insert(ReceivedEntry {
                    received_at: Instant::now(),
                    message: Some(message),
                    outcome: sender,
                });
            }
        }
    }

    /// Give up a reservation whose execution failed.
    ///
    /// Duplicates waiting on it observe the failure; the id may be claimed again.
    pub fn release(&self, id: &Uuid, reason: &str) {
        if let Some((_, entry)) = self.entries.remove_if(id, |_, entry| entry.message.is_none()) {
            entry
                .outcome
                .send_replace(Some(ExecutionOutcome::Failed(reason.to_string())));
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<ClusterMessage> {
        self.entries.get(id).and_then(|entry| entry.message.clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries older than `lifetime`, at most `max` per call
    pub fn purge_expired(&self, lifetime: Duration, max: usize) -> usize {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| entry.received_at.elapsed() >= lifetime)
            .map(|entry| *entry.key())
            .take(max)
            .collect();

        for id in &expired {
            self.entries.remove(id);
        }
        expired.len()
    }
}
