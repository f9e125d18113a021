//! Fan-out of tailed lines to whoever is listening for a log.
//!
//! The engine only knows [`BroadcastSink`]: a fire-and-forget `send`
//! addressed by log id. [`ChannelLayer`] is the in-process implementation,
//! one `tokio::sync::broadcast` channel per group.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::descriptor::LogId;

/// Default per-group channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Name of the subscription group carrying lines of `log_id`.
pub fn group_name(log_id: LogId) -> String {
    format!("logs_{}", log_id)
}

// ---------------------------------------------------------------------------
// LogMessage
// ---------------------------------------------------------------------------

/// Message published for every tailed line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "log_message")]
pub struct LogMessage {
    pub line: String,
}

impl LogMessage {
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }
}

// ---------------------------------------------------------------------------
// BroadcastSink
// ---------------------------------------------------------------------------

/// Outbound side of the engine. Delivery is at-most-once; implementations
/// must not block waiting for subscribers.
pub trait BroadcastSink: Send + Sync {
    fn send(&self, log_id: LogId, message: LogMessage);
}

// ---------------------------------------------------------------------------
// ChannelLayer
// ---------------------------------------------------------------------------

/// In-process publish/subscribe layer keyed by group name.
pub struct ChannelLayer {
    capacity: usize,
    groups: Mutex<HashMap<String, broadcast::Sender<LogMessage>>>,
}

impl ChannelLayer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Join `group`, creating it on first use.
    pub fn subscribe(&self, group: &str) -> broadcast::Receiver<LogMessage> {
        let mut groups = self.groups.lock();
        match groups.get(group) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                groups.insert(group.to_string(), sender);
                receiver
            }
        }
    }

    pub fn group_send(&self, group: &str, message: LogMessage) {
        let mut groups = self.groups.lock();
        let Some(sender) = groups.get(group) else {
            trace!(group, "no subscribers, dropping message");
            return;
        };
        if sender.send(message).is_err() {
            // Every receiver is gone; forget the group until someone rejoins.
            groups.remove(group);
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }
}

impl Default for ChannelLayer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastSink for ChannelLayer {
    fn send(&self, log_id: LogId, message: LogMessage) {
        self.group_send(&group_name(log_id), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_name() {
        assert_eq!(group_name(LogId(42)), "logs_42");
    }

    #[test]
    fn test_log_message_wire_shape() {
        let json = serde_json::to_value(LogMessage::new("hello")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "log_message", "line": "hello"})
        );
    }

    #[tokio::test]
    async fn test_send_reaches_every_subscriber_of_the_group() {
        let layer = ChannelLayer::new(16);
        let mut a = layer.subscribe("logs_1");
        let mut b = layer.subscribe("logs_1");
        let mut other = layer.subscribe("logs_2");

        layer.send(LogId(1), LogMessage::new("x"));

        assert_eq!(a.recv().await.unwrap().line, "x");
        assert_eq!(b.recv().await.unwrap().line, "x");
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_send_without_subscribers_is_dropped() {
        let layer = ChannelLayer::new(16);
        layer.send(LogId(1), LogMessage::new("nobody"));
        assert_eq!(layer.group_count(), 0);
    }

    #[test]
    fn test_group_pruned_once_all_receivers_dropped() {
        let layer = ChannelLayer::new(16);
        let receiver = layer.subscribe("logs_1");
        assert_eq!(layer.group_count(), 1);

        drop(receiver);
        layer.send(LogId(1), LogMessage::new("late"));
        assert_eq!(layer.group_count(), 0);
    }
}
