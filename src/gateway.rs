//! Per-viewer delivery of broadcast lines.
//!
//! A [`ViewerSession`] joins the group of one log on connect and turns every
//! [`LogMessage`] it receives into a [`ViewerFrame`] tagged with the log id.
//! Leaving the group is dropping the session.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::broadcast::{group_name, ChannelLayer, LogMessage};
use crate::descriptor::LogId;

/// What a connected viewer receives for each line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ViewerFrame {
    pub line: String,
    pub app: LogId,
}

impl ViewerFrame {
    pub fn to_json(&self) -> String {
        // Two plain fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub struct ViewerSession {
    log_id: LogId,
    group: String,
    receiver: broadcast::Receiver<LogMessage>,
}

impl ViewerSession {
    pub fn connect(layer: &ChannelLayer, log_id: LogId) -> Self {
        let group = group_name(log_id);
        let receiver = layer.subscribe(&group);
        debug!(group = %group, "viewer connected");
        Self {
            log_id,
            group,
            receiver,
        }
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    /// Next frame for this viewer, or `None` once the group is gone.
    ///
    /// A viewer too slow to keep up loses the oldest messages and carries on
    /// with the next one still buffered.
    pub async fn next_frame(&mut self) -> Option<ViewerFrame> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => {
                    return Some(ViewerFrame {
                        line: message.line,
                        app: self.log_id,
                    })
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(group = %self.group, skipped, "viewer lagging, dropped messages");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        debug!(group = %self.group, "viewer disconnected");
    }
}
