//! Watch registered log files and fan their new lines out to subscribers.
//!
//! The engine is [`manager::WatchManager`]: it turns registry descriptors into
//! [`tailer::FileTailer`]s, groups them per directory behind one notifier
//! subscription each, and forwards every new line to a
//! [`broadcast::BroadcastSink`] addressed by log id. [`snapshot`] answers
//! "last N lines" queries without touching the tailers.

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod gateway;
pub mod manager;
pub mod multiplexer;
pub mod notifier;
pub mod registry;
pub mod snapshot;
pub mod stream;
pub mod tailer;
