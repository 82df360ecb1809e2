//! Channel subscriptions: how notifications reach observers.
//!
//! An observer registers under its signature key for one channel name; the
//! [`Messenger`] pushes every notification published on that channel into the
//! observer's [`NotificationSink`].
//!
//! [`LocalMessenger`] is the in-process transport. Publishing snapshots the
//! channel's sinks under the lock and delivers with the lock released, so a
//! sink may register, unregister, or publish again while being called.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CodecError;
use crate::notification::Notification;

/// Receiver side of a channel subscription.
pub trait NotificationSink: Send + Sync {
    fn on_message(&self, notification: Notification);
}

/// Transport that routes channel notifications to registered observers.
pub trait Messenger: Send + Sync {
    /// Start delivering notifications for `channel` to `sink` under `key`.
    /// Re-registering an existing key replaces its channel and sink.
    fn add_observer(&self, key: &str, channel: &str, sink: Arc<dyn NotificationSink>);

    /// Stop delivering to `key`. Unknown keys are ignored.
    fn remove_observer(&self, key: &str);
}

struct Registration {
    channel: String,
    sink: Arc<dyn NotificationSink>,
}

#[derive(Default)]
struct Routes {
    by_key: HashMap<String, Registration>,
    /// channel → keys, in registration order
    by_channel: HashMap<String, Vec<String>>,
}

/// In-process pub/sub [`Messenger`].
#[derive(Default)]
pub struct LocalMessenger {
    routes: Mutex<Routes>,
}

impl LocalMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `notification` to every observer on `channel`.
    ///
    /// Returns the number of observers it was delivered to.
    pub fn publish(&self, channel: &str, notification: &Notification) -> usize {
        let sinks: Vec<Arc<dyn NotificationSink>> = {
            let routes = self.routes.lock();
            routes
                .by_channel
                .get(channel)
                .map(|keys| {
                    keys.iter()
                        .filter_map(|k| routes.by_key.get(k))
                        .map(|r| Arc::clone(&r.sink))
                        .collect()
                })
                .unwrap_or_default()
        };
        tracing::trace!(channel, observers = sinks.len(), method = ?notification.method, "publish");
        for sink in &sinks {
            sink.on_message(notification.clone());
        }
        sinks.len()
    }

    /// Decode a JSON wire payload and publish it.
    pub fn publish_json(&self, channel: &str, payload: &str) -> Result<usize, CodecError> {
        let notification = Notification::decode(channel, payload)?;
        Ok(self.publish(channel, &notification))
    }

    /// Number of observers listening on `channel`.
    pub fn observer_count(&self, channel: &str) -> usize {
        self.routes
            .lock()
            .by_channel
            .get(channel)
            .map_or(0, Vec::len)
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.routes.lock().by_key.contains_key(key)
    }
}

impl Messenger for LocalMessenger {
    fn add_observer(&self, key: &str, channel: &str, sink: Arc<dyn NotificationSink>) {
        let mut routes = self.routes.lock();
        if let Some(previous) = routes.by_key.remove(key) {
            if let Some(keys) = routes.by_channel.get_mut(&previous.channel) {
                keys.retain(|k| k != key);
            }
        }
        routes.by_key.insert(
            key.to_string(),
            Registration {
                channel: channel.to_string(),
                sink,
            },
        );
        routes
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .push(key.to_string());
    }

    fn remove_observer(&self, key: &str) {
        let mut routes = self.routes.lock();
        if let Some(previous) = routes.by_key.remove(key) {
            let now_empty = match routes.by_channel.get_mut(&previous.channel) {
                Some(keys) => {
                    keys.retain(|k| k != key);
                    keys.is_empty()
                }
                None => false,
            };
            if now_empty {
                routes.by_channel.remove(&previous.channel);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
