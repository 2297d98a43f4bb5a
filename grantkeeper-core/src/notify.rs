//! User-facing notifications about token lifecycle events.
//!
//! Delivery to the desktop is platform business and lives outside this crate;
//! the lifecycle only talks to the [`Notifier`] trait.

use parking_lot::Mutex;

/// Sink for user-facing lifecycle notifications.
pub trait Notifier: Send + Sync {
    /// Deliver one notification. Delivery failures are the implementor's
    /// problem and must not propagate.
    fn notify(&self, title: &str, message: &str);
}

/// Notifier that writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str) {
        tracing::info!(title, "{}", message);
    }
}

/// Notifier that records notifications in memory.
///
/// Useful for embedding applications that show notifications themselves,
/// and for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered so far as `(title, message)` pairs.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, message: &str) {
        self.sent.lock().push((title.to_string(), message.to_string()));
    }
}
