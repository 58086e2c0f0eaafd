// Same-origin broadcast channel between tabs

use super::{CoordinatorError, TabMessage};
use tokio::sync::broadcast;

/// A channel every tab of one origin posts to and listens on.
///
/// Posting never blocks. Subscribers may see their own posts; the
/// coordinator filters those out by sender id.
pub trait BroadcastChannel: Send + Sync {
    fn post(&self, message: TabMessage) -> Result<(), CoordinatorError>;
    fn subscribe(&self) -> broadcast::Receiver<TabMessage>;
}

/// In-process channel backed by `tokio::sync::broadcast`.
#[derive(Clone)]
pub struct LocalBroadcast {
    sender: broadcast::Sender<TabMessage>,
}

impl LocalBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BroadcastChannel for LocalBroadcast {
    fn post(&self, message: TabMessage) -> Result<(), CoordinatorError> {
        // No receivers just means no other tab is open
        let _ = self.sender.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TabMessage> {
        self.sender.subscribe()
    }
}
