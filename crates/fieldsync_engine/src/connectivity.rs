//! Online/offline signal.

use tokio::sync::watch;

/// A boolean connectivity signal with change notifications.
///
/// The platform layer calls [`Connectivity::set_online`]; the engine
/// watches for transitions.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    /// Creates a signal with an initial value.
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Updates the signal. Returns true if the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    /// Current value.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
