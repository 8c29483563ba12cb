use parking_lot::RwLock;
use tokio::sync::watch;

/// Supplies the current caller's id; every entity operation is scoped to it.
pub trait SessionProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Session holder updated by the auth layer on sign-in/sign-out.
#[derive(Debug, Default)]
pub struct StaticSession {
    user_id: RwLock<Option<String>>,
}

impl StaticSession {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        *self.user_id.write() = Some(user_id.into());
    }

    pub fn sign_out(&self) {
        *self.user_id.write() = None;
    }
}

impl SessionProvider for StaticSession {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }
}

/// Online/offline signal with change notifications.
#[derive(Clone, Debug)]
pub struct NetworkStatus {
    online_tx: watch::Sender<bool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (online_tx, _) = watch::channel(online);
        Self { online_tx }
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Record a connectivity change. Subscribers are woken only on actual changes.
    pub fn set_online(&self, online: bool) {
        self.online_tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}
