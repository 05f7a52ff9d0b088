use super::manager::CallManager;
use super::signaling::SignalSender;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;

/// One shared [`CallManager`] per local identity.
///
/// Screens bound to the same user get the same instance, so they never
/// hold diverging call state.
pub struct CallRegistry {
    signaler: Arc<dyn SignalSender>,
    managers: DashMap<String, Arc<CallManager>>,
}

impl CallRegistry {
    pub fn new(signaler: Arc<dyn SignalSender>) -> Arc<Self> {
        Arc::new(Self {
            signaler,
            managers: DashMap::new(),
        })
    }

    /// Returns the manager for `user_id`, creating it on first use.
    pub fn manager_for(&self, user_id: &str) -> Arc<CallManager> {
        self.managers
            .entry(user_id.to_string())
            .or_insert_with(|| {
                debug!(target: "Calls/Manager", "Creating call manager for {user_id}");
                CallManager::new(user_id, self.signaler.clone())
            })
            .clone()
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<CallManager>> {
        self.managers.get(user_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, user_id: &str) -> Option<Arc<CallManager>> {
        self.managers.remove(user_id).map(|(_, manager)| manager)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::manager::test_support::RecordingSignaler;

    #[tokio::test]
    async fn test_same_identity_shares_manager() {
        let registry = CallRegistry::new(Arc::new(RecordingSignaler::default()));

        let a = registry.manager_for("U1");
        let b = registry.manager_for("U1");
        let other = registry.manager_for("U2");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len(), 2);
        assert_eq!(a.local_user_id(), "U1");

        assert!(registry.remove("U2").is_some());
        assert!(registry.get("U2").is_none());
        assert!(registry.get("U1").is_some());
    }
}
