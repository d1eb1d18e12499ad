//! Single-flight session registry.
//!
//! The registry is an explicit mapping from connection identity to at most
//! one active StreamSession. Insertion and removal form the single-flight
//! lock: `begin` claims the connection's slot and the returned guard releases
//! it on drop, exactly once per session regardless of which exit path the
//! pipeline takes (success, failure, panic unwind, or disconnect).

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Connection → active-session map shared by all connections.
#[derive(Default)]
pub struct SessionRegistry {
    active: DashMap<Uuid, ()>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for `connection_id`. Returns `None` when a session is
    /// already in flight for that connection.
    pub fn begin(self: &Arc<Self>, connection_id: Uuid) -> Option<SessionGuard> {
        use dashmap::mapref::entry::Entry;
        match self.active.entry(connection_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(SessionGuard {
                    registry: Arc::clone(self),
                    connection_id,
                })
            }
        }
    }

    pub fn is_active(&self, connection_id: Uuid) -> bool {
        self.active.contains_key(&connection_id)
    }
}

/// Releases the connection's single-flight slot when dropped.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    connection_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.active.remove(&self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_while_active() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = Uuid::new_v4();

        let guard = registry.begin(conn).expect("first begin succeeds");
        assert!(registry.begin(conn).is_none());
        assert!(registry.is_active(conn));

        drop(guard);
        assert!(!registry.is_active(conn));
        assert!(registry.begin(conn).is_some());
    }

    #[test]
    fn connections_are_independent() {
        let registry = Arc::new(SessionRegistry::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let _guard_a = registry.begin(a).unwrap();
        assert!(registry.begin(b).is_some());
    }

    #[test]
    fn slot_is_released_on_panic_unwind() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = Uuid::new_v4();

        let registry_clone = Arc::clone(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = registry_clone.begin(conn).unwrap();
            panic!("session task panicked");
        }));
        assert!(result.is_err());
        assert!(!registry.is_active(conn));
    }
}
