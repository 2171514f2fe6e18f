//! Session registry.
//!
//! All state is ephemeral and held in memory. A session lives in the
//! registry only while at least one peer occupies it; the peer that empties
//! it removes it on the way out.
//!
//! Two kinds of lock are involved: the registry map's own shard locks, and
//! one mutex per session guarding its two slots. When both are needed (only
//! on removal) the session mutex is taken first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ForwardError, JoinError};
use crate::protocol::SessionToken;

/// Number of peers a session can hold.
pub const SLOTS_PER_SESSION: usize = 2;

/// Process-unique identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle to one connected peer: its identity plus the sending half of its
/// outbound queue. Cloning is cheap.
///
/// The queue is unbounded; a peer that stops draining it is cut off by its
/// own write timeout, which closes the queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PeerHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a payload for delivery to this peer without waiting.
    pub fn forward(&self, payload: Bytes) -> Result<(), ForwardError> {
        self.tx
            .send(payload)
            .map_err(|_| ForwardError::Disconnected)
    }
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    OccupiedBy(PeerHandle),
}

impl Slot {
    fn holds(&self, id: ConnectionId) -> bool {
        matches!(self, Slot::OccupiedBy(handle) if handle.id == id)
    }

    fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

#[derive(Debug, Default)]
struct Slots {
    pair: [Slot; SLOTS_PER_SESSION],
    /// Set once the session has been removed from the registry.
    retired: bool,
}

impl Slots {
    fn occupants(&self) -> usize {
        self.pair.iter().filter(|slot| !slot.is_empty()).count()
    }

    fn is_vacant(&self) -> bool {
        self.pair.iter().all(Slot::is_empty)
    }
}

/// Why a session turned a joiner away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    Full,
    Retired,
}

/// One paired game: a token and two slots.
#[derive(Debug)]
pub struct Session {
    token: SessionToken,
    slots: Mutex<Slots>,
}

impl Session {
    fn new(token: SessionToken) -> Self {
        Self {
            token,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Number of occupied slots.
    pub fn occupants(&self) -> usize {
        self.slots().occupants()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_vacant()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // Critical sections never panic mid-update, so a poisoned guard is still consistent.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place `handle` in the first empty slot.
    fn try_join(&self, handle: PeerHandle) -> Result<usize, Refusal> {
        let mut slots = self.slots();
        if slots.retired {
            return Err(Refusal::Retired);
        }
        if let Some(index) = slots.pair.iter().position(|slot| slot.holds(handle.id)) {
            return Ok(index);
        }
        let index = slots
            .pair
            .iter()
            .position(Slot::is_empty)
            .ok_or(Refusal::Full)?;
        slots.pair[index] = Slot::OccupiedBy(handle);
        Ok(index)
    }

    /// The peer currently occupying the slot that is not `id`'s.
    fn peer_of(&self, id: ConnectionId) -> Option<PeerHandle> {
        let slots = self.slots();
        slots.pair.iter().find_map(|slot| match slot {
            Slot::OccupiedBy(handle) if handle.id != id => Some(handle.clone()),
            _ => None,
        })
    }

    /// Clear the slot held by `id`, if any. Returns whether the session is now vacant.
    fn release(&self, id: ConnectionId) -> bool {
        let mut slots = self.slots();
        for slot in slots.pair.iter_mut() {
            if slot.holds(id) {
                *slot = Slot::Empty;
            }
        }
        slots.is_vacant()
    }
}

/// Snapshot of registry occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub peers: usize,
}

/// The relay's session table, shared by every connection handler.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<SessionToken, Arc<Session>>,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for `token`, creating an empty one if there is none.
    pub fn get_or_create(&self, token: &SessionToken) -> Arc<Session> {
        if let Some(session) = self.sessions.get(token) {
            return Arc::clone(session.value());
        }
        let entry = self.sessions.entry(token.clone()).or_insert_with(|| {
            debug!(%token, "Session created");
            Arc::new(Session::new(token.clone()))
        });
        Arc::clone(entry.value())
    }

    /// Remove `token` if it still maps to `expected` and `expected` has no
    /// occupants. Returns whether the entry was removed.
    pub fn remove(&self, token: &SessionToken, expected: &Arc<Session>) -> bool {
        // Held across the map removal so no join can land in between.
        let mut slots = expected.slots();
        if !slots.is_vacant() {
            return false;
        }
        let removed = self
            .sessions
            .remove_if(token, |_, current| Arc::ptr_eq(current, expected))
            .is_some();
        if removed {
            slots.retired = true;
            debug!(%token, "Session removed");
        }
        removed
    }

    /// Occupy a slot in the session for `token`.
    ///
    /// The returned [`Membership`] releases the slot when dropped.
    pub fn join(
        self: &Arc<Self>,
        token: &SessionToken,
        handle: PeerHandle,
    ) -> Result<Membership, JoinError> {
        loop {
            let session = self.get_or_create(token);
            match session.try_join(handle.clone()) {
                Ok(slot) => {
                    return Ok(Membership {
                        registry: Arc::clone(self),
                        session,
                        id: handle.id(),
                        slot,
                    })
                }
                // Lost a race with removal; the next lookup finds a fresh session.
                Err(Refusal::Retired) => continue,
                Err(Refusal::Full) => {
                    return Err(JoinError::SessionFull {
                        token: token.clone(),
                    })
                }
            }
        }
    }

    /// Check if a session exists for `token`.
    pub fn contains(&self, token: &SessionToken) -> bool {
        self.sessions.contains_key(token)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        // Collect first: session guards must not be taken under a shard lock.
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        RegistryStats {
            sessions: sessions.len(),
            peers: sessions.iter().map(|session| session.occupants()).sum(),
        }
    }
}

/// A connection's occupancy of one session slot.
///
/// Dropping it clears the slot and, if that left the session empty, removes
/// the session from the registry.
#[derive(Debug)]
pub struct Membership {
    registry: Arc<Registry>,
    session: Arc<Session>,
    id: ConnectionId,
    slot: usize,
}

impl Membership {
    pub fn token(&self) -> &SessionToken {
        self.session.token()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Index of the occupied slot.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whoever occupies the other slot right now.
    pub fn peer(&self) -> Option<PeerHandle> {
        self.session.peer_of(self.id)
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        let vacant = self.session.release(self.id);
        debug!(conn = %self.id, token = %self.session.token(), slot = self.slot, "Left session");
        if vacant {
            self.registry.remove(self.session.token(), &self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;

    fn test_handle() -> (PeerHandle, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerHandle::new(ConnectionId::next(), tx), rx)
    }

    fn join(registry: &Arc<Registry>, token: &'static str) -> (Membership, PeerHandle) {
        let (handle, _rx) = test_handle();
        let membership = registry.join(&token.into(), handle.clone()).unwrap();
        (membership, handle)
    }

    #[test]
    fn test_third_join_is_rejected() {
        let registry = Arc::new(Registry::new());
        let (a, handle_a) = join(&registry, "g1");
        let (b, handle_b) = join(&registry, "g1");

        let (handle_c, _rx) = test_handle();
        let err = registry.join(&"g1".into(), handle_c).unwrap_err();
        assert!(matches!(err, JoinError::SessionFull { ref token } if token.as_bytes() == b"g1"));

        // Existing occupants untouched
        assert_eq!(a.session().occupants(), 2);
        assert_eq!(a.peer().unwrap().id(), handle_b.id());
        assert_eq!(b.peer().unwrap().id(), handle_a.id());
    }

    #[test]
    fn test_session_removed_after_both_leave() {
        let registry = Arc::new(Registry::new());
        let token = SessionToken::from("g1");
        let (a, _) = join(&registry, "g1");
        let (b, _) = join(&registry, "g1");
        let original = Arc::clone(a.session());

        drop(a);
        assert!(registry.contains(&token));
        assert_eq!(original.occupants(), 1);

        drop(b);
        assert!(!registry.contains(&token));
        assert!(registry.is_empty());

        let fresh = registry.get_or_create(&token);
        assert!(!Arc::ptr_eq(&fresh, &original));
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_vacated_slot_is_reused() {
        let registry = Arc::new(Registry::new());
        let (a, _) = join(&registry, "g2");
        let (b, handle_b) = join(&registry, "g2");
        assert_eq!(b.slot(), 1);
        assert_eq!(a.peer().unwrap().id(), handle_b.id());

        drop(b);
        assert!(a.peer().is_none());

        let (c, handle_c) = join(&registry, "g2");
        assert_eq!(c.slot(), 1);
        assert_eq!(a.peer().unwrap().id(), handle_c.id());
    }

    #[test]
    fn test_sessions_are_independent() {
        let registry = Arc::new(Registry::new());
        let (x1, _) = join(&registry, "x");
        let (_x2, _) = join(&registry, "x");
        let (y, _) = join(&registry, "y");

        assert!(y.peer().is_none());
        assert_eq!(y.slot(), 0);
        assert_eq!(y.token(), &SessionToken::from("y"));
        assert_eq!(x1.token(), &SessionToken::from("x"));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                sessions: 2,
                peers: 3
            }
        );
    }

    #[test]
    fn test_remove_refuses_occupied_or_replaced_session() {
        let registry = Arc::new(Registry::new());
        let token = SessionToken::from("busy");
        let (a, _) = join(&registry, "busy");

        assert!(!registry.remove(&token, a.session()));
        assert!(registry.contains(&token));

        let stranger = Arc::new(Session::new(token.clone()));
        assert!(!registry.remove(&token, &stranger));
        assert!(registry.contains(&token));
        assert!(Arc::ptr_eq(&registry.get_or_create(&token), a.session()));
    }

    #[test]
    fn test_retired_session_refuses_joins() {
        let registry = Arc::new(Registry::new());
        let token = SessionToken::from("r");
        let stale = registry.get_or_create(&token);
        assert!(registry.remove(&token, &stale));

        let (handle, _rx) = test_handle();
        assert_eq!(stale.try_join(handle.clone()), Err(Refusal::Retired));

        // A joiner holding the stale session lands in a fresh one instead.
        let membership = registry.join(&token, handle).unwrap();
        assert!(!Arc::ptr_eq(membership.session(), &stale));
        assert!(registry.contains(&token));
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = Arc::new(Registry::new());
        let (a, handle_a) = join(&registry, "idem");
        let session = Arc::clone(a.session());

        assert!(session.release(handle_a.id()));
        assert!(session.release(handle_a.id()));
        drop(a);
        assert!(!registry.contains(&"idem".into()));
    }

    #[test]
    fn test_concurrent_get_or_create_yields_one_session() {
        let registry = Arc::new(Registry::new());
        let barrier = Arc::new(Barrier::new(16));

        let workers: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create(&"race".into())
                })
            })
            .collect();

        let sessions: Vec<Arc<Session>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_joins_admit_two() {
        let registry = Arc::new(Registry::new());
        let barrier = Arc::new(Barrier::new(16));

        let workers: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let (handle, rx) = test_handle();
                    barrier.wait();
                    (registry.join(&"crowd".into(), handle), rx)
                })
            })
            .collect();

        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        let joined = results.iter().filter(|(r, _)| r.is_ok()).count();
        assert_eq!(joined, 2);
        assert_eq!(registry.stats().peers, 2);

        drop(results);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_forward_queues_until_disconnected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(ConnectionId::next(), tx);

        for i in 0..200u8 {
            handle.forward(Bytes::from(vec![i])).unwrap();
        }
        for i in 0..200u8 {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from(vec![i]));
        }

        drop(rx);
        assert!(matches!(
            handle.forward(Bytes::from_static(b"late")),
            Err(ForwardError::Disconnected)
        ));
    }
}
