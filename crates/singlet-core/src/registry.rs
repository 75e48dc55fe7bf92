//! Process-wide registry of in-flight requests.
//!
//! The [`Registry`] maps every admitted [`RequestId`] to a non-owning
//! reference to its [`RequestToken`], and carries the counter used to mint
//! ids. It is an ordinary value: the server builds one at startup and passes
//! it around behind an `Arc`, so tests can run as many independent instances
//! as they like.
//!
//! Insertion happens through the [`AdmissionGate`](crate::gate::AdmissionGate)
//! so that the capacity check and the insert share one critical section.
//! Removal is tied to [`Registration`], an RAII guard whose `Drop` removes the
//! entry exactly once on every exit path, panics included. Every removal
//! wakes the tasks waiting in [`Registry::released`].

use crate::{
    Error, Result,
    cancel::{RequestToken, WeakRequestToken},
    types::{CancelReason, RequestId},
};
use parking_lot::{Mutex, MutexGuard};
use portable_atomic::{AtomicU64, Ordering};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{Notify, futures::Notified};

pub(crate) type Entries = BTreeMap<RequestId, WeakRequestToken>;

/// Registry of requests between admission and termination.
#[derive(Debug, Default)]
pub struct Registry {
    // Ids grow monotonically, so iteration order is admission order.
    entries: Mutex<Entries>,
    counter: AtomicU64,
    released: Notify,
}

/// Point-in-time copy of the registry, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Ids minted since startup.
    pub nb_total: u64,
    /// Requests currently registered.
    pub nb_pending: usize,
    /// Registered ids, oldest first.
    pub queue: Vec<RequestId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints the next id. Never returns the same value twice.
    pub fn mint_id(&self) -> RequestId {
        RequestId::from_raw(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids minted so far.
    pub fn total(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Inserts `token` under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequest`] if `id` is already present.
    pub fn register(&self, id: RequestId, token: &RequestToken) -> Result<()> {
        Self::insert_locked(&mut self.entries.lock(), id, token)
    }

    /// Removes `id`. Returns `false` (and does nothing) if it was absent.
    pub fn unregister(&self, id: RequestId) -> bool {
        let removed = self.entries.lock().remove(&id).is_some();
        if removed {
            self.released.notify_waiters();
        }
        removed
    }

    /// Resolves after the next successful [`unregister`](Self::unregister).
    ///
    /// The future observes removals from the moment it is created, so create
    /// it before checking the condition you are waiting on.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Wakes every task waiting in [`released`](Self::released) without
    /// removing anything.
    pub fn wake_waiters(&self) {
        self.released.notify_waiters();
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Looks up the live token registered under `id`.
    pub fn token_for(&self, id: RequestId) -> Option<RequestToken> {
        self.entries.lock().get(&id).and_then(WeakRequestToken::upgrade)
    }

    /// The longest-registered live token.
    pub fn oldest(&self) -> Option<RequestToken> {
        Self::oldest_locked(&self.entries.lock())
    }

    pub fn snapshot(&self) -> Snapshot {
        let queue: Vec<RequestId> = self.entries.lock().keys().copied().collect();
        Snapshot {
            nb_total: self.total(),
            nb_pending: queue.len(),
            queue,
        }
    }

    /// Signals every registered token with `reason`. Returns how many tokens
    /// recorded it as their first reason.
    pub fn signal_all(&self, reason: CancelReason) -> usize {
        // Collect first: signaling runs arbitrary wakeups we don't want under
        // the lock.
        let tokens: Vec<RequestToken> = self
            .entries
            .lock()
            .values()
            .filter_map(WeakRequestToken::upgrade)
            .collect();

        tokens.iter().filter(|token| token.signal(reason)).count()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock()
    }

    pub(crate) fn insert_locked(
        entries: &mut Entries,
        id: RequestId,
        token: &RequestToken,
    ) -> Result<()> {
        debug_assert_eq!(id, token.id());
        if entries.contains_key(&id) {
            return Err(Error::DuplicateRequest { id });
        }
        entries.insert(id, token.downgrade());
        Ok(())
    }

    pub(crate) fn oldest_locked(entries: &Entries) -> Option<RequestToken> {
        entries.values().find_map(WeakRequestToken::upgrade)
    }
}

/// Proof that a request is registered.
///
/// Owns the request's [`RequestToken`]. Dropping the registration removes the
/// request from the registry; this happens exactly once no matter how the
/// request ends.
#[derive(Debug)]
pub struct Registration {
    token: RequestToken,
    registry: Arc<Registry>,
}

impl Registration {
    pub(crate) const fn new(token: RequestToken, registry: Arc<Registry>) -> Self {
        Self { token, registry }
    }

    pub fn id(&self) -> RequestId {
        self.token.id()
    }

    pub const fn token(&self) -> &RequestToken {
        &self.token
    }

    /// Deregisters now instead of at scope exit.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let id = self.token.id();
        if self.registry.unregister(id) {
            tracing::debug!(%id, "request deregistered");
        } else {
            tracing::warn!(%id, "request was already absent from the registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(registry: &Arc<Registry>) -> Registration {
        let id = registry.mint_id();
        let token = RequestToken::new(id);
        registry.register(id, &token).unwrap();
        Registration::new(token, Arc::clone(registry))
    }

    #[test]
    fn ids_are_never_reused() {
        let registry = Registry::new();
        let a = registry.mint_id();
        let b = registry.mint_id();
        assert_eq!(a.to_raw(), 0);
        assert_eq!(b.to_raw(), 1);
        assert_eq!(registry.total(), 2);
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = Registry::new();
        let id = registry.mint_id();
        let token = RequestToken::new(id);
        registry.register(id, &token).unwrap();
        assert_eq!(
            registry.register(id, &token),
            Err(Error::DuplicateRequest { id })
        );
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        let id = registry.mint_id();
        let token = RequestToken::new(id);
        registry.register(id, &token).unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(!registry.contains(id));
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn registration_drop_deregisters() {
        let registry = Arc::new(Registry::new());
        let registration = registered(&registry);
        let id = registration.id();

        assert!(registry.contains(id));
        assert_eq!(registry.token_for(id).map(|t| t.id()), Some(id));

        registration.release();
        assert!(!registry.contains(id));
        assert!(registry.token_for(id).is_none());
    }

    #[test]
    fn registry_holds_no_ownership() {
        let registry = Registry::new();
        let id = registry.mint_id();
        let token = RequestToken::new(id);
        registry.register(id, &token).unwrap();
        drop(token);

        // The entry stays until unregistered, but the token is gone.
        assert!(registry.contains(id));
        assert!(registry.token_for(id).is_none());
    }

    #[test]
    fn snapshot_reports_counter_size_and_ids() {
        let registry = Arc::new(Registry::new());
        assert_eq!(
            registry.snapshot(),
            Snapshot {
                nb_total: 0,
                nb_pending: 0,
                queue: vec![]
            }
        );

        let first = registered(&registry);
        let second = registered(&registry);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.nb_total, 2);
        assert_eq!(snapshot.nb_pending, 2);
        assert_eq!(snapshot.queue, vec![first.id(), second.id()]);
        assert_eq!(registry.oldest().map(|t| t.id()), Some(first.id()));

        drop(first);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.nb_total, 2);
        assert_eq!(snapshot.queue, vec![second.id()]);
    }

    #[test]
    fn snapshot_serializes_with_wire_names() {
        let registry = Arc::new(Registry::new());
        let _registration = registered(&registry);
        let json = serde_json::to_string(&registry.snapshot()).unwrap();
        assert_eq!(json, r#"{"nbTotal":1,"nbPending":1,"queue":["0"]}"#);
    }

    #[tokio::test]
    async fn removals_wake_released_waiters() {
        let registry = Arc::new(Registry::new());
        let registration = registered(&registry);

        let released = registry.released();
        registration.release();
        tokio::time::timeout(core::time::Duration::from_secs(1), released)
            .await
            .unwrap();

        // Removing an absent id wakes nobody.
        let released = registry.released();
        assert!(!registry.unregister(RequestId::from_raw(0)));
        assert!(
            tokio::time::timeout(core::time::Duration::from_millis(20), released)
                .await
                .is_err()
        );
    }

    #[test]
    fn signal_all_signals_each_live_token_once() {
        let registry = Arc::new(Registry::new());
        let a = registered(&registry);
        let b = registered(&registry);
        b.token().signal(CancelReason::Client);

        assert_eq!(registry.signal_all(CancelReason::Shutdown), 1);
        assert_eq!(a.token().reason(), Some(CancelReason::Shutdown));
        assert_eq!(b.token().reason(), Some(CancelReason::Client));
        assert_eq!(registry.signal_all(CancelReason::Shutdown), 0);
    }
}
