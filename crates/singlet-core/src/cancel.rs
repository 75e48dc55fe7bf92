//! Per-request cancellation.
//!
//! A [`RequestToken`] is created armed, bound to one [`RequestId`], and moves
//! to signaled exactly once. Every trigger that may stop a request (client
//! disconnect, deadline, operator, eviction, shutdown) calls
//! [`RequestToken::signal`]; only the first reason is recorded and later calls
//! are no-ops.
//!
//! The engine never receives the token itself, only a [`CancelObserver`],
//! which can check or await the signal but cannot raise it. The registry keeps
//! a [`WeakRequestToken`] so that it never extends a request's lifetime.

use crate::types::{CancelReason, RequestId};
use std::sync::{Arc, OnceLock, Weak};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Shared {
    id: RequestId,
    reason: OnceLock<CancelReason>,
    token: CancellationToken,
}

/// Signal-once cancellation token owned by a single request.
///
/// Cloning is cheap; all clones refer to the same token.
#[derive(Clone, Debug)]
pub struct RequestToken {
    shared: Arc<Shared>,
}

impl RequestToken {
    /// Creates an armed token bound to `id`.
    pub fn new(id: RequestId) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                reason: OnceLock::new(),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    /// Transitions the token from armed to signaled.
    ///
    /// Safe to call any number of times from any thread. Returns `true` only
    /// for the call whose `reason` was recorded.
    pub fn signal(&self, reason: CancelReason) -> bool {
        // The reason must be visible before anyone can observe the signal.
        let first = self.shared.reason.set(reason).is_ok();
        self.shared.token.cancel();

        if first {
            tracing::debug!(id = %self.shared.id, %reason, "request signaled");
        }
        first
    }

    pub fn is_signaled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// The reason recorded by the first [`signal`](Self::signal), if any.
    pub fn reason(&self) -> Option<CancelReason> {
        self.shared.reason.get().copied()
    }

    /// Resolves once the token is signaled.
    pub async fn signaled(&self) {
        self.shared.token.cancelled().await;
    }

    /// Returns the passive half of this token, for the engine.
    pub fn observer(&self) -> CancelObserver {
        CancelObserver {
            token: self.shared.token.clone(),
        }
    }

    pub fn downgrade(&self) -> WeakRequestToken {
        WeakRequestToken {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Non-owning reference to a [`RequestToken`].
#[derive(Clone, Debug)]
pub struct WeakRequestToken {
    shared: Weak<Shared>,
}

impl WeakRequestToken {
    pub fn upgrade(&self) -> Option<RequestToken> {
        self.shared.upgrade().map(|shared| RequestToken { shared })
    }
}

/// Read-only view of a request's cancellation state.
///
/// Engines poll [`is_signaled`](Self::is_signaled) between tokens or select
/// on [`signaled`](Self::signaled), and stop at their next natural yield
/// point.
#[derive(Clone, Debug)]
pub struct CancelObserver {
    token: CancellationToken,
}

impl CancelObserver {
    /// An observer that is never signaled.
    pub fn never() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn signaled(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn first_reason_wins() {
        let token = RequestToken::new(RequestId::from_raw(7));
        assert!(!token.is_signaled());
        assert_eq!(token.reason(), None);

        assert!(token.signal(CancelReason::Client));
        assert!(!token.signal(CancelReason::Timeout));
        assert!(!token.signal(CancelReason::Client));

        assert!(token.is_signaled());
        assert_eq!(token.reason(), Some(CancelReason::Client));
    }

    #[test]
    fn observers_see_the_signal() {
        let token = RequestToken::new(RequestId::from_raw(0));
        let observer = token.observer();
        assert!(!observer.is_signaled());
        token.signal(CancelReason::External);
        assert!(observer.is_signaled());
        assert!(!CancelObserver::never().is_signaled());
    }

    #[test]
    fn weak_reference_does_not_keep_the_token_alive() {
        let token = RequestToken::new(RequestId::from_raw(3));
        let weak = token.downgrade();
        assert_eq!(weak.upgrade().map(|t| t.id()), Some(RequestId::from_raw(3)));
        drop(token);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_signals_record_exactly_one_reason() {
        let reasons = [
            CancelReason::Client,
            CancelReason::Timeout,
            CancelReason::External,
            CancelReason::Evicted,
        ];

        for _ in 0..64 {
            let token = RequestToken::new(RequestId::from_raw(1));
            let tasks: Vec<_> = reasons
                .iter()
                .map(|&reason| {
                    let token = token.clone();
                    tokio::spawn(async move { token.signal(reason) })
                })
                .collect();

            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }

            assert_eq!(winners, 1);
            assert!(reasons.contains(&token.reason().unwrap()));
        }
    }

    #[tokio::test]
    async fn signaled_resolves_after_signal() {
        let token = RequestToken::new(RequestId::from_raw(0));
        let observer = token.observer();
        let waiter = tokio::spawn(async move { observer.signaled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        token.signal(CancelReason::Timeout);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
