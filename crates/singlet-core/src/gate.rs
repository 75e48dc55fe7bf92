//! Admission control.
//!
//! The [`AdmissionGate`] decides whether an arriving request may start. Below
//! capacity it always admits; at capacity it defers to an
//! [`AdmissionPolicy`]. The size check, id minting and registry insert happen
//! under the registry lock, so concurrent arrivals can never push the registry
//! past capacity.
//!
//! Two policies ship:
//!
//! - [`RejectWhenFull`] (default) - refuse the new request.
//! - [`EvictOldest`] - signal the oldest registered request with
//!   [`CancelReason::Evicted`] and admit the new one in its place once the
//!   evicted request has deregistered. If no slot frees up within the
//!   eviction wait, the new request is refused after all.
//!
//! Policies are chosen at construction time and are invisible to callers of
//! [`AdmissionGate::admit`].

use crate::{
    Error, Result,
    cancel::RequestToken,
    registry::{Registration, Registry},
    types::{CancelReason, DEFAULT_EVICTION_WAIT_MS},
};
use core::{fmt, str::FromStr, time::Duration};
use portable_atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};

/// What to do with an arriving request when the registry is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FullAction {
    /// Refuse the arriving request.
    Reject,
    /// Cancel the oldest in-flight request and admit the arriving one once
    /// its slot is free.
    EvictOldest,
}

/// Pluggable behavior of the gate at capacity.
pub trait AdmissionPolicy: Send + Sync + fmt::Debug {
    fn when_full(&self) -> FullAction;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RejectWhenFull;

impl AdmissionPolicy for RejectWhenFull {
    fn when_full(&self) -> FullAction {
        FullAction::Reject
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EvictOldest;

impl AdmissionPolicy for EvictOldest {
    fn when_full(&self) -> FullAction {
        FullAction::EvictOldest
    }
}

/// Named policies, as selected from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyKind {
    #[default]
    Reject,
    EvictOldest,
}

impl PolicyKind {
    pub fn build(self) -> Box<dyn AdmissionPolicy> {
        match self {
            Self::Reject => Box::new(RejectWhenFull),
            Self::EvictOldest => Box::new(EvictOldest),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reject => "reject",
            Self::EvictOldest => "evict-oldest",
        })
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "evict-oldest" | "evict_oldest" => Ok(Self::EvictOldest),
            other => Err(format!(
                "unknown admission policy `{other}` (expected `reject` or `evict-oldest`)"
            )),
        }
    }
}

/// Result of one locked admission attempt.
enum Attempt {
    Admitted(Registration),
    /// At capacity; carries the oldest live token, if any.
    Full(Option<RequestToken>),
}

fn capacity_exhausted() -> Error {
    Error::RejectedAdmission {
        reason: "capacity exhausted, try again later".to_string(),
    }
}

/// Gate in front of the registry.
#[derive(Debug)]
pub struct AdmissionGate {
    registry: Arc<Registry>,
    capacity: usize,
    policy: Box<dyn AdmissionPolicy>,
    eviction_wait: Duration,
    closed: AtomicBool,
}

impl AdmissionGate {
    /// Builds a gate over `registry`. A `capacity` of zero is raised to one.
    pub fn new(registry: Arc<Registry>, capacity: usize, policy: Box<dyn AdmissionPolicy>) -> Self {
        Self {
            registry,
            capacity: capacity.max(1),
            policy,
            eviction_wait: Duration::from_millis(DEFAULT_EVICTION_WAIT_MS),
            closed: AtomicBool::new(false),
        }
    }

    /// How long an arriving request waits for an evicted request to
    /// deregister before giving up.
    #[must_use]
    pub fn with_eviction_wait(mut self, wait: Duration) -> Self {
        self.eviction_wait = wait;
        self
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Admits a request: mints its id, creates its token and registers it.
    ///
    /// At capacity the policy decides. With [`FullAction::Reject`] this
    /// returns at once. With [`FullAction::EvictOldest`] the oldest request is
    /// signaled and this waits, at most the eviction wait, for a slot to free
    /// up. The insert itself always happens under the registry lock.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`close`](Self::close) was called.
    /// - [`Error::RejectedAdmission`] when capacity is exhausted (or, when
    ///   evicting, stayed exhausted for the whole wait). The registry is left
    ///   untouched.
    pub async fn admit(&self) -> Result<Registration> {
        let until = Instant::now().checked_add(self.eviction_wait);

        loop {
            // Armed before the check so a removal in between is not missed.
            let released = self.registry.released();

            let oldest = match self.attempt()? {
                Attempt::Admitted(registration) => return Ok(registration),
                Attempt::Full(oldest) => oldest,
            };

            match self.policy.when_full() {
                FullAction::Reject => return Err(capacity_exhausted()),
                FullAction::EvictOldest => {
                    if let Some(token) = oldest {
                        if token.signal(CancelReason::Evicted) {
                            tracing::info!(id = %token.id(), "evicting oldest request");
                        }
                    }

                    let expired = match until {
                        Some(until) => timeout_at(until, released).await.is_err(),
                        None => {
                            released.await;
                            false
                        }
                    };
                    if expired {
                        return Err(Error::RejectedAdmission {
                            reason: "capacity exhausted, evicted request did not stop in time"
                                .to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Admits a request only if a slot is free right now, regardless of the
    /// policy. Never evicts and never waits.
    ///
    /// # Errors
    ///
    /// Same as [`admit`](Self::admit).
    pub fn try_admit(&self) -> Result<Registration> {
        match self.attempt()? {
            Attempt::Admitted(registration) => Ok(registration),
            Attempt::Full(_) => Err(capacity_exhausted()),
        }
    }

    fn attempt(&self) -> Result<Attempt> {
        if self.is_closed() {
            return Err(Error::ServiceShutdown);
        }

        let mut entries = self.registry.lock();

        if entries.len() < self.capacity {
            let id = self.registry.mint_id();
            let token = RequestToken::new(id);
            Registry::insert_locked(&mut entries, id, &token)?;
            drop(entries);

            tracing::debug!(%id, "request admitted");
            return Ok(Attempt::Admitted(Registration::new(
                token,
                Arc::clone(&self.registry),
            )));
        }

        Ok(Attempt::Full(Registry::oldest_locked(&entries)))
    }

    /// Stops admitting requests. In-flight requests are unaffected; arrivals
    /// waiting on an eviction are refused.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.registry.wake_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
