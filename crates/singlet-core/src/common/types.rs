//! # Shared Request Types and Defaults
//!
//! This module defines the small value types passed between the admission
//! gate, the registry, the lifecycle controller and the engine.
//!
//! ## Types
//!
//! - [`RequestId`] - Process-unique request identifier minted from the
//!   registry counter
//! - [`CancelReason`] - Why a request's cancellation token was signaled
//! - [`SamplingParams`] - Knobs forwarded verbatim to the engine
//!
//! ## Constants
//!
//! - [`DEFAULT_CAPACITY`] - Concurrent generations admitted at once
//! - [`DEFAULT_MIN_PROMPT_LENGTH`] - Shortest accepted prompt, in characters
//! - [`DEFAULT_TIMEOUT_SECS`] - Wall-clock deadline per request
//! - [`DEFAULT_EVICTION_WAIT_MS`] - Bounded wait of the eviction policy

use core::{fmt, num::ParseIntError, str::FromStr};
use serde::{Serialize, Serializer};

/// Maximum number of requests registered at the same time.
pub const DEFAULT_CAPACITY: usize = 1;

/// Prompts shorter than this (in characters) are refused before admission.
pub const DEFAULT_MIN_PROMPT_LENGTH: usize = 16;

/// Deadline after which an admitted request is cancelled.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// How long an arrival waits for an evicted request to free its slot.
pub const DEFAULT_EVICTION_WAIT_MS: u64 = 5_000;

/// Opaque, process-unique request identifier.
///
/// Derived from the registry's monotonically increasing counter and never
/// reused. Renders (and serializes) as the decimal counter value, so the
/// first request of a process is `"0"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RequestId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The trigger that signaled a request's cancellation token.
///
/// Only the first reason recorded on a token is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The HTTP connection closed before the stream finished.
    Client,
    /// The per-request deadline elapsed.
    Timeout,
    /// An operator cancelled the request.
    External,
    /// The eviction policy chose this request to make room.
    Evicted,
    /// The service is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client disconnected",
            Self::Timeout => "timeout elapsed",
            Self::External => "cancelled by operator",
            Self::Evicted => "evicted to free capacity",
            Self::Shutdown => "service shutting down",
        })
    }
}

/// Sampling parameters handed to the engine with every prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    /// Upper bound on the number of tokens produced.
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.95,
            max_tokens: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_render_as_counter_values() {
        let id = RequestId::from_raw(0);
        assert_eq!(id.to_string(), "0");
        assert_eq!("42".parse::<RequestId>(), Ok(RequestId::from_raw(42)));
        assert!("abc".parse::<RequestId>().is_err());
    }
}
