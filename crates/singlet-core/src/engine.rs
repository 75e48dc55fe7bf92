//! Contract for the model-serving engine.
//!
//! The server treats inference as an opaque, long-running producer of text
//! tokens. An [`Engine`] receives the prompt, the [`SamplingParams`] and a
//! [`CancelObserver`], and returns a lazy, finite [`TokenStream`]. Engines must
//! stop producing promptly once the observer is signaled and end the stream
//! with [`EngineError::Cancelled`], so the caller can tell a cooperative stop
//! apart from a genuine failure.

use crate::{cancel::CancelObserver, types::SamplingParams};
use futures::stream::BoxStream;
use std::sync::Arc;

/// Lazily produced generation output. Not restartable.
pub type TokenStream = BoxStream<'static, Result<String, EngineError>>;

/// Ways a generation can end other than running to completion.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// Generation stopped because the cancellation observer was signaled.
    #[error("generation cancelled")]
    Cancelled,

    /// Generation failed for any other reason.
    #[error("generation failed: {0}")]
    Failed(String),
}

/// A model-serving engine.
pub trait Engine: Send + Sync + 'static {
    /// Starts a generation for `prompt`.
    ///
    /// No work is required to happen before the returned stream is polled.
    fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancelObserver,
    ) -> TokenStream;
}

impl<E: Engine + ?Sized> Engine for Arc<E> {
    fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancelObserver,
    ) -> TokenStream {
        (**self).generate(prompt, params, cancel)
    }
}
