use core::time::Duration;
use futures::StreamExt;
use singlet_core::{
    cancel::CancelObserver,
    engine::{Engine, EngineError, TokenStream},
    types::SamplingParams,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Demonstration engine that streams the prompt back, one word at a time.
///
/// Each generation runs on its own producer task, paced by `token_delay`, and
/// hands tokens to the caller through a single-slot channel so that it can
/// never run ahead of the reader. It stands in for a real model-serving
/// engine and honors the same contract: the observer is checked before every
/// token, and a cancelled generation ends with [`EngineError::Cancelled`].
#[derive(Clone, Debug)]
pub struct EchoEngine {
    token_delay: Duration,
}

impl EchoEngine {
    pub const fn new(token_delay: Duration) -> Self {
        Self { token_delay }
    }
}

impl Engine for EchoEngine {
    fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        cancel: CancelObserver,
    ) -> TokenStream {
        let words: Vec<String> = prompt
            .split_inclusive(char::is_whitespace)
            .take(params.max_tokens)
            .map(str::to_owned)
            .collect();

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(produce(words, self.token_delay, cancel, tx));
        ReceiverStream::new(rx).boxed()
    }
}

/// Producer loop for one generation.
///
/// Exits early when the observer is signaled (after reporting
/// [`EngineError::Cancelled`]) or when the reader has gone away.
async fn produce(
    words: Vec<String>,
    token_delay: Duration,
    cancel: CancelObserver,
    tx: mpsc::Sender<Result<String, EngineError>>,
) {
    tracing::trace!(tokens = words.len(), "Echo generation started");

    for word in words {
        let stopped = tokio::select! {
            biased;
            () = cancel.signaled() => true,
            () = tokio::time::sleep(token_delay) => false,
        };

        if stopped {
            if tx.send(Err(EngineError::Cancelled)).await.is_err() {
                tracing::debug!("Echo generation cancelled with no reader left");
            }
            return;
        }

        if tx.is_closed() {
            tracing::debug!("Echo generation exiting: reader dropped");
            return;
        }

        if let Err(e) = tx.send(Ok(word)).await {
            tracing::debug!("Echo generation failed to send token: {e}");
            return;
        }
    }

    tracing::trace!("Echo generation finished");
}
