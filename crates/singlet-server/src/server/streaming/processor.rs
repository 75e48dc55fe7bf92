use super::sink::ResponseSink;
use crate::server::telemetry::increment_tokens_streamed;
use futures::StreamExt;
use singlet_core::{
    Error,
    cancel::RequestToken,
    engine::{EngineError, TokenStream},
    types::CancelReason,
};

/// How a generation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The engine's stream ran to its end.
    Completed,
    /// The engine stopped after the request's token was signaled.
    Canceled(CancelReason),
    /// The engine failed on its own.
    Failed(String),
}

impl Outcome {
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            Self::Completed => Ok(()),
            Self::Canceled(reason) => Err(reason.into()),
            Self::Failed(context) => Err(Error::GenerationFailure { context }),
        }
    }
}

/// Forwards tokens from the engine to the response body until the engine
/// stops.
///
/// Writes are best effort: a closed body is logged once and the engine keeps
/// being drained, because it may still hold resources until it notices the
/// cancellation. Once `token` is signaled no further tokens are written.
///
/// An engine error is classified by the token: if the token was signaled
/// before the error surfaced, the generation counts as cancelled with the
/// token's recorded reason; otherwise it failed.
pub async fn pump_tokens(
    mut tokens: TokenStream,
    sink: &mut ResponseSink,
    token: &RequestToken,
) -> Outcome {
    while let Some(item) = tokens.next().await {
        match item {
            Ok(text) => {
                if token.is_signaled() || !sink.is_open() {
                    continue;
                }

                let written = tokio::select! {
                    biased;
                    () = token.signaled() => continue,
                    res = sink.write(text) => res,
                };

                match written {
                    Ok(()) => increment_tokens_streamed(1),
                    // The sink stays closed from here on, so this logs once.
                    Err(e) => tracing::warn!("Dropping generated output: {e}"),
                }
            }
            Err(EngineError::Cancelled) => {
                return match token.reason() {
                    Some(reason) => Outcome::Canceled(reason),
                    None => Outcome::Failed(
                        "engine reported a cancellation that was never requested".to_string(),
                    ),
                };
            }
            Err(EngineError::Failed(context)) => {
                return match token.reason() {
                    Some(reason) => {
                        tracing::debug!("Engine error after cancellation: {context}");
                        Outcome::Canceled(reason)
                    }
                    None => Outcome::Failed(context),
                };
            }
        }
    }

    Outcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::streaming::sink::Chunk;
    use futures::stream;
    use singlet_core::types::RequestId;
    use tokio::sync::mpsc;

    fn text(tokens: &[&str]) -> Vec<Result<String, EngineError>> {
        tokens.iter().map(|t| Ok((*t).to_string())).collect()
    }

    async fn drain(mut rx: mpsc::Receiver<Chunk>) -> String {
        let mut out = Vec::new();
        while let Some(Ok(chunk)) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn completed_streams_forward_every_token() {
        let token = RequestToken::new(RequestId::from_raw(0));
        let (mut sink, rx) = ResponseSink::channel(token.id(), 8);

        let tokens = stream::iter(text(&["a", "b", "c"])).boxed();
        let outcome = pump_tokens(tokens, &mut sink, &token).await;
        sink.close();

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(drain(rx).await, "abc");
    }

    #[tokio::test]
    async fn failures_keep_partial_output() {
        let token = RequestToken::new(RequestId::from_raw(0));
        let (mut sink, rx) = ResponseSink::channel(token.id(), 8);

        let mut items = text(&["partial "]);
        items.push(Err(EngineError::Failed("out of memory".to_string())));
        let outcome = pump_tokens(stream::iter(items).boxed(), &mut sink, &token).await;
        sink.close();

        assert_eq!(outcome, Outcome::Failed("out of memory".to_string()));
        assert_eq!(
            outcome.into_result(),
            Err(Error::GenerationFailure {
                context: "out of memory".to_string()
            })
        );
        assert_eq!(drain(rx).await, "partial ");
    }

    #[tokio::test]
    async fn errors_after_a_signal_count_as_cancellation() {
        let token = RequestToken::new(RequestId::from_raw(0));
        let (mut sink, _rx) = ResponseSink::channel(token.id(), 8);
        token.signal(CancelReason::Timeout);

        let items = vec![Err(EngineError::Failed("aborted".to_string()))];
        let outcome = pump_tokens(stream::iter(items).boxed(), &mut sink, &token).await;
        assert_eq!(outcome, Outcome::Canceled(CancelReason::Timeout));
        assert_eq!(outcome.into_result(), Err(Error::CanceledByTimeout));
    }

    #[tokio::test]
    async fn nothing_is_written_once_signaled() {
        let token = RequestToken::new(RequestId::from_raw(0));
        let (mut sink, rx) = ResponseSink::channel(token.id(), 8);

        let engine_token = token.clone();
        let items = stream::iter(vec!["first", "second", "third"])
            .enumerate()
            .map(move |(i, t)| {
                if i == 1 {
                    engine_token.signal(CancelReason::Client);
                }
                Ok::<_, EngineError>(t.to_string())
            })
            .chain(stream::iter(vec![Err(EngineError::Cancelled)]))
            .boxed();

        let outcome = pump_tokens(items, &mut sink, &token).await;
        sink.close();

        assert_eq!(outcome, Outcome::Canceled(CancelReason::Client));
        assert_eq!(drain(rx).await, "first");
    }

    #[tokio::test]
    async fn a_closed_body_does_not_stop_the_drain() {
        let token = RequestToken::new(RequestId::from_raw(0));
        let (mut sink, rx) = ResponseSink::channel(token.id(), 1);
        drop(rx);

        let outcome =
            pump_tokens(stream::iter(text(&["x", "y", "z"])).boxed(), &mut sink, &token).await;
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(sink.written(), 0);
    }

    #[tokio::test]
    async fn unrequested_cancellation_is_a_failure() {
        let token = RequestToken::new(RequestId::from_raw(0));
        let (mut sink, _rx) = ResponseSink::channel(token.id(), 1);
        let items = vec![Err(EngineError::Cancelled)];
        let outcome = pump_tokens(stream::iter(items).boxed(), &mut sink, &token).await;
        assert!(matches!(outcome, Outcome::Failed(_)));
    }
}
