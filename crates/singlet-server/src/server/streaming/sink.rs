//! The HTTP side of a request's output.
//!
//! [`ResponseSink`] is the append-only writer the lifecycle controller feeds
//! tokens into; its reader half becomes the chunked response body. The body is
//! wrapped in [`DisconnectAware`], which turns "hyper dropped the body before
//! it was exhausted" (the client went away) into a
//! [`CancelReason::Client`] signal on the request's token.

use bytes::Bytes;
use core::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};
use futures::Stream;
use pin_project_lite::pin_project;
use singlet_core::{
    cancel::RequestToken,
    types::{CancelReason, RequestId},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Items carried from the controller to the response body.
pub type Chunk = Result<Bytes, Infallible>;

/// The reader half of the sink has gone away.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("response sink for request {id} is closed")]
pub struct SinkClosed {
    pub id: RequestId,
}

/// Append-only writer for one response body.
#[derive(Debug)]
pub struct ResponseSink {
    id: RequestId,
    tx: Option<mpsc::Sender<Chunk>>,
    written: u64,
}

impl ResponseSink {
    /// Creates a sink buffering up to `buffer` chunks, and the receiver that
    /// feeds the response body.
    pub fn channel(id: RequestId, buffer: usize) -> (Self, mpsc::Receiver<Chunk>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                id,
                tx: Some(tx),
                written: 0,
            },
            rx,
        )
    }

    /// Appends `text` to the body, waiting for buffer space.
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] if the sink was closed or the body was dropped.
    /// The text is discarded.
    pub async fn write(&mut self, text: String) -> Result<(), SinkClosed> {
        let tx = self.tx.as_ref().ok_or(SinkClosed { id: self.id })?;
        if tx.send(Ok(Bytes::from(text))).await.is_err() {
            // Reader is gone; nothing further can be delivered.
            self.tx = None;
            return Err(SinkClosed { id: self.id });
        }
        self.written += 1;
        Ok(())
    }

    /// Ends the body. Later calls are no-ops.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            tracing::trace!(id = %self.id, written = self.written, "response sink closed");
        }
    }

    pub const fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Number of chunks handed to the body so far.
    pub const fn written(&self) -> u64 {
        self.written
    }
}

pin_project! {
    /// Response body stream that cancels its request if dropped early.
    pub struct DisconnectAware<S> {
        #[pin]
        inner: S,
        token: RequestToken,
        finished: bool,
    }

    impl<S> PinnedDrop for DisconnectAware<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if !*this.finished && this.token.signal(CancelReason::Client) {
                tracing::info!(id = %this.token.id(), "client disconnected mid-stream");
            }
        }
    }
}

impl DisconnectAware<ReceiverStream<Chunk>> {
    pub fn new(rx: mpsc::Receiver<Chunk>, token: RequestToken) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            token,
            finished: false,
        }
    }
}

impl<S: Stream> Stream for DisconnectAware<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let poll = this.inner.poll_next(cx);
        if let Poll::Ready(None) = poll {
            *this.finished = true;
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn token() -> RequestToken {
        RequestToken::new(RequestId::from_raw(0))
    }

    #[tokio::test]
    async fn writes_arrive_in_order_and_close_ends_the_body() {
        let token = token();
        let (mut sink, rx) = ResponseSink::channel(token.id(), 4);
        let mut body = DisconnectAware::new(rx, token.clone());

        sink.write("hello ".to_string()).await.unwrap();
        sink.write("world".to_string()).await.unwrap();
        sink.close();
        sink.close();
        assert!(!sink.is_open());
        assert_eq!(sink.written(), 2);

        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"hello world");

        drop(body);
        assert!(!token.is_signaled());
    }

    #[tokio::test]
    async fn dropping_an_unfinished_body_signals_the_client_reason() {
        let token = token();
        let (mut sink, rx) = ResponseSink::channel(token.id(), 4);
        let body = DisconnectAware::new(rx, token.clone());

        sink.write("partial".to_string()).await.unwrap();
        drop(body);

        assert_eq!(token.reason(), Some(CancelReason::Client));
        assert_eq!(
            sink.write("more".to_string()).await,
            Err(SinkClosed { id: token.id() })
        );
        assert!(!sink.is_open());
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (mut sink, _rx) = ResponseSink::channel(RequestId::from_raw(9), 1);
        sink.close();
        assert!(sink.write("late".to_string()).await.is_err());
        assert_eq!(sink.written(), 0);
    }
}
