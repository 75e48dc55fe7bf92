use super::{
    processor::{Outcome, pump_tokens},
    sink::ResponseSink,
};
use crate::server::telemetry::{
    decrement_streams_inflight, increment_cancellations, increment_failures,
    increment_streams_inflight, record_stream_duration,
};
use singlet_core::{
    cancel::RequestToken,
    engine::Engine,
    registry::Registration,
    types::{CancelReason, SamplingParams},
};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything the lifecycle controller needs to run one admitted request.
pub struct GenerationRequest {
    pub registration: Registration,
    pub prompt: String,
    pub params: SamplingParams,
    /// Instant after which the request is cancelled. `None` when the
    /// configured timeout is too large to represent, which means no deadline.
    pub deadline: Option<Instant>,
    pub sink: ResponseSink,
}

/// Drives one admitted request from registration to deregistration.
///
/// The request arrives already registered (the admission gate inserts it). The
/// controller:
///
/// - Arms the deadline trigger, which signals [`CancelReason::Timeout`] unless
///   the request ends first. The client-disconnect trigger lives on the
///   response body and the operator trigger on the `/cancel` route; both reach
///   the same token.
/// - Starts the generation with the token's observer and forwards its output
///   to the sink via [`pump_tokens`].
/// - Deregisters the request and then closes the sink, in that order, so a
///   client that sees the end of its body can immediately be admitted again.
///
/// Deregistration is owned by the [`Registration`] guard, so it also happens
/// exactly once if the generation panics and the task unwinds.
pub async fn run_request(engine: Arc<dyn Engine>, request: GenerationRequest) -> Outcome {
    let GenerationRequest {
        registration,
        prompt,
        params,
        deadline,
        mut sink,
    } = request;

    let started = Instant::now();
    let id = registration.id();
    let token = registration.token().clone();
    increment_streams_inflight();

    // Dropping the guard stops the timer task.
    let deadline_stop = CancellationToken::new();
    if let Some(deadline) = deadline {
        tokio::spawn(expire_at(deadline, token.clone(), deadline_stop.clone()));
    }
    let _deadline_guard = deadline_stop.drop_guard();

    tracing::debug!("Streaming generation");
    let tokens = engine.generate(&prompt, &params, token.observer());
    let outcome = pump_tokens(tokens, &mut sink, &token).await;

    match &outcome {
        Outcome::Completed => {
            tracing::info!(tokens = sink.written(), "Generation completed");
        }
        Outcome::Canceled(reason) => {
            increment_cancellations(*reason);
            tracing::info!(tokens = sink.written(), %reason, "Generation cancelled");
        }
        Outcome::Failed(context) => {
            increment_failures();
            tracing::warn!(tokens = sink.written(), "Generation failed: {context}");
        }
    }

    registration.release();
    sink.close();

    decrement_streams_inflight();
    record_stream_duration(started.elapsed().as_secs_f64() * 1_000.0);
    tracing::debug!(%id, "Request finished");

    outcome
}

/// Signals [`CancelReason::Timeout`] at `deadline` unless `stop` fires first.
///
/// Firing after the request already ended is harmless: the token is no longer
/// registered and a second signal records nothing.
async fn expire_at(deadline: Instant, token: RequestToken, stop: CancellationToken) {
    tokio::select! {
        () = stop.cancelled() => {}
        () = tokio::time::sleep_until(deadline) => {
            if token.signal(CancelReason::Timeout) {
                tracing::info!(id = %token.id(), "Request deadline elapsed");
            }
        }
    }
}
