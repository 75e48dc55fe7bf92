//! HTTP service for streamed, single-slot text generation.
//!
//! This module defines [`PromptService`], the shared state behind every route,
//! and the route handlers themselves.
//!
//! ## Routes
//!
//! - `GET /app?prompt=<text>` - validates the prompt, passes it through the
//!   admission gate and streams the generation back as a chunked
//!   `text/plain` body. Refusals are plain-text bodies with a 4xx/5xx status.
//! - `GET /debug` - `{ nbTotal, nbPending, queue }` from the registry.
//! - `POST /cancel/{id}` - signals a registered request's token.
//! - `GET /health` - liveness.
//!
//! Paths no route matches are served from the static directory, if one is
//! configured.
//!
//! ## Responsibilities
//!
//! - Own the registry and the admission gate for this server instance.
//! - Spawn one lifecycle task per admitted request.
//! - Refuse new work, drain, then cancel what is left on shutdown.

use crate::server::{
    config::ServerConfig,
    streaming::{
        coordinator::{GenerationRequest, run_request},
        sink::{DisconnectAware, ResponseSink},
    },
    telemetry::{increment_admitted, increment_rejected, record_prompt_length},
};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use core::time::Duration;
use serde::Deserialize;
use singlet_core::{
    Error,
    engine::Engine,
    gate::AdmissionGate,
    registry::{Registry, Snapshot},
    types::{CancelReason, RequestId},
};
use std::sync::Arc;
use tokio::time::{Instant, timeout};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::Instrument;

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Shared state for the HTTP routes.
///
/// Cloning is cheap; every clone refers to the same registry, gate and
/// engine. Build one per server instance.
#[derive(Clone)]
pub struct PromptService {
    config: Arc<ServerConfig>,
    gate: Arc<AdmissionGate>,
    engine: Arc<dyn Engine>,
}

#[derive(Debug, Deserialize)]
pub struct AppParams {
    #[serde(default)]
    pub prompt: Option<String>,
}

impl PromptService {
    /// Creates the service with a fresh, empty registry.
    pub fn new(config: ServerConfig, engine: Arc<dyn Engine>) -> Self {
        let registry = Arc::new(Registry::new());
        let gate = AdmissionGate::new(
            registry,
            config.capacity,
            config.admission_policy.build(),
        )
        .with_eviction_wait(config.eviction_wait);

        Self {
            config: Arc::new(config),
            gate: Arc::new(gate),
            engine,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.gate.registry()
    }

    /// Builds the router with all routes and middleware attached.
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/app", get(app))
            .route("/debug", get(debug))
            .route("/cancel/{id}", post(cancel))
            .route("/health", get(health))
            .with_state(self.clone());

        let router = match &self.config.static_dir {
            Some(dir) => router.fallback_service(ServeDir::new(dir)),
            None => router,
        };

        router.layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
    }

    /// Checks the prompt and admits it, returning everything the lifecycle
    /// controller needs plus the response body.
    async fn start(&self, prompt: String) -> Result<(GenerationRequest, Body), Error> {
        let chars = prompt.chars().count();
        record_prompt_length(chars as f64);

        if chars < self.config.min_prompt_length {
            increment_rejected("invalid_prompt");
            return Err(Error::InvalidPrompt {
                reason: format!(
                    "prompt must be at least {} characters (got {chars})",
                    self.config.min_prompt_length
                ),
            });
        }

        let registration = self.gate.admit().await.inspect_err(|e| {
            increment_rejected(match e {
                Error::ServiceShutdown => "shutdown",
                _ => "capacity",
            });
        })?;
        // The deadline counts from admission. A timeout too large to add to
        // the clock means no deadline.
        let deadline = Instant::now().checked_add(self.config.timeout);
        if deadline.is_none() {
            tracing::debug!(id = %registration.id(), "Timeout out of range, no deadline armed");
        }
        increment_admitted();

        let (sink, rx) = ResponseSink::channel(registration.id(), self.config.stream_buffer_size);
        let body = Body::from_stream(DisconnectAware::new(rx, registration.token().clone()));

        Ok((
            GenerationRequest {
                registration,
                prompt,
                params: self.config.sampling.clone(),
                deadline,
                sink,
            },
            body,
        ))
    }

    /// Initiates a graceful shutdown.
    ///
    /// - Closes the gate so new requests get [`Error::ServiceShutdown`].
    /// - Waits up to `shutdown_timeout` for in-flight requests to finish.
    /// - Signals whatever is left with [`CancelReason::Shutdown`] and waits
    ///   (up to 3 seconds) for those requests to deregister.
    pub async fn shutdown(&self) -> Result<(), Error> {
        tracing::info!("Refusing new requests");
        self.gate.close();

        let registry = self.registry();
        tracing::info!("Draining in-flight requests ({} active)", registry.size());
        if timeout(self.config.shutdown_timeout, wait_for_drain(registry))
            .await
            .is_ok()
        {
            tracing::debug!("All in-flight requests drained");
            return Ok(());
        }

        let signaled = registry.signal_all(CancelReason::Shutdown);
        tracing::warn!("Graceful drain timed out, cancelled {signaled} request(s)");

        match timeout(Duration::from_secs(3), wait_for_drain(registry)).await {
            Ok(()) => {
                tracing::info!("Shutdown drain complete");
            }
            Err(_) => {
                tracing::error!(
                    "{} request(s) still registered after cancellation",
                    registry.size()
                );
            }
        }

        Ok(())
    }
}

async fn wait_for_drain(registry: &Registry) {
    loop {
        let released = registry.released();
        if registry.size() == 0 {
            return;
        }
        released.await;
    }
}

/// Streams a generation for `prompt`.
#[tracing::instrument(skip_all)]
async fn app(
    State(service): State<PromptService>,
    Query(params): Query<AppParams>,
) -> Result<Response, Error> {
    let prompt = params.prompt.unwrap_or_default();
    let (request, body) = service.start(prompt).await.inspect_err(|e| {
        tracing::info!("Request refused: {e}");
    })?;

    let id = request.registration.id();
    tracing::info!(%id, "Request admitted");

    let engine = Arc::clone(&service.engine);
    tokio::spawn(
        async move {
            if let Err(e) = run_request(engine, request).await.into_result() {
                tracing::debug!("Request ended early: {e}");
            }
        }
        .instrument(tracing::info_span!("request", %id)),
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (REQUEST_ID_HEADER.clone(), id.to_string()),
        ],
        body,
    )
        .into_response())
}

async fn debug(State(service): State<PromptService>) -> Json<Snapshot> {
    Json(service.registry().snapshot())
}

/// Signals the token of a registered request.
#[tracing::instrument(skip_all, fields(id = %raw))]
async fn cancel(
    State(service): State<PromptService>,
    Path(raw): Path<String>,
) -> Result<(StatusCode, String), Error> {
    let token = raw
        .parse::<RequestId>()
        .ok()
        .and_then(|id| service.registry().token_for(id))
        .ok_or_else(|| Error::NotFound { id: raw.clone() })?;

    let message = if token.signal(CancelReason::External) {
        tracing::info!(id = %token.id(), "Request cancelled by operator");
        format!("cancelling request {}", token.id())
    } else {
        format!("request {} is already stopping", token.id())
    };

    Ok((StatusCode::ACCEPTED, message))
}

async fn health() -> &'static str {
    "ok"
}
