//! Server-side components of `singlet`.
//!
//! ## Submodules
//!
//! - [`config`] - CLI / environment configuration.
//! - [`engine`] - The built-in demonstration engine.
//! - [`service`] - HTTP routes, handlers and shared state.
//! - [`streaming`] - The per-request lifecycle controller and the response
//!   body plumbing.
//! - [`telemetry`] - Logging and optional OpenTelemetry export.
//!
//! These components are wired together in the server's `main.rs`.

pub mod config;
pub mod engine;
pub mod service;
pub mod streaming;
pub mod telemetry;
