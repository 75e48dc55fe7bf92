//! HTTP service implementation.
//!
//! This module contains the client-facing routes and the state they share:
//! the admission gate (and through it the registry), the engine and the
//! configuration. Each admitted request is handed to the lifecycle controller
//! in [`crate::server::streaming`] on its own task.
//!
//! ## Structure
//!
//! - [`handler`] - Routes and the [`PromptService`](handler::PromptService)
//!   state.

pub mod handler;
