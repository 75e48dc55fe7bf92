//! Engines bundled with the server.
//!
//! Model loading and serving are external to this crate; anything that
//! implements [`singlet_core::engine::Engine`] can be plugged into
//! [`PromptService`](crate::server::service::handler::PromptService).
//!
//! - [`echo`] - A paced echo engine used by the binary and in tests.

pub mod echo;
