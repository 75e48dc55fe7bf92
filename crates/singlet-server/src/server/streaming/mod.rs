//! Request lifecycle and output streaming.
//!
//! This module runs an admitted request end to end: it arms the deadline,
//! starts the engine, forwards tokens to the HTTP body and tears everything
//! down exactly once.
//!
//! ## Submodules
//!
//! - [`coordinator`] - The lifecycle controller for one request.
//! - [`processor`] - Moves tokens from the engine to the sink and classifies
//!   how the generation ended.
//! - [`sink`] - The response body writer and the disconnect-aware body
//!   stream.

pub mod coordinator;
pub mod processor;
pub mod sink;
