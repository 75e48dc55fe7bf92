#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

pub mod cancel;
pub mod engine;
pub mod gate;
pub mod registry;
