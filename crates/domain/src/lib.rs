//! Shared domain types for Relay — entities, run lifecycle, tool call
//! wire formats, stream events, errors, and environment configuration.
//!
//! Every other crate in the workspace depends on this one; it depends on
//! nothing but serde, uuid, and chrono.

pub mod cancel;
pub mod chat;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod run;
pub mod stream;
pub mod tool;

pub use cancel::CancelToken;
pub use error::{Error, Result};
