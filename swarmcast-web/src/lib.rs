//! Swarmcast Web - HLS streaming API
//!
//! Thin axum surface over [`swarmcast_core::StreamService`]: request parsing,
//! response shaping and nothing else.

#![deny(clippy::missing_panics_doc)]

pub mod handlers;
pub mod server;

pub use handlers::ApiError;
pub use server::{AppState, ServerError, router, run_server};
