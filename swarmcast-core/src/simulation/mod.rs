//! Deterministic stand-ins for the swarm and the encoder.
//!
//! Used by tests and by the `--simulate` dev mode of the server, which feeds
//! a local file through a simulated transfer.

pub mod backend;
pub mod encoder;

pub use backend::{FeedConfig, SimulatedBackend, SimulatedSession};
pub use encoder::{EncodeCall, ScriptedFailure, SimulatedEncoder};
