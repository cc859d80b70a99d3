//! Generation orchestration.
//!
//! Providers (the local renderer and hosted APIs) behind one interface,
//! the rule-driven router that falls back across them, the fingerprint
//! keyed result cache, and the service and engine that tie them together.

pub mod cache;
pub mod config;
pub mod engine;
pub mod hosted;
pub mod local;
pub mod provider;
pub mod registry;
pub mod router;
pub mod rules;
pub mod service;

pub use config::EngineConfig;
pub use engine::Engine;
pub use service::{GenerationError, GenerationOutcome};
