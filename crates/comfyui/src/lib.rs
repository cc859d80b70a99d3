//! ComfyUI renderer boundary.
//!
//! Typed REST and WebSocket clients, the per-engine event-stream session,
//! graph template loading, and the execution client that takes a mutated
//! graph through upload, submission, monitoring and artifact retrieval.

pub mod api;
pub mod client;
pub mod events;
pub mod executor;
pub mod history;
pub mod messages;
pub mod monitor;
pub mod processor;
pub mod reconnect;
pub mod session;
pub mod templates;
