pub mod error;
pub mod fingerprint;
pub mod hashing;
pub mod mutation;
pub mod request;
pub mod style;
pub mod types;
pub mod workflow;
