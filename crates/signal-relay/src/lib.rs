//! Signal Relay - streaming reply relay for LLM applications
//!
//! This crate provides a server that turns an upstream model's token stream
//! into a Server-Sent Events response, with a buffered fallback when the
//! stream fails before anything reached the client.

pub mod client;
pub mod config;
pub mod error;
pub mod relay;
pub mod testing;
pub mod types;
pub mod upstream;

pub use error::RelayError;
