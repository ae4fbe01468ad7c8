//! Supervises a local `llama-server` process and talks to it over HTTP.
//!
//! [`LlamaServer::start`] picks a free port, launches the server with flags
//! derived from a [`ServerConfig`], filters its stderr into a compact
//! progress line and blocks until `/health` answers. The returned handle
//! tokenizes, streams completions and fetches next-token probabilities, and
//! stops the process when dropped.

pub mod client;
pub mod config;
pub mod error;
pub mod log_filter;
pub mod logging;
pub mod media;
pub mod options;
pub mod port;
pub mod resolve;
pub mod server;

#[cfg(test)]
mod test_support;

pub use client::{build_agent, CompletionStream, InferenceClient, LlamaServer, RequestPayload};
pub use config::AppConfig;
pub use error::{Result, ServerError};
pub use options::ServerOptions;

pub use llama_server_types::{
    FieldInput, GenerationState, ServerConfig, TokenProbability, VALID_CACHE_TYPES,
};
