use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the supervisor and the inference client.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to allocate a local port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("Failed to spawn llama-server at {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Server process terminated unexpectedly with exit code: {}", display_code(.code))]
    ExitedDuringStartup { code: Option<i32> },

    #[error("No .gguf model file found at {}", .path.display())]
    ModelFileNotFound { path: PathBuf },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("HTTP {status} from {url}: {body}\nRequest (without prompt): {request}\nPrompt: {prompt_preview}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
        request: String,
        prompt_preview: String,
    },

    #[error("Invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("Unexpected response format after {attempts} attempts: 'completion_probabilities' not found in {last_response}")]
    LogitsUnavailable { attempts: usize, last_response: String },

    #[error("Stream read error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Invalid configuration in {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
