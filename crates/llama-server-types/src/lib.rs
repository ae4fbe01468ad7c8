//! Plain records shared between the llama-server supervisor/client and the
//! code that produces its inputs (settings screens, API handlers, config files).
//!
//! Nothing in here talks to a process or the network.

pub mod completion;
pub mod generation;
pub mod media;
pub mod server;

pub use completion::TokenProbability;
pub use generation::{FieldInput, GenerationState};
pub use media::{ChatHistory, DecodedImage, ImageAttachment};
pub use server::{ServerConfig, VALID_CACHE_TYPES};
