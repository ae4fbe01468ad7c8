use serde::{Deserialize, Serialize};

/// An image attached through a UI upload. `data` is either raw base64 or a
/// `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    #[serde(default)]
    pub name: Option<String>,
    pub data: String,
}

/// An image already decoded to its file bytes (PNG, JPEG, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
}

impl DecodedImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// Chat history in OpenAI message format. Messages stay untyped because
/// `content` may be a string or an array of typed parts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}
