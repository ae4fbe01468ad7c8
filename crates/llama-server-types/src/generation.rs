use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media::{ChatHistory, DecodedImage, ImageAttachment};

/// A loosely-typed setting that callers may send as a native list, as a
/// single string (JSON text, comma or newline separated), or as anything else.
///
/// The payload builder turns each shape into a validated list; `Other` only
/// exists so a wrong shape is carried to that point instead of failing the
/// whole record at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldInput<T> {
    List(Vec<T>),
    Text(String),
    Other(Value),
}

impl<T> From<Vec<T>> for FieldInput<T> {
    fn from(items: Vec<T>) -> Self {
        FieldInput::List(items)
    }
}

impl<T> From<&str> for FieldInput<T> {
    fn from(text: &str) -> Self {
        FieldInput::Text(text.to_string())
    }
}

/// Resolved sampling/decoding settings for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationState {
    #[serde(default = "default_one")]
    pub temperature: f64,
    #[serde(default)]
    pub dynamic_temperature: bool,
    #[serde(default = "default_one")]
    pub dynatemp_low: f64,
    #[serde(default = "default_one")]
    pub dynatemp_high: f64,
    #[serde(default = "default_one")]
    pub dynatemp_exponent: f64,
    #[serde(default)]
    pub top_k: i64,
    #[serde(default = "default_one")]
    pub top_p: f64,
    #[serde(default)]
    pub min_p: f64,
    /// Values `<= 0` disable the sampler.
    #[serde(default)]
    pub top_n_sigma: f64,
    #[serde(default = "default_one")]
    pub typical_p: f64,
    #[serde(default = "default_one")]
    pub repetition_penalty: f64,
    #[serde(default = "default_repetition_penalty_range")]
    pub repetition_penalty_range: i64,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    // DRY
    #[serde(default)]
    pub dry_multiplier: f64,
    #[serde(default = "default_dry_base")]
    pub dry_base: f64,
    #[serde(default = "default_dry_allowed_length")]
    pub dry_allowed_length: i64,
    #[serde(default)]
    pub dry_sequence_breakers: Option<FieldInput<String>>,
    // XTC
    #[serde(default)]
    pub xtc_probability: f64,
    #[serde(default = "default_xtc_threshold")]
    pub xtc_threshold: f64,
    // Mirostat
    #[serde(default)]
    pub mirostat_mode: i64,
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f64,
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f64,
    #[serde(default)]
    pub grammar_string: String,
    /// `-1` lets the server pick a random seed.
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default)]
    pub ban_eos_token: bool,
    #[serde(default)]
    pub stopping_strings: Vec<String>,
    /// Sampler order; names as shown in the UI (`repetition_penalty`, `typical_p`, ...).
    #[serde(default)]
    pub sampler_priority: Option<FieldInput<String>>,
    #[serde(default)]
    pub temperature_last: bool,
    /// Token ids to ban: `"12, 345"` or `[12, 345]`.
    #[serde(default)]
    pub custom_token_bans: Option<FieldInput<Value>>,
    // Token budget
    #[serde(default = "default_true")]
    pub add_bos_token: bool,
    #[serde(default)]
    pub auto_max_new_tokens: bool,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: i64,
    #[serde(default = "default_truncation_length")]
    pub truncation_length: i64,
    // Image sources, checked in this order
    #[serde(default)]
    pub image_attachments: Vec<ImageAttachment>,
    #[serde(default)]
    pub history: Option<ChatHistory>,
    #[serde(default)]
    pub raw_images: Vec<DecodedImage>,
}

fn default_one() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_repetition_penalty_range() -> i64 {
    1024
}

fn default_dry_base() -> f64 {
    1.75
}

fn default_dry_allowed_length() -> i64 {
    2
}

fn default_xtc_threshold() -> f64 {
    0.1
}

fn default_mirostat_tau() -> f64 {
    5.0
}

fn default_mirostat_eta() -> f64 {
    0.1
}

fn default_seed() -> i64 {
    -1
}

fn default_max_new_tokens() -> i64 {
    512
}

fn default_truncation_length() -> i64 {
    8192
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            dynamic_temperature: false,
            dynatemp_low: 1.0,
            dynatemp_high: 1.0,
            dynatemp_exponent: 1.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            top_n_sigma: 0.0,
            typical_p: 1.0,
            repetition_penalty: 1.0,
            repetition_penalty_range: default_repetition_penalty_range(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            dry_multiplier: 0.0,
            dry_base: default_dry_base(),
            dry_allowed_length: default_dry_allowed_length(),
            dry_sequence_breakers: None,
            xtc_probability: 0.0,
            xtc_threshold: default_xtc_threshold(),
            mirostat_mode: 0,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            grammar_string: String::new(),
            seed: default_seed(),
            ban_eos_token: false,
            stopping_strings: Vec::new(),
            sampler_priority: None,
            temperature_last: false,
            custom_token_bans: None,
            add_bos_token: true,
            auto_max_new_tokens: false,
            max_new_tokens: default_max_new_tokens(),
            truncation_length: default_truncation_length(),
            image_attachments: Vec::new(),
            history: None,
            raw_images: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_input_shapes() {
        let state: GenerationState = serde_json::from_str(
            r#"{
                "dry_sequence_breakers": "a,b",
                "sampler_priority": ["top_k", "temperature"],
                "custom_token_bans": 7
            }"#,
        )
        .unwrap();

        assert_eq!(state.dry_sequence_breakers, Some(FieldInput::Text("a,b".to_string())));
        assert_eq!(
            state.sampler_priority,
            Some(FieldInput::List(vec!["top_k".to_string(), "temperature".to_string()]))
        );
        assert_eq!(state.custom_token_bans, Some(FieldInput::Other(Value::from(7))));
    }

    #[test]
    fn test_mixed_list_falls_back_to_other() {
        let input: FieldInput<String> = serde_json::from_str(r#"["a", 1]"#).unwrap();
        assert!(matches!(input, FieldInput::Other(_)));
    }

    #[test]
    fn test_empty_object_matches_default() {
        let state: GenerationState = serde_json::from_str("{}").unwrap();
        assert_eq!(state, GenerationState::default());
    }
}
