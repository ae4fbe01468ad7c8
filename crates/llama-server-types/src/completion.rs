use serde::{Deserialize, Serialize};

/// One candidate next token from `/completion` with `n_probs` set.
///
/// `prob` is filled for post-sampling probabilities, `logprob` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProbability {
    pub id: i64,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f64>,
}
