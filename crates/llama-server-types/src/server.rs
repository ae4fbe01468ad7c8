use serde::{Deserialize, Serialize};

/// KV cache quantization types accepted by `--cache-type-k/-v`.
pub const VALID_CACHE_TYPES: &[&str] = &["fp16", "q8_0", "q4_0"];

/// Resolved launch parameters for one llama-server process.
///
/// Zero / `None` / `false` means "leave the server default alone"; the
/// command builder only emits flags for values that differ from that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ctx_size")]
    pub ctx_size: u32,
    #[serde(default)]
    pub gpu_layers: i32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub threads_batch: u32,
    #[serde(default)]
    pub no_mmap: bool,
    #[serde(default)]
    pub mlock: bool,
    /// Comma separated proportions, e.g. `"60,40"`.
    #[serde(default)]
    pub tensor_split: Option<String>,
    #[serde(default)]
    pub numa: bool,
    #[serde(default)]
    pub no_kv_offload: bool,
    #[serde(default)]
    pub row_split: bool,
    #[serde(default = "default_cache_type")]
    pub cache_type: String,
    /// Positional embedding compression factor; the server receives its reciprocal.
    #[serde(default = "default_compress_pos_emb")]
    pub compress_pos_emb: f64,
    #[serde(default)]
    pub rope_freq_base: f64,
    /// Multimodal projector file (literal path or name under the mmproj directory).
    #[serde(default)]
    pub mmproj: Option<String>,
    // Speculative decoding
    #[serde(default)]
    pub model_draft: Option<String>,
    #[serde(default = "default_draft_max")]
    pub draft_max: u32,
    #[serde(default = "default_gpu_layers_draft")]
    pub gpu_layers_draft: i32,
    #[serde(default)]
    pub device_draft: Option<String>,
    #[serde(default)]
    pub ctx_size_draft: u32,
    /// Long-context cache reuse (`--cache-reuse 1 --swa-full`).
    #[serde(default)]
    pub streaming_llm: bool,
    /// Free-form `key=value,flag,...` list passed through to the server.
    #[serde(default)]
    pub extra_flags: Option<String>,
}

fn default_ctx_size() -> u32 {
    8192
}

fn default_batch_size() -> u32 {
    256
}

fn default_cache_type() -> String {
    "fp16".to_string()
}

fn default_compress_pos_emb() -> f64 {
    1.0
}

fn default_draft_max() -> u32 {
    4
}

fn default_gpu_layers_draft() -> i32 {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ctx_size: default_ctx_size(),
            gpu_layers: 0,
            batch_size: default_batch_size(),
            threads: 0,
            threads_batch: 0,
            no_mmap: false,
            mlock: false,
            tensor_split: None,
            numa: false,
            no_kv_offload: false,
            row_split: false,
            cache_type: default_cache_type(),
            compress_pos_emb: default_compress_pos_emb(),
            rope_freq_base: 0.0,
            mmproj: None,
            model_draft: None,
            draft_max: default_draft_max(),
            gpu_layers_draft: default_gpu_layers_draft(),
            device_draft: None,
            ctx_size_draft: 0,
            streaming_llm: false,
            extra_flags: None,
        }
    }
}

impl ServerConfig {
    /// Whether a multimodal projector is configured (`"None"` counts as unset).
    pub fn is_multimodal(&self) -> bool {
        self.mmproj
            .as_deref()
            .map(|p| !p.is_empty() && p != "None")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"gpu_layers": 33}"#).unwrap();
        assert_eq!(config.gpu_layers, 33);
        assert_eq!(config.ctx_size, 8192);
        assert_eq!(config.cache_type, "fp16");
        assert_eq!(config.compress_pos_emb, 1.0);
    }

    #[test]
    fn test_is_multimodal() {
        let mut config = ServerConfig::default();
        assert!(!config.is_multimodal());
        config.mmproj = Some("None".to_string());
        assert!(!config.is_multimodal());
        config.mmproj = Some("mmproj-f16.gguf".to_string());
        assert!(config.is_multimodal());
    }
}
