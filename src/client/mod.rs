//! HTTP client for a health-checked llama-server.

pub mod payload;
pub mod sanitize;
pub mod stream;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use llama_server_types::{GenerationState, ServerConfig, TokenProbability};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{Result, ServerError};
use crate::media::{collect_images, ImageConverter};
use crate::options::ServerOptions;
use crate::server::{ServerEndpoint, ServerMetadata, ServerSupervisor};

pub use payload::{build_payload, RequestPayload};
pub use sanitize::{repair, PLACEHOLDER_PROMPT};
pub use stream::CompletionStream;

/// Token cost assumed for each image in a multimodal prompt.
pub const IMAGE_TOKEN_COST_ESTIMATE: i64 = 600;
/// Requests made by `get_logits` before giving up.
pub const LOGITS_ATTEMPTS: usize = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WORDS_TO_TOKENS: f64 = 1.3;

/// Agent shared by the supervisor and the client of one server.
///
/// No read timeout: generations may stream for minutes.
pub fn build_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .build()
}

/// Talks to one llama-server instance.
#[derive(Debug)]
pub struct InferenceClient {
    agent: ureq::Agent,
    endpoint: ServerEndpoint,
    metadata: ServerMetadata,
    multimodal: bool,
    image_converter: Arc<dyn ImageConverter>,
    stop_flag: Arc<AtomicBool>,
    verbose: bool,
    last_prompt_token_count: i64,
}

impl InferenceClient {
    pub fn new(
        agent: ureq::Agent,
        endpoint: ServerEndpoint,
        metadata: ServerMetadata,
        multimodal: bool,
        options: &ServerOptions,
    ) -> Self {
        Self {
            agent,
            endpoint,
            metadata,
            multimodal,
            image_converter: Arc::clone(&options.image_converter),
            stop_flag: Arc::clone(&options.stop_flag),
            verbose: options.verbose,
            last_prompt_token_count: 0,
        }
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        self.endpoint
    }

    pub fn vocabulary_size(&self) -> Option<u64> {
        self.metadata.vocabulary_size
    }

    pub fn bos_token(&self) -> &str {
        &self.metadata.bos_token
    }

    pub fn is_multimodal(&self) -> bool {
        self.multimodal
    }

    /// Prompt size of the last generation: exact, or estimated when the
    /// prompt could not be tokenized or carried images.
    pub fn last_prompt_token_count(&self) -> i64 {
        self.last_prompt_token_count
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Token ids for `text`. A text that already starts with the BOS token
    /// never gets a second one.
    pub fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<i32>> {
        let bos = self.metadata.bos_token.as_str();
        let has_bos = !bos.is_empty() && text.starts_with(bos);
        let add_special = add_special && !has_bos;

        let response = self.post_json(
            "/tokenize",
            &json!({"content": text, "add_special": add_special}),
        )?;
        Ok(response
            .get("tokens")
            .and_then(Value::as_array)
            .map(|tokens| {
                tokens
                    .iter()
                    .filter_map(Value::as_i64)
                    .filter_map(|t| i32::try_from(t).ok())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn detokenize(&self, token_ids: &[i32]) -> Result<String> {
        let response = self.post_json("/detokenize", &json!({"tokens": token_ids}))?;
        Ok(response
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub fn build_payload(&self, state: &GenerationState) -> RequestPayload {
        build_payload(state)
    }

    /// Start a streaming generation.
    ///
    /// A 4xx answer is retried once with a repaired payload; if the repair
    /// changes nothing or the retry fails too, the first error is returned.
    pub fn generate_streaming(
        &mut self,
        prompt: &str,
        state: &GenerationState,
    ) -> Result<CompletionStream<'_>> {
        let mut payload = self.build_payload(state);

        let images = if self.multimodal {
            collect_images(state, self.image_converter.as_ref())
        } else {
            Vec::new()
        };

        if !images.is_empty() {
            let encoded: Vec<String> = images
                .iter()
                .map(|image| self.image_converter.encode_base64(image))
                .collect();
            let text_tokens = self.tokenize_for_prompt(prompt, state.add_bos_token);
            payload.insert(
                "prompt",
                json!({"prompt_string": prompt, "multimodal_data": encoded}),
            );
            self.last_prompt_token_count =
                text_tokens.len() as i64 + images.len() as i64 * IMAGE_TOKEN_COST_ESTIMATE;
        } else {
            let tokens = self.tokenize_for_prompt(prompt, state.add_bos_token);
            if !tokens.is_empty() {
                self.last_prompt_token_count = tokens.len() as i64;
                payload.insert("prompt", tokens);
            } else if !prompt.trim().is_empty() {
                warn!("[CLIENT] Tokenization failed for prompt, sending it as text");
                let words = prompt.split_whitespace().count();
                self.last_prompt_token_count = (words as f64 * WORDS_TO_TOKENS) as i64;
                payload.insert("prompt", prompt);
            } else {
                error!("[CLIENT] Empty prompt detected: {prompt:?}");
                self.last_prompt_token_count = 1;
                payload.insert("prompt", PLACEHOLDER_PROMPT);
            }
        }

        let max_new_tokens = if state.auto_max_new_tokens {
            state.truncation_length - self.last_prompt_token_count
        } else {
            state.max_new_tokens
        };
        payload.insert("n_predict", max_new_tokens);
        payload.insert("stream", true);
        payload.insert("cache_prompt", true);

        if self.verbose {
            info!("[CLIENT] GENERATE_PARAMS=\n{}", payload.describe_without_prompt());
        }

        let url = self.endpoint.url("/completion");
        let response = match self.agent.post(&url).send_json(&payload) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) if (400..500).contains(&status) => {
                let original = completion_status_error(status, &url, response, &payload);
                error!("[CLIENT] {original}");

                let fixed = repair(&payload);
                if fixed == payload {
                    return Err(original);
                }
                info!("[CLIENT] Attempting with fixed payload...");
                match self.agent.post(&url).send_json(&fixed) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("[CLIENT] Retry with fixed payload failed: {e}");
                        return Err(original);
                    }
                }
            }
            Err(ureq::Error::Status(status, response)) => {
                return Err(completion_status_error(status, &url, response, &payload));
            }
            Err(e) => return Err(transport_error(&url, e)),
        };

        Ok(CompletionStream::new(
            response.into_reader(),
            Arc::clone(&self.stop_flag),
        ))
    }

    /// Run a generation to the end and return the final text.
    pub fn generate(&mut self, prompt: &str, state: &GenerationState) -> Result<String> {
        let mut output = String::new();
        for text in self.generate_streaming(prompt, state)? {
            output = text?;
        }
        Ok(output)
    }

    /// Next-token candidates after `prompt`: post-sampling probabilities when
    /// `use_samplers` is set, raw log-probabilities otherwise.
    pub fn get_logits(
        &self,
        prompt: &str,
        state: &GenerationState,
        top_n: usize,
        use_samplers: bool,
    ) -> Result<Vec<TokenProbability>> {
        let mut payload = self.build_payload(state);
        payload.insert("prompt", self.tokenize(prompt, state.add_bos_token)?);
        payload.insert("n_predict", 0);
        payload.insert("logprobs", true);
        payload.insert("n_probs", top_n);
        payload.insert("stream", false);
        payload.insert("post_sampling_probs", use_samplers);

        if self.verbose && use_samplers {
            info!("[CLIENT] GENERATE_PARAMS=\n{}", payload.describe_without_prompt());
        }

        let url = self.endpoint.url("/completion");
        let key = if use_samplers { "top_probs" } else { "top_logprobs" };
        let mut last_response = Value::Null;

        for attempt in 1..=LOGITS_ATTEMPTS {
            let result: Value = match self.agent.post(&url).send_json(&payload) {
                Ok(response) => response.into_json().map_err(|e| ServerError::InvalidResponse {
                    url: url.clone(),
                    message: e.to_string(),
                })?,
                Err(ureq::Error::Status(status, response)) => {
                    return Err(completion_status_error(status, &url, response, &payload));
                }
                Err(e) => return Err(transport_error(&url, e)),
            };

            if let Some(first) = result.pointer("/completion_probabilities/0") {
                let candidates = first.get(key).cloned().ok_or_else(|| {
                    ServerError::InvalidResponse {
                        url: url.clone(),
                        message: format!("'{key}' missing in {first}"),
                    }
                })?;
                return serde_json::from_value(candidates).map_err(|e| {
                    ServerError::InvalidResponse {
                        url: url.clone(),
                        message: e.to_string(),
                    }
                });
            }

            debug!(
                "[CLIENT] completion_probabilities missing (attempt {attempt}/{LOGITS_ATTEMPTS})"
            );
            last_response = result;
        }

        Err(ServerError::LogitsUnavailable {
            attempts: LOGITS_ATTEMPTS,
            last_response: last_response.to_string(),
        })
    }

    /// Tokenize a generation prompt; failures count as "no tokens" so the
    /// caller can fall back to a text prompt.
    fn tokenize_for_prompt(&self, prompt: &str, add_bos_token: bool) -> Vec<i32> {
        self.tokenize(prompt, add_bos_token).unwrap_or_else(|e| {
            warn!("[CLIENT] {e}");
            Vec::new()
        })
    }

    fn post_json(&self, path: &str, body: &impl Serialize) -> Result<Value> {
        let url = self.endpoint.url(path);
        let response = self
            .agent
            .post(&url)
            .send_json(body)
            .map_err(|e| transport_error(&url, e))?;
        response
            .into_json()
            .map_err(|e| ServerError::InvalidResponse {
                url,
                message: e.to_string(),
            })
    }
}

fn completion_status_error(
    status: u16,
    url: &str,
    response: ureq::Response,
    payload: &RequestPayload,
) -> ServerError {
    ServerError::HttpStatus {
        status,
        url: url.to_string(),
        body: response.into_string().unwrap_or_default(),
        request: payload.describe_without_prompt(),
        prompt_preview: payload.prompt_preview(),
    }
}

fn transport_error(url: &str, error: ureq::Error) -> ServerError {
    let message = match error {
        ureq::Error::Status(status, response) => {
            format!("HTTP {status}: {}", response.into_string().unwrap_or_default())
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    };
    ServerError::Request {
        url: url.to_string(),
        message,
    }
}

/// A llama-server process together with its client. Dropping it stops the
/// server.
#[derive(Debug)]
pub struct LlamaServer {
    client: InferenceClient,
    supervisor: ServerSupervisor,
}

impl LlamaServer {
    /// Launch llama-server for `model_path` and wait until it is healthy.
    pub fn start(model_path: &Path, config: &ServerConfig, options: ServerOptions) -> Result<Self> {
        let agent = build_agent();
        let supervisor = ServerSupervisor::start(model_path, config, &options, &agent)?;
        let client = InferenceClient::new(
            agent,
            supervisor.endpoint(),
            supervisor.metadata().clone(),
            config.is_multimodal(),
            &options,
        );
        Ok(Self { client, supervisor })
    }

    pub fn client(&self) -> &InferenceClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut InferenceClient {
        &mut self.client
    }

    pub fn port(&self) -> u16 {
        self.supervisor.endpoint().port()
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    pub fn is_running(&mut self) -> bool {
        self.supervisor.is_running()
    }

    pub fn vocabulary_size(&self) -> Option<u64> {
        self.client.vocabulary_size()
    }

    pub fn bos_token(&self) -> &str {
        self.client.bos_token()
    }

    pub fn last_prompt_token_count(&self) -> i64 {
        self.client.last_prompt_token_count()
    }

    pub fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<i32>> {
        self.client.tokenize(text, add_special)
    }

    pub fn detokenize(&self, token_ids: &[i32]) -> Result<String> {
        self.client.detokenize(token_ids)
    }

    pub fn build_payload(&self, state: &GenerationState) -> RequestPayload {
        self.client.build_payload(state)
    }

    pub fn generate_streaming(
        &mut self,
        prompt: &str,
        state: &GenerationState,
    ) -> Result<CompletionStream<'_>> {
        self.client.generate_streaming(prompt, state)
    }

    pub fn generate(&mut self, prompt: &str, state: &GenerationState) -> Result<String> {
        self.client.generate(prompt, state)
    }

    pub fn get_logits(
        &self,
        prompt: &str,
        state: &GenerationState,
        top_n: usize,
        use_samplers: bool,
    ) -> Result<Vec<TokenProbability>> {
        self.client.get_logits(prompt, state, top_n, use_samplers)
    }

    /// Stop the server now instead of on drop. Safe to call twice.
    pub fn stop(&mut self) {
        self.supervisor.stop();
    }
}
