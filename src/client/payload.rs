//! `/completion` request bodies built from a `GenerationState`.
//!
//! The loosely-typed settings (DRY breakers, sampler order, token bans) are
//! normalized here. Anything malformed is replaced with a safe default and
//! logged; building a payload never fails.

use llama_server_types::{FieldInput, GenerationState};
use log::warn;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// DRY breakers used when none (or garbage) are configured.
pub const DEFAULT_DRY_SEQUENCE_BREAKERS: [&str; 7] = ["\n", ":", ";", ".", "!", "?", ","];

/// Sampler names llama-server understands in `samplers`.
pub const VALID_SAMPLERS: [&str; 9] = [
    "dry",
    "top_k",
    "top_p",
    "top_n_sigma",
    "min_p",
    "temperature",
    "xtc",
    "typ_p",
    "penalties",
];

/// UI sampler names passed through unchanged.
const PASSTHROUGH_SAMPLERS: [&str; 7] = [
    "dry",
    "top_k",
    "top_p",
    "top_n_sigma",
    "min_p",
    "temperature",
    "xtc",
];

const PROMPT_PREVIEW_TOKENS: usize = 10;
const PROMPT_PREVIEW_CHARS: usize = 200;

/// Wire body for `/completion`; a JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct RequestPayload(Map<String, Value>);

impl RequestPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub(crate) fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Pretty JSON of every field except `prompt`, for logs and errors.
    pub fn describe_without_prompt(&self) -> String {
        let printable: Map<String, Value> = self
            .0
            .iter()
            .filter(|(k, _)| k.as_str() != "prompt")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::to_string_pretty(&printable).unwrap_or_default()
    }

    /// Short form of the prompt: the first tokens of a token list, or the
    /// first characters of the text. Multimodal prompts show an image count
    /// in place of the image data.
    pub fn prompt_preview(&self) -> String {
        match self.0.get("prompt") {
            Some(Value::Array(tokens)) if tokens.len() > PROMPT_PREVIEW_TOKENS => {
                let head = Value::Array(tokens[..PROMPT_PREVIEW_TOKENS].to_vec());
                format!("{head}...")
            }
            Some(Value::String(text)) => truncate_chars(text),
            Some(Value::Object(multimodal)) => {
                let text = multimodal
                    .get("prompt_string")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let images = multimodal
                    .get("multimodal_data")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                format!("{} <{images} images>", truncate_chars(text))
            }
            Some(other) => truncate_chars(&other.to_string()),
            None => String::new(),
        }
    }
}

fn truncate_chars(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PROMPT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

impl From<Map<String, Value>> for RequestPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Map sampling settings to llama-server field names. Prompt and token
/// budget are added by the caller.
pub fn build_payload(state: &GenerationState) -> RequestPayload {
    let (temperature, dynatemp_range) = if state.dynamic_temperature {
        (
            (state.dynatemp_low + state.dynatemp_high) / 2.0,
            (state.dynatemp_high - state.dynatemp_low) / 2.0,
        )
    } else {
        (state.temperature, 0.0)
    };

    let mut payload = RequestPayload::new();
    payload.insert("temperature", temperature);
    payload.insert("dynatemp_range", dynatemp_range);
    payload.insert("dynatemp_exponent", state.dynatemp_exponent);
    payload.insert("top_k", state.top_k);
    payload.insert("top_p", state.top_p);
    payload.insert("min_p", state.min_p);
    payload.insert(
        "top_n_sigma",
        if state.top_n_sigma > 0.0 { state.top_n_sigma } else { -1.0 },
    );
    payload.insert("typical_p", state.typical_p);
    payload.insert("repeat_penalty", state.repetition_penalty);
    payload.insert("repeat_last_n", state.repetition_penalty_range);
    payload.insert("presence_penalty", state.presence_penalty);
    payload.insert("frequency_penalty", state.frequency_penalty);
    payload.insert("dry_multiplier", state.dry_multiplier);
    payload.insert("dry_base", state.dry_base);
    payload.insert("dry_allowed_length", state.dry_allowed_length);
    payload.insert("dry_penalty_last_n", state.repetition_penalty_range);
    payload.insert("xtc_probability", state.xtc_probability);
    payload.insert("xtc_threshold", state.xtc_threshold);
    payload.insert("mirostat", state.mirostat_mode);
    payload.insert("mirostat_tau", state.mirostat_tau);
    payload.insert("mirostat_eta", state.mirostat_eta);
    payload.insert("grammar", state.grammar_string.as_str());
    payload.insert("seed", state.seed);
    payload.insert("ignore_eos", state.ban_eos_token);

    payload.insert(
        "dry_sequence_breakers",
        parse_sequence_breakers(state.dry_sequence_breakers.as_ref()),
    );

    if let Some(samplers) =
        parse_sampler_priority(state.sampler_priority.as_ref(), state.temperature_last)
    {
        payload.insert("samplers", samplers);
    }

    if let Some(bans) = parse_token_bans(state.custom_token_bans.as_ref()) {
        payload.insert("logit_bias", bans);
    }

    if !state.stopping_strings.is_empty() {
        payload.insert("stop", state.stopping_strings.clone());
    }

    payload
}

pub fn default_sequence_breakers() -> Vec<String> {
    DEFAULT_DRY_SEQUENCE_BREAKERS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// DRY breakers from a list, a JSON array string or a comma separated string.
pub fn parse_sequence_breakers(input: Option<&FieldInput<String>>) -> Vec<String> {
    match input {
        None => default_sequence_breakers(),
        Some(FieldInput::List(items)) => items.clone(),
        Some(FieldInput::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                default_sequence_breakers()
            } else if text.starts_with('[') {
                serde_json::from_str::<Vec<String>>(text).unwrap_or_else(|e| {
                    warn!("[PAYLOAD] Error parsing dry_sequence_breakers: {e}, using defaults");
                    default_sequence_breakers()
                })
            } else {
                text.split(',')
                    .filter(|item| !item.trim().is_empty())
                    .map(|item| {
                        item.trim_matches(|c: char| c == '"' || c == '\'' || c == ' ')
                            .to_string()
                    })
                    .collect()
            }
        }
        Some(FieldInput::Other(value)) => {
            warn!("[PAYLOAD] Unsupported dry_sequence_breakers {value}, using defaults");
            default_sequence_breakers()
        }
    }
}

/// Sampler order from a list or a newline separated string.
///
/// Unknown names are dropped, `typical_p` becomes `typ_p`, the first
/// `repetition_penalty` becomes `penalties`. With `temperature_last` the
/// temperature sampler is moved to the end. `None` when nothing is left.
pub fn parse_sampler_priority(
    input: Option<&FieldInput<String>>,
    temperature_last: bool,
) -> Option<Vec<String>> {
    let names: Vec<String> = match input? {
        FieldInput::List(items) => items.clone(),
        FieldInput::Text(text) => text
            .split('\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        FieldInput::Other(value) => {
            warn!("[PAYLOAD] Unsupported sampler_priority {value}, skipping custom sampler order");
            return None;
        }
    };

    let mut samplers = Vec::new();
    let mut penalty_found = false;
    for name in &names {
        let name = name.trim().to_lowercase();
        if PASSTHROUGH_SAMPLERS.contains(&name.as_str()) {
            samplers.push(name);
        } else if name == "typical_p" {
            samplers.push("typ_p".to_string());
        } else if name == "repetition_penalty" && !penalty_found {
            samplers.push("penalties".to_string());
            penalty_found = true;
        }
    }

    if temperature_last {
        if let Some(pos) = samplers.iter().position(|s| s == "temperature") {
            let temperature = samplers.remove(pos);
            samplers.push(temperature);
        }
    }

    (!samplers.is_empty()).then_some(samplers)
}

/// Token bans as `logit_bias` entries `[id, false]`.
///
/// Accepts `"12, 345"`, `[12, 345]`, numeric strings in a list, or ready
/// `[id, bias]` pairs. Non-numeric entries are skipped with a warning.
pub fn parse_token_bans(input: Option<&FieldInput<Value>>) -> Option<Vec<Value>> {
    let mut bans = Vec::new();
    match input? {
        FieldInput::Text(text) => {
            for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match parse_token_id(item) {
                    Some(id) => bans.push(json!([id, false])),
                    None => warn!("[PAYLOAD] Ignoring invalid token ban: {item}"),
                }
            }
        }
        FieldInput::List(items) => {
            for item in items {
                match item {
                    Value::Number(n) if n.as_u64().is_some() => bans.push(json!([n, false])),
                    Value::String(s) => match parse_token_id(s.trim()) {
                        Some(id) => bans.push(json!([id, false])),
                        None => warn!("[PAYLOAD] Ignoring invalid token ban: {s}"),
                    },
                    Value::Array(pair) if !pair.is_empty() => bans.push(item.clone()),
                    other => warn!("[PAYLOAD] Ignoring invalid token ban: {other}"),
                }
            }
        }
        FieldInput::Other(value) => {
            warn!("[PAYLOAD] Unsupported custom_token_bans {value}, skipping token bans");
        }
    }

    (!bans.is_empty()).then_some(bans)
}

fn parse_token_id(item: &str) -> Option<u64> {
    if item.is_empty() || !item.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    item.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers(text: &str) -> Vec<String> {
        parse_sequence_breakers(Some(&FieldInput::Text(text.to_string())))
    }

    #[test]
    fn test_sequence_breakers_shapes() {
        assert_eq!(breakers("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(breakers(r#"["x"]"#), vec!["x"]);
        assert_eq!(breakers(r#""\n", ":", "'""#), vec!["\\n", ":", ""]);
        assert_eq!(breakers("[unterminated"), default_sequence_breakers());
        assert_eq!(breakers("   "), default_sequence_breakers());
        assert_eq!(parse_sequence_breakers(None).len(), 7);
        assert_eq!(
            parse_sequence_breakers(Some(&FieldInput::List(vec!["\n".to_string()]))),
            vec!["\n"]
        );
        assert_eq!(
            parse_sequence_breakers(Some(&FieldInput::Other(json!(5)))),
            default_sequence_breakers()
        );
    }

    #[test]
    fn test_sampler_remap_and_temperature_last() {
        let input = FieldInput::List(vec![
            "Repetition_Penalty".to_string(),
            "typical_p".to_string(),
            "temperature".to_string(),
        ]);
        assert_eq!(
            parse_sampler_priority(Some(&input), true),
            Some(vec!["penalties".to_string(), "typ_p".to_string(), "temperature".to_string()])
        );
    }

    #[test]
    fn test_sampler_text_filtering() {
        let input = FieldInput::from(
            "temperature\nrepetition_penalty\n\ntop_k\nrepetition_penalty\nmirostat\nxtc\n",
        );
        assert_eq!(
            parse_sampler_priority(Some(&input), true).unwrap(),
            vec!["penalties", "top_k", "xtc", "temperature"]
        );
        assert_eq!(
            parse_sampler_priority(Some(&input), false).unwrap(),
            vec!["temperature", "penalties", "top_k", "xtc"]
        );
    }

    #[test]
    fn test_sampler_priority_empty_is_none() {
        assert_eq!(parse_sampler_priority(None, true), None);
        assert_eq!(parse_sampler_priority(Some(&FieldInput::from("mirostat\n")), false), None);
    }

    #[test]
    fn test_token_bans() {
        let bans = parse_token_bans(Some(&FieldInput::from("12, 345, abc,, 7")));
        assert_eq!(bans, Some(vec![json!([12, false]), json!([345, false]), json!([7, false])]));

        let bans = parse_token_bans(Some(&FieldInput::List(vec![
            json!(5),
            json!("9"),
            json!([3, -1.5]),
        ])));
        assert_eq!(bans, Some(vec![json!([5, false]), json!([9, false]), json!([3, -1.5])]));

        assert_eq!(parse_token_bans(Some(&FieldInput::from("x, -3"))), None);
        assert_eq!(parse_token_bans(None), None);
    }

    #[test]
    fn test_dynamic_temperature_folding() {
        let state = GenerationState {
            dynamic_temperature: true,
            dynatemp_low: 0.5,
            dynatemp_high: 1.5,
            temperature: 0.2,
            ..GenerationState::default()
        };
        let payload = build_payload(&state);
        assert_eq!(payload.get("temperature"), Some(&json!(1.0)));
        assert_eq!(payload.get("dynatemp_range"), Some(&json!(0.5)));

        let payload = build_payload(&GenerationState {
            temperature: 0.2,
            ..GenerationState::default()
        });
        assert_eq!(payload.get("temperature"), Some(&json!(0.2)));
        assert_eq!(payload.get("dynatemp_range"), Some(&json!(0.0)));
    }

    #[test]
    fn test_field_mapping() {
        let state = GenerationState {
            top_n_sigma: 0.0,
            repetition_penalty: 1.15,
            repetition_penalty_range: 256,
            mirostat_mode: 2,
            grammar_string: "root ::= \"yes\"".to_string(),
            seed: 1234,
            ban_eos_token: true,
            stopping_strings: vec!["\nUser:".to_string()],
            ..GenerationState::default()
        };
        let payload = build_payload(&state);

        assert_eq!(payload.get("top_n_sigma"), Some(&json!(-1.0)));
        assert_eq!(payload.get("repeat_penalty"), Some(&json!(1.15)));
        assert_eq!(payload.get("repeat_last_n"), Some(&json!(256)));
        assert_eq!(payload.get("dry_penalty_last_n"), Some(&json!(256)));
        assert_eq!(payload.get("mirostat"), Some(&json!(2)));
        assert_eq!(payload.get("grammar"), Some(&json!("root ::= \"yes\"")));
        assert_eq!(payload.get("seed"), Some(&json!(1234)));
        assert_eq!(payload.get("ignore_eos"), Some(&json!(true)));
        assert_eq!(payload.get("stop"), Some(&json!(["\nUser:"])));
        assert_eq!(payload.get("dry_sequence_breakers").unwrap().as_array().unwrap().len(), 7);
        assert!(!payload.contains_key("samplers"));
        assert!(!payload.contains_key("logit_bias"));
        assert!(!payload.contains_key("prompt"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let state = GenerationState {
            sampler_priority: Some(FieldInput::from("top_k\ntemperature")),
            custom_token_bans: Some(FieldInput::from("1,2")),
            dry_sequence_breakers: Some(FieldInput::from("[broken")),
            ..GenerationState::default()
        };
        assert_eq!(build_payload(&state), build_payload(&state));
    }

    #[test]
    fn test_prompt_preview_and_description() {
        let mut payload = RequestPayload::new();
        payload.insert("prompt", (1..=12).collect::<Vec<i64>>());
        payload.insert("seed", 7);
        assert_eq!(payload.prompt_preview(), "[1,2,3,4,5,6,7,8,9,10]...");
        assert!(!payload.describe_without_prompt().contains("prompt"));
        assert!(payload.describe_without_prompt().contains("\"seed\": 7"));

        payload.insert("prompt", "short");
        assert_eq!(payload.prompt_preview(), "short");

        let long = "secret ".repeat(5000);
        payload.insert("prompt", long.as_str());
        let preview = payload.prompt_preview();
        assert!(preview.len() < 1000);
        assert!(preview.ends_with("..."));

        payload.insert(
            "prompt",
            json!({"prompt_string": long, "multimodal_data": ["A".repeat(200_000)]}),
        );
        let preview = payload.prompt_preview();
        assert!(preview.len() < 1000);
        assert!(preview.starts_with("secret secret"));
        assert!(preview.ends_with("... <1 images>"));
        assert!(!preview.contains("AAAA"));
    }
}
