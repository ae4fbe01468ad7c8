//! Repair pass applied to a payload after the server rejected it with a
//! client error. Never run speculatively.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use log::warn;
use serde_json::{Number, Value};

use super::payload::{default_sequence_breakers, RequestPayload, VALID_SAMPLERS};

/// Sent instead of an empty prompt.
pub const PLACEHOLDER_PROMPT: &str = "Hello";

const MAX_SEED: i64 = (1 << 31) - 1;
const POSITIVE_FLOOR: f64 = 0.1;

const NON_NEGATIVE_FIELDS: [&str; 3] = ["top_k", "repeat_last_n", "n_predict"];
const POSITIVE_FIELDS: [&str; 4] = ["temperature", "top_p", "min_p", "typical_p"];

/// Numeric fields checked by `repair`, with the value used when the field
/// is not a number at all.
const NUMERIC_DEFAULTS: [(&str, f64); 14] = [
    ("temperature", 0.7),
    ("top_k", 40.0),
    ("top_p", 0.9),
    ("min_p", 0.05),
    ("typical_p", 1.0),
    ("repeat_penalty", 1.1),
    ("repeat_last_n", 64.0),
    ("presence_penalty", 0.0),
    ("frequency_penalty", 0.0),
    ("mirostat", 0.0),
    ("mirostat_tau", 5.0),
    ("mirostat_eta", 0.1),
    ("seed", 42.0),
    ("n_predict", 100.0),
];

/// Patch the field values known to make llama-server answer 400.
///
/// Idempotent: every replacement value already passes the checks.
pub fn repair(payload: &RequestPayload) -> RequestPayload {
    let mut fixed = payload.clone();
    let map = fixed.as_map_mut();

    if let Some(breakers) = map.get_mut("dry_sequence_breakers") {
        if !breakers.is_array() {
            warn!("[PAYLOAD] Fixed malformed dry_sequence_breakers");
            *breakers = Value::from(default_sequence_breakers());
        }
    }

    let drop_samplers = match map.get_mut("samplers") {
        Some(Value::Array(samplers)) => {
            let before = samplers.len();
            samplers.retain(|s| s.as_str().is_some_and(|name| VALID_SAMPLERS.contains(&name)));
            if samplers.len() != before {
                warn!("[PAYLOAD] Fixed invalid samplers, kept: {samplers:?}");
            }
            false
        }
        Some(Value::Null) | None => false,
        Some(other) => {
            warn!("[PAYLOAD] Dropping non-list samplers: {other}");
            true
        }
    };
    if drop_samplers {
        map.remove("samplers");
    }

    for (field, default) in NUMERIC_DEFAULTS {
        if let Some(value) = map.get_mut(field) {
            if let Some(replacement) = repair_number(field, value, default) {
                *value = replacement;
            }
        }
    }

    if let Some(prompt) = map.get_mut("prompt") {
        let empty = match prompt {
            Value::Array(tokens) => tokens.is_empty(),
            Value::String(text) => text.trim().is_empty(),
            _ => false,
        };
        if empty {
            warn!("[PAYLOAD] Fixed empty prompt, using placeholder");
            *prompt = Value::from(PLACEHOLDER_PROMPT);
        }
    }

    map.retain(|_, v| !v.is_null());
    fixed
}

/// Replacement for one numeric field, or `None` when it is fine as is.
fn repair_number(field: &str, value: &Value, default: f64) -> Option<Value> {
    let Some(number) = value.as_f64() else {
        warn!("[PAYLOAD] Reset {field} to default value: {default}");
        return Some(number_value(default));
    };

    if field == "seed" {
        if !(0.0..=MAX_SEED as f64).contains(&number) {
            warn!("[PAYLOAD] Fixed invalid seed value");
            return Some(Value::from(rehash_seed(value)));
        }
    } else if NON_NEGATIVE_FIELDS.contains(&field) {
        if number < 0.0 {
            warn!("[PAYLOAD] Fixed negative {field} value");
            return Some(Value::from(0));
        }
    } else if POSITIVE_FIELDS.contains(&field) && number <= 0.0 {
        warn!("[PAYLOAD] Fixed zero/negative {field} value");
        return Some(Value::from(POSITIVE_FLOOR));
    }
    None
}

fn rehash_seed(value: &Value) -> i64 {
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    (hasher.finish() % MAX_SEED as u64) as i64
}

/// Whole defaults stay integers on the wire.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn payload(value: Value) -> RequestPayload {
        match value {
            Value::Object(map) => RequestPayload::from(map),
            _ => RequestPayload::from(Map::new()),
        }
    }

    #[test]
    fn test_repairs_known_bad_values() {
        let fixed = repair(&payload(json!({
            "prompt": "   ",
            "dry_sequence_breakers": "a,b",
            "samplers": ["top_k", "mirostat", "temperature", 3],
            "top_k": -5,
            "n_predict": -1,
            "temperature": 0,
            "min_p": -0.2,
            "repeat_penalty": "high",
            "mirostat": null,
            "grammar": null,
            "seed": -1
        })));

        assert_eq!(fixed.get("prompt"), Some(&json!("Hello")));
        assert_eq!(fixed.get("dry_sequence_breakers").unwrap().as_array().unwrap().len(), 7);
        assert_eq!(fixed.get("samplers"), Some(&json!(["top_k", "temperature"])));
        assert_eq!(fixed.get("top_k"), Some(&json!(0)));
        assert_eq!(fixed.get("n_predict"), Some(&json!(0)));
        assert_eq!(fixed.get("temperature"), Some(&json!(0.1)));
        assert_eq!(fixed.get("min_p"), Some(&json!(0.1)));
        assert_eq!(fixed.get("repeat_penalty"), Some(&json!(1.1)));
        assert_eq!(fixed.get("mirostat"), Some(&json!(0)));
        assert!(!fixed.contains_key("grammar"));

        let seed = fixed.get("seed").and_then(Value::as_i64).unwrap();
        assert!((0..MAX_SEED).contains(&seed));
    }

    #[test]
    fn test_valid_payload_untouched() {
        let original = payload(json!({
            "prompt": [1, 2, 3],
            "dry_sequence_breakers": ["\n"],
            "samplers": ["penalties", "top_n_sigma", "typ_p"],
            "temperature": 0.8,
            "top_k": 40,
            "seed": 1234,
            "n_predict": 16
        }));
        assert_eq!(repair(&original), original);
    }

    #[test]
    fn test_empty_token_prompt_replaced() {
        let fixed = repair(&payload(json!({"prompt": []})));
        assert_eq!(fixed.get("prompt"), Some(&json!(PLACEHOLDER_PROMPT)));
    }

    #[test]
    fn test_non_list_samplers_removed() {
        let fixed = repair(&payload(json!({"samplers": "top_k"})));
        assert!(!fixed.contains_key("samplers"));
    }

    #[test]
    fn test_seed_rehash_is_stable() {
        let p = payload(json!({"seed": 4_294_967_296_i64}));
        assert_eq!(repair(&p), repair(&p));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let inputs = [
            json!({}),
            json!({"prompt": "", "seed": -7, "top_p": -1, "typical_p": true}),
            json!({"samplers": ["nope"], "dry_sequence_breakers": 5, "repeat_last_n": -64}),
            json!({"temperature": "hot", "seed": "x", "n_predict": null, "stop": null}),
            json!({"prompt": [], "seed": 9_999_999_999_i64, "top_k": 1.5}),
        ];
        for input in inputs {
            let once = repair(&payload(input));
            assert_eq!(repair(&once), once);
        }
    }
}
