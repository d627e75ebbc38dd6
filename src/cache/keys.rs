//! Cache Key Derivation
//!
//! Deterministic keys for callers that cache by request content rather than
//! by a natural identifier. JSON objects are serialized with sorted keys
//! (the `serde_json` default map), so logically equal inputs hash equally.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Hex characters of the parameter digest kept in [`param_key`]
const PARAM_DIGEST_LEN: usize = 8;

/// Key for an LLM request.
///
/// The prompt is trimmed and lower-cased first, so whitespace and case
/// differences share one entry.
pub fn llm_request_key(prompt: &str, agent_id: &str, context: Option<&str>) -> String {
    let canonical = json!({
        "prompt": prompt.trim().to_lowercase(),
        "agent_id": agent_id,
        "context": context,
    });
    sha256_hex(canonical.to_string().as_bytes())
}

/// Key for an identifier plus optional parameters: `identifier` alone, or
/// `identifier:<8 hex chars>` when parameters are given.
pub fn param_key(identifier: &str, params: Option<&Value>) -> String {
    match params {
        Some(params) => {
            let digest = sha256_hex(params.to_string().as_bytes());
            format!("{}:{}", identifier, &digest[..PARAM_DIGEST_LEN])
        }
        None => identifier.to_string(),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_key_normalizes_prompt() {
        let a = llm_request_key("  Design a REST API  ", "architect", None);
        let b = llm_request_key("design a rest api", "architect", None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_llm_key_distinguishes_agent_and_context() {
        let base = llm_request_key("prompt", "architect", None);
        assert_ne!(base, llm_request_key("prompt", "security", None));
        assert_ne!(base, llm_request_key("prompt", "architect", Some("repo: api")));
        assert_ne!(
            llm_request_key("prompt", "architect", Some("a")),
            llm_request_key("prompt", "architect", Some("b"))
        );
    }

    #[test]
    fn test_param_key() {
        assert_eq!(param_key("project-42", None), "project-42");

        let key = param_key("project-42", Some(&json!({"page": 2, "sort": "name"})));
        assert!(key.starts_with("project-42:"));
        assert_eq!(key.len(), "project-42:".len() + 8);
    }

    #[test]
    fn test_param_key_ignores_field_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": [1, 2], "b": 1}"#).unwrap();
        assert_eq!(param_key("x", Some(&a)), param_key("x", Some(&b)));

        let c: Value = serde_json::from_str(r#"{"a": [2, 1], "b": 1}"#).unwrap();
        assert_ne!(param_key("x", Some(&a)), param_key("x", Some(&c)));
    }
}
