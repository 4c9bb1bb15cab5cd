use std::collections::HashMap;

use sha2::{Digest, Sha256};

const HASH_HEX_CHARS: usize = 16;
const LOOPBACK: &str = "127.0.0.1";

/// One-way, truncated SHA-256 of `text` (16 hex chars).
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_HEX_CHARS].to_string()
}

/// Rate-limit key for a caller identity (an address or uid) and an action.
/// The raw identity never leaves this function.
pub fn rate_limit_key(identity: &str, action: &str) -> String {
    hash_text(&format!("{identity}{action}"))
}

/// Rate-limit key for an already-hashed anonymous id.
pub fn anon_rate_limit_key(anon_id_hash: &str, action: &str) -> String {
    format!("anon_{anon_id_hash}_{action}")
}

/// Resolves the client address from proxy headers (lower-case names):
/// first `x-forwarded-for` entry, then `x-real-ip`, else loopback.
pub fn client_ip(headers: &HashMap<String, String>) -> String {
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return first.to_string();
    }
    headers
        .get("x-real-ip")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(LOOPBACK)
        .to_string()
}

/// Accepts only version-4 UUID strings (case-insensitive).
pub fn is_valid_anon_id(anon_id: &str) -> bool {
    match uuid::Uuid::parse_str(anon_id) {
        Ok(parsed) => {
            anon_id.len() == 36
                && parsed.get_version_num() == 4
                && matches!(parsed.get_variant(), uuid::Variant::RFC4122)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_short_and_stable() {
        let first = hash_text("203.0.113.9");
        assert_eq!(first.len(), 16);
        assert_eq!(first, hash_text("203.0.113.9"));
        assert_ne!(rate_limit_key("203.0.113.9", "comment"), first);
        assert!(!rate_limit_key("203.0.113.9", "comment").contains("203"));
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HashMap::new();
        headers.insert("x-real-ip".to_string(), "10.0.0.2".to_string());
        assert_eq!(client_ip(&headers), "10.0.0.2");
        headers.insert(
            "x-forwarded-for".to_string(),
            " 198.51.100.7, 10.0.0.1".to_string(),
        );
        assert_eq!(client_ip(&headers), "198.51.100.7");
        assert_eq!(client_ip(&HashMap::new()), "127.0.0.1");
    }

    #[test]
    fn anon_id_must_be_uuid_v4() {
        assert!(is_valid_anon_id("3f2504e0-4f89-41d3-9a0c-0305e82c3301"));
        assert!(is_valid_anon_id("3F2504E0-4F89-41D3-9A0C-0305E82C3301"));
        assert!(!is_valid_anon_id("3f2504e0-4f89-11d3-9a0c-0305e82c3301"));
        assert!(!is_valid_anon_id("3f2504e04f8941d39a0c0305e82c3301"));
        assert!(!is_valid_anon_id("not-a-uuid"));
        assert!(!is_valid_anon_id(""));
    }
}
