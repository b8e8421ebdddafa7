//! Cache-key derivation from method identity and argument content
//!
//! A cache key is `{method_id}:{fingerprint}` with an optional `_v{n}` suffix
//! taken from the resolved policy version. Three fingerprint algorithms are
//! supported:
//!
//! - **fast-hash**: arguments are serialized to canonical JSON (object keys
//!   sorted) and hashed with 128-bit xxh3; collision probability is
//!   negligible and the key length is constant.
//! - **readable**: each argument is rendered through a canonical stringifier
//!   and joined with `:`. Hosts pass timestamps as ISO-8601 UTC strings and
//!   enum values as `Type.Name` strings. Keys that would exceed
//!   [`MAX_READABLE_KEY_LEN`] fall back to the fast-hash fingerprint.
//! - **raw argument**: one argument position is designated as the key and
//!   its string value is used unchanged.
//!
//! Key generation is a total function: it never fails and never panics for
//! any JSON argument value. Composite values the readable stringifier cannot
//! render flatly are represented as `{type}#{hash}` of their canonical form.

use serde_json::Value;
use xxhash_rust::xxh3::{xxh3_64, xxh3_128};

use crate::policy::CachePolicy;

/// Maximum length of a readable key before it falls back to hashing
pub const MAX_READABLE_KEY_LEN: usize = 512;

/// Fingerprint algorithm selector, resolved per method by the policy pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneratorKind {
    /// Canonical-JSON serialization hashed with 128-bit xxh3 (default)
    FastHash,
    /// Human-readable `arg0:arg1:…` fingerprint with hash fallback
    Readable,
    /// Pass one argument's string value through as the whole key
    RawArg(usize),
}

impl KeyGeneratorKind {
    /// Parse a config-file selector (`fast-hash`, `readable`, `raw:<index>`).
    ///
    /// Unknown selectors return `None` so the policy merge can fall through
    /// to a lower-priority source.
    #[must_use]
    pub fn parse(selector: &str) -> Option<Self> {
        match selector {
            "fast-hash" | "fasthash" | "hash" => Some(Self::FastHash),
            "readable" => Some(Self::Readable),
            other => other
                .strip_prefix("raw:")
                .and_then(|idx| idx.parse().ok())
                .map(Self::RawArg),
        }
    }
}

impl Default for KeyGeneratorKind {
    fn default() -> Self {
        Self::FastHash
    }
}

/// Generate the cache key for a call site.
///
/// Deterministic across processes and restarts: equal `(method_id, args,
/// policy)` inputs always produce equal keys.
#[must_use]
pub fn generate(method_id: &str, args: &[Value], policy: &CachePolicy) -> String {
    let fingerprint = match policy.key_generator {
        KeyGeneratorKind::FastHash => fast_fingerprint(args),
        KeyGeneratorKind::Readable => readable_fingerprint(args),
        KeyGeneratorKind::RawArg(index) => match raw_fingerprint(args, index) {
            Some(raw) => return raw,
            // Missing or composite raw argument: degrade to hashing rather
            // than failing the call.
            None => fast_fingerprint(args),
        },
    };

    let mut key = format!("{method_id}:{fingerprint}");
    if policy.version != 0 {
        key.push_str(&format!("_v{}", policy.version));
    }
    key
}

/// 128-bit xxh3 over the canonical JSON of each argument.
///
/// A NUL byte separates arguments so `["ab"]` and `["a","b"]` cannot collide.
fn fast_fingerprint(args: &[Value]) -> String {
    let mut buf = Vec::with_capacity(64);
    for arg in args {
        // serde_json maps are sorted, so this serialization is canonical.
        buf.extend_from_slice(canonical_json(arg).as_bytes());
        buf.push(0);
    }
    format!("{:032x}", xxh3_128(&buf))
}

/// Canonical flat rendering of each argument, `:`-joined.
fn readable_fingerprint(args: &[Value]) -> String {
    let parts: Vec<String> = args.iter().map(format_argument).collect();
    let fingerprint = parts.join(":");
    if fingerprint.len() > MAX_READABLE_KEY_LEN {
        fast_fingerprint(args)
    } else {
        fingerprint
    }
}

fn raw_fingerprint(args: &[Value], index: usize) -> Option<String> {
    match args.get(index)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Render one argument for the readable generator.
///
/// Strings escape the `:` delimiter (and the escape character itself);
/// composite values degrade to `{type}#{hash}` of their canonical form.
fn format_argument(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.replace('\\', "\\\\").replace(':', "\\:"),
        Value::Array(_) => format!("array#{:016x}", xxh3_64(canonical_json(value).as_bytes())),
        Value::Object(_) => format!("object#{:016x}", xxh3_64(canonical_json(value).as_bytes())),
    }
}

fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Stripe selector for the single-flight lock pool.
pub(crate) fn stripe_hash(key: &str) -> u64 {
    xxh3_64(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CachePolicy;
    use serde_json::json;

    fn policy_with(kind: KeyGeneratorKind, version: i64) -> CachePolicy {
        CachePolicy {
            key_generator: kind,
            version,
            ..CachePolicy::default()
        }
    }

    // ── fast-hash ─────────────────────────────────────────────────────────

    #[test]
    fn fast_hash_is_deterministic() {
        let policy = policy_with(KeyGeneratorKind::FastHash, 0);
        let args = [json!({"id": 7, "name": "A"})];
        let k1 = generate("Svc.Get", &args, &policy);
        let k2 = generate("Svc.Get", &args, &policy);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("Svc.Get:"));
    }

    #[test]
    fn fast_hash_is_insensitive_to_object_key_order() {
        let policy = policy_with(KeyGeneratorKind::FastHash, 0);
        let k1 = generate("M", &[json!({"a": 1, "b": 2})], &policy);
        let k2 = generate("M", &[json!({"b": 2, "a": 1})], &policy);
        assert_eq!(k1, k2);
    }

    #[test]
    fn fast_hash_distinguishes_argument_boundaries() {
        // GIVEN: argument lists that concatenate to the same text
        let policy = policy_with(KeyGeneratorKind::FastHash, 0);
        let k1 = generate("M", &[json!("ab")], &policy);
        let k2 = generate("M", &[json!("a"), json!("b")], &policy);
        // THEN: the NUL separator keeps them distinct
        assert_ne!(k1, k2);
    }

    #[test]
    fn fast_hash_fingerprint_is_128_bit_hex() {
        let policy = policy_with(KeyGeneratorKind::FastHash, 0);
        let key = generate("M", &[json!(1)], &policy);
        let fingerprint = key.strip_prefix("M:").unwrap();
        assert_eq!(fingerprint.len(), 32);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn version_participates_as_suffix() {
        let v0 = generate("M", &[json!(1)], &policy_with(KeyGeneratorKind::FastHash, 0));
        let v2 = generate("M", &[json!(1)], &policy_with(KeyGeneratorKind::FastHash, 2));
        assert_ne!(v0, v2);
        assert!(v2.ends_with("_v2"));
    }

    // ── readable ──────────────────────────────────────────────────────────

    #[test]
    fn readable_renders_scalars_canonically() {
        let policy = policy_with(KeyGeneratorKind::Readable, 0);
        let key = generate(
            "Orders.List",
            &[json!(42), json!(true), json!("us-east"), json!(null)],
            &policy,
        );
        assert_eq!(key, "Orders.List:42:true:us-east:null");
    }

    #[test]
    fn readable_escapes_the_delimiter() {
        let policy = policy_with(KeyGeneratorKind::Readable, 0);
        let k1 = generate("M", &[json!("a:b")], &policy);
        let k2 = generate("M", &[json!("a"), json!("b")], &policy);
        assert_ne!(k1, k2);
        assert!(k1.contains("\\:"));
    }

    #[test]
    fn readable_hashes_composite_arguments() {
        let policy = policy_with(KeyGeneratorKind::Readable, 0);
        let key = generate("M", &[json!({"nested": [1, 2]})], &policy);
        assert!(key.starts_with("M:object#"));
    }

    #[test]
    fn overlong_readable_key_falls_back_to_hash() {
        let policy = policy_with(KeyGeneratorKind::Readable, 0);
        let long = "x".repeat(2 * MAX_READABLE_KEY_LEN);
        let key = generate("M", &[json!(long)], &policy);
        assert!(key.len() < MAX_READABLE_KEY_LEN);
        // Falls back to the 32-hex-char fast fingerprint
        assert_eq!(key.strip_prefix("M:").unwrap().len(), 32);
    }

    // ── raw passthrough ───────────────────────────────────────────────────

    #[test]
    fn raw_arg_is_passed_through_unchanged() {
        let policy = policy_with(KeyGeneratorKind::RawArg(1), 0);
        let key = generate("M", &[json!("ignored"), json!("tenant-7")], &policy);
        assert_eq!(key, "tenant-7");
    }

    #[test]
    fn raw_arg_out_of_bounds_degrades_to_hash() {
        let policy = policy_with(KeyGeneratorKind::RawArg(5), 0);
        let key = generate("M", &[json!("only")], &policy);
        assert!(key.starts_with("M:"));
    }

    // ── selector parsing ──────────────────────────────────────────────────

    #[test]
    fn selector_parsing_covers_all_kinds() {
        assert_eq!(KeyGeneratorKind::parse("fast-hash"), Some(KeyGeneratorKind::FastHash));
        assert_eq!(KeyGeneratorKind::parse("readable"), Some(KeyGeneratorKind::Readable));
        assert_eq!(KeyGeneratorKind::parse("raw:0"), Some(KeyGeneratorKind::RawArg(0)));
        assert_eq!(KeyGeneratorKind::parse("bogus"), None);
    }
}
