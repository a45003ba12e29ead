//! Content-derived identities
//!
//! Every identifier in precis is a BLAKE3-256 digest of a canonical byte
//! representation of its input:
//! - sources: normalized text
//! - summary jobs: normalized source, model, canonical params, language
//! - files: raw bytes
//! - outputs: normalized summary text
//!
//! Each kind hashes under its own derive-key context, so equal bytes of
//! different kinds never collide on the same identifier.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::str::FromStr;

const SOURCE_CONTEXT: &str = "precis 2026-10 source v1";
const SUMMARY_CONTEXT: &str = "precis 2026-10 summary job v1";
const FILE_CONTEXT: &str = "precis 2026-10 file content v1";
const OUTPUT_CONTEXT: &str = "precis 2026-10 summary output v1";

/// Largest magnitude at which every integer is exactly representable in f64
const F64_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// A 256-bit content fingerprint, rendered as 64 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_hasher(hasher: blake3::Hasher) -> Self {
        Self(hasher.finalize().to_hex().to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let valid = s.len() == 64
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(Error::Validation(format!("malformed fingerprint: {s:?}")));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize text before hashing or storing it.
///
/// Line endings become `\n` and surrounding whitespace is trimmed. Empty
/// text is rejected.
pub fn normalize_text(text: &str) -> Result<String> {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = unified.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("text must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Fingerprint of already-normalized source text
pub fn source_fingerprint(normalized: &str) -> Fingerprint {
    let mut hasher = blake3::Hasher::new_derive_key(SOURCE_CONTEXT);
    hasher.update(normalized.as_bytes());
    Fingerprint::from_hasher(hasher)
}

/// Fingerprint of a summary job.
///
/// `canonical_params` must come from [`canonical_params`]. Each field is
/// length-prefixed so that moving bytes between fields changes the digest.
pub fn summary_fingerprint(
    normalized_source: &str,
    model: &str,
    canonical_params: &str,
    language: &str,
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new_derive_key(SUMMARY_CONTEXT);
    for field in [normalized_source, model, canonical_params, language] {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    Fingerprint::from_hasher(hasher)
}

/// Fingerprint of uploaded file bytes
pub fn file_fingerprint(bytes: &[u8]) -> Fingerprint {
    let mut hasher = blake3::Hasher::new_derive_key(FILE_CONTEXT);
    hasher.update(bytes);
    Fingerprint::from_hasher(hasher)
}

/// Fingerprint of a completed summary's text
pub fn output_fingerprint(normalized_output: &str) -> Fingerprint {
    let mut hasher = blake3::Hasher::new_derive_key(OUTPUT_CONTEXT);
    hasher.update(normalized_output.as_bytes());
    Fingerprint::from_hasher(hasher)
}

/// Canonical serialization of generation parameters.
///
/// The value must be a JSON object. Keys are sorted, `null` members are
/// dropped, and numbers use one fixed format, so semantically identical
/// parameter sets serialize to identical bytes.
pub fn canonical_params(params: &Value) -> Result<String> {
    match params {
        Value::Object(_) => {
            let mut out = String::new();
            write_canonical(params, &mut out)?;
            Ok(out)
        }
        Value::Null => Ok("{}".to_string()),
        other => Err(Error::Validation(format!(
            "params must be a JSON object, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)?),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, out)?,
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut String) -> Result<()> {
    let mut entries: Vec<(&String, &Value)> = map.iter().filter(|(_, v)| !v.is_null()).collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key)?);
        out.push(':');
        write_canonical(value, out)?;
    }
    out.push('}');
    Ok(())
}

/// One textual form per numeric value: integral values print without a
/// fraction, everything else uses the shortest round-trip decimal.
pub fn canonical_number(n: &Number) -> Result<String> {
    if let Some(i) = n.as_i64() {
        return Ok(i.to_string());
    }
    if let Some(u) = n.as_u64() {
        return Ok(u.to_string());
    }
    let f = n
        .as_f64()
        .ok_or_else(|| Error::Validation(format!("unrepresentable number: {n}")))?;
    if !f.is_finite() {
        return Err(Error::Validation(format!("non-finite number: {n}")));
    }
    if f == 0.0 {
        return Ok("0".to_string());
    }
    if f.fract() == 0.0 && f.abs() < F64_EXACT_INT {
        return Ok((f as i64).to_string());
    }
    Ok(format!("{f}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  a\r\nb\rc \n").unwrap(), "a\nb\nc");
        assert!(matches!(normalize_text(" \n\t "), Err(Error::Validation(_))));
    }

    #[test]
    fn test_fingerprint_shape() {
        let id = source_fingerprint("The quick brown fox.");
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id, source_fingerprint("The quick brown fox."));
        assert_ne!(id, source_fingerprint("The quick brown fox"));

        let parsed: Fingerprint = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-hash".parse::<Fingerprint>().is_err());
        assert!(id.as_str().to_uppercase().parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_kinds_are_domain_separated() {
        let text = "same bytes";
        assert_ne!(source_fingerprint(text), output_fingerprint(text));
        assert_ne!(source_fingerprint(text), file_fingerprint(text.as_bytes()));
    }

    #[test]
    fn test_canonical_params_key_order() {
        let a: Value =
            serde_json::from_str(r#"{"relative_max_length": 0.4, "num_beams": 4, "do_sample": false}"#)
                .unwrap();
        let b: Value =
            serde_json::from_str(r#"{"do_sample": false, "num_beams": 4, "relative_max_length": 0.4}"#)
                .unwrap();
        assert_eq!(canonical_params(&a).unwrap(), canonical_params(&b).unwrap());
        assert_eq!(
            canonical_params(&a).unwrap(),
            r#"{"do_sample":false,"num_beams":4,"relative_max_length":0.4}"#
        );
    }

    #[test]
    fn test_canonical_params_numbers_and_nulls() {
        let a = json!({"num_beams": 4.0, "top_p": null, "nested": {"b": 1e0, "a": -0.0}});
        let b = json!({"nested": {"a": 0, "b": 1}, "num_beams": 4});
        assert_eq!(canonical_params(&a).unwrap(), canonical_params(&b).unwrap());

        assert_eq!(canonical_params(&json!({"x": 0.1})).unwrap(), r#"{"x":0.1}"#);
        assert_eq!(canonical_params(&json!({"x": 2.5e-7})).unwrap(), r#"{"x":0.00000025}"#);
        assert_eq!(canonical_params(&Value::Null).unwrap(), "{}");
        assert_eq!(canonical_params(&json!({})).unwrap(), "{}");
    }

    #[test]
    fn test_canonical_params_rejects_non_objects() {
        assert!(matches!(canonical_params(&json!([1, 2])), Err(Error::Validation(_))));
        assert!(matches!(canonical_params(&json!("x")), Err(Error::Validation(_))));
    }

    #[test]
    fn test_summary_fingerprint_fields() {
        let params = canonical_params(&json!({"relative_max_length": 0.4})).unwrap();
        let base = summary_fingerprint("The quick brown fox.", "M1", &params, "en");

        assert_eq!(base, summary_fingerprint("The quick brown fox.", "M1", &params, "en"));
        assert_ne!(base, summary_fingerprint("The quick brown fox!", "M1", &params, "en"));
        assert_ne!(base, summary_fingerprint("The quick brown fox.", "M2", &params, "en"));
        assert_ne!(base, summary_fingerprint("The quick brown fox.", "M1", "{}", "en"));
        assert_ne!(base, summary_fingerprint("The quick brown fox.", "M1", &params, "es"));

        // Moving bytes across a field boundary must not collide
        assert_ne!(
            summary_fingerprint("ab", "c", "{}", "en"),
            summary_fingerprint("a", "bc", "{}", "en")
        );
    }
}
