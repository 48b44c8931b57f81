use crate::error::{PlexDbError, Result};

/// Longest single path segment produced by `encode`
pub const SEGMENT_LEN: usize = 128;

/// Marks a segment that continues in a nested directory. Never a hex digit,
/// so a short value's file cannot collide with a long value's directory.
const CONTINUATION: char = '~';

/// Canonical serialized form of an index value: JSON with object keys
/// sorted. Mappings with non-string keys, tagged values and non-finite
/// numbers have no canonical form.
pub fn canonical_form(field: &str, value: &serde_yaml::Value) -> Result<String> {
    check_canonical(field, value)?;
    let json = serde_json::to_value(value).map_err(|e| PlexDbError::NonCanonicalValue {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    Ok(serde_json::to_string(&json)?)
}

fn check_canonical(field: &str, value: &serde_yaml::Value) -> Result<()> {
    let reject = |reason: &str| PlexDbError::NonCanonicalValue {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    match value {
        serde_yaml::Value::Number(n) if n.as_f64().map(|f| !f.is_finite()).unwrap_or(false) => {
            Err(reject("non-finite number"))
        }
        serde_yaml::Value::Sequence(items) => {
            items.iter().try_for_each(|item| check_canonical(field, item))
        }
        serde_yaml::Value::Mapping(map) => map.iter().try_for_each(|(k, v)| {
            if k.is_string() {
                check_canonical(field, v)
            } else {
                Err(reject("mapping keys must be strings"))
            }
        }),
        serde_yaml::Value::Tagged(_) => Err(reject("tagged values are not indexable")),
        _ => Ok(()),
    }
}

/// Pathsafe encoding of a value: lower-case hex of the canonical form, split
/// into `SEGMENT_LEN` chunks joined by `~/` when it gets long.
pub fn encode(field: &str, value: &serde_yaml::Value) -> Result<String> {
    let hex = hex::encode(canonical_form(field, value)?.as_bytes());
    let chunks: Vec<&str> = hex
        .as_bytes()
        .chunks(SEGMENT_LEN)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();
    Ok(chunks.join(&format!("{CONTINUATION}/")))
}

/// Reverse of `encode`
pub fn decode(encoded: &str) -> Result<serde_yaml::Value> {
    let hex: String = encoded
        .split('/')
        .map(|segment| segment.trim_end_matches(CONTINUATION))
        .collect();
    let bytes = hex::decode(hex)?;
    let json: serde_json::Value = serde_json::from_slice(&bytes)?;
    Ok(serde_yaml::to_value(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_yaml::Value;

    #[test]
    fn test_encode_is_hex_of_canonical_json() {
        assert_eq!(encode("f", &Value::from("alice")).unwrap(), hex::encode("\"alice\""));
        assert_eq!(encode("f", &Value::from(42)).unwrap(), hex::encode("42"));
        assert_eq!(encode("f", &Value::from(true)).unwrap(), hex::encode("true"));
    }

    #[test]
    fn test_distinct_types_do_not_collide() {
        let as_string = encode("f", &Value::from("42")).unwrap();
        let as_number = encode("f", &Value::from(42)).unwrap();
        assert_ne!(as_string, as_number);
    }

    #[test]
    fn test_mapping_key_order_is_canonical() {
        let a: Value = serde_yaml::from_str("{b: 1, a: 2}").unwrap();
        let b: Value = serde_yaml::from_str("{a: 2, b: 1}").unwrap();
        assert_eq!(encode("f", &a).unwrap(), encode("f", &b).unwrap());
        assert_eq!(canonical_form("f", &a).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_non_string_keys_rejected() {
        let value: Value = serde_yaml::from_str("{1: one}").unwrap();
        assert!(matches!(
            encode("f", &value),
            Err(PlexDbError::NonCanonicalValue { .. })
        ));
    }

    #[test]
    fn test_non_finite_rejected() {
        let value: Value = serde_yaml::from_str(".nan").unwrap();
        assert!(encode("f", &value).is_err());
        let value: Value = serde_yaml::from_str("[.inf]").unwrap();
        assert!(encode("f", &value).is_err());
    }

    #[test]
    fn test_decode_reverses_encode() {
        for yaml in ["alice", "42", "-1.5", "true", "null", "[1, two]", "{k: v, n: [1]}"] {
            let value: Value = serde_yaml::from_str(yaml).unwrap();
            let encoded = encode("f", &value).unwrap();
            assert_eq!(decode(&encoded).unwrap(), value, "{yaml}");
        }
    }

    #[test]
    fn test_long_values_are_split() {
        let long = Value::from("x".repeat(300));
        let encoded = encode("f", &long).unwrap();
        let segments: Vec<&str> = encoded.split('/').collect();

        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.len() <= SEGMENT_LEN + 1));
        assert!(segments[..segments.len() - 1].iter().all(|s| s.ends_with('~')));
        assert!(!segments.last().unwrap().ends_with('~'));
        assert_eq!(decode(&encoded).unwrap(), long);
    }
}
