use crate::errors::ApiError;
use serde_json::{Map, Value};

pub const MAX_FIELD_BYTES: usize = 8 * 1024;
pub const MAX_JSON_DEPTH: usize = 16;

// Conservative denylist: statement verbs with a following object, comment
// markers, stacked queries, and the classic tautology. Multi-token sequences
// keep ordinary prose ("select a device type") from tripping it.
const SQL_DENYLIST: &[&str] = &[
    "DROP TABLE",
    "DROP DATABASE",
    "TRUNCATE TABLE",
    "DELETE FROM",
    "INSERT INTO",
    "UNION SELECT",
    "UNION ALL SELECT",
    "OR 1=1",
    "OR '1'='1",
    "'; --",
    "/*",
    "*/",
    "XP_CMDSHELL",
];

/// The injection scan plus HTML encoding, shared by the free-text and
/// payload paths. Size limits are enforced by the callers.
fn scrub_text(field: &str, value: &str) -> Result<String, ApiError> {
    let upper = value.to_uppercase();
    for pattern in SQL_DENYLIST {
        if upper.contains(pattern) {
            return Err(ApiError::Validation(format!(
                "field '{field}' contains a disallowed sequence"
            )));
        }
    }
    Ok(html_encode(value))
}

/// Sanitizes a free-text field: enforces the size cap, scans for injection
/// markers, HTML-encodes angle brackets and ampersands.
pub fn sanitize_text(field: &str, value: &str) -> Result<String, ApiError> {
    if value.len() > MAX_FIELD_BYTES {
        return Err(ApiError::Validation(format!(
            "field '{field}' exceeds {MAX_FIELD_BYTES} bytes"
        )));
    }
    scrub_text(field, value)
}

pub fn sanitize_optional(field: &str, value: &mut Option<String>) -> Result<(), ApiError> {
    if let Some(v) = value {
        *value = Some(sanitize_text(field, v)?);
    }
    Ok(())
}

/// Scrubs every string leaf of an inbound JSON object in place: the denylist
/// scan plus HTML encoding, recursively. Run [`check_map_shape`] first so
/// string sizes are already bounded.
pub fn sanitize_map(map: &mut Map<String, Value>) -> Result<(), ApiError> {
    for (key, value) in map.iter_mut() {
        sanitize_value(key, value)?;
    }
    Ok(())
}

fn sanitize_value(field: &str, value: &mut Value) -> Result<(), ApiError> {
    match value {
        Value::String(s) => *s = scrub_text(field, s)?,
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                sanitize_value(key, v)?;
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                sanitize_value(field, v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn html_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

/// Structural limits for an inbound JSON object: nesting depth, field-name
/// size, and per-string size.
pub fn check_map_shape(map: &Map<String, Value>) -> Result<(), ApiError> {
    for (key, value) in map {
        if key.len() > MAX_FIELD_BYTES {
            return Err(ApiError::Validation("field name too long".to_string()));
        }
        check_depth(value, 2)?;
    }
    Ok(())
}

fn check_depth(value: &Value, depth: usize) -> Result<(), ApiError> {
    if depth > MAX_JSON_DEPTH {
        return Err(ApiError::Validation(format!(
            "JSON nesting exceeds {MAX_JSON_DEPTH} levels"
        )));
    }
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if key.len() > MAX_FIELD_BYTES {
                    return Err(ApiError::Validation("field name too long".to_string()));
                }
                check_depth(v, depth + 1)?;
            }
        }
        Value::Array(items) => {
            for v in items {
                check_depth(v, depth + 1)?;
            }
        }
        Value::String(s) => {
            if s.len() > MAX_FIELD_BYTES {
                return Err(ApiError::Validation(format!(
                    "string field exceeds {MAX_FIELD_BYTES} bytes"
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_html_encoding() {
        assert_eq!(
            sanitize_text("description", "a <b> & c").unwrap(),
            "a &lt;b&gt; &amp; c"
        );
    }

    #[test]
    fn test_plain_text_passes() {
        assert_eq!(
            sanitize_text("name", "sensor-alpha").unwrap(),
            "sensor-alpha"
        );
        // Single SQL keywords in prose are fine.
        assert!(sanitize_text("description", "select the right device type").is_ok());
    }

    #[test]
    fn test_denylist_hits() {
        for bad in [
            "x'; DROP TABLE devices; --",
            "a UNION SELECT api_key FROM devices",
            "name OR 1=1",
            "/* comment */",
        ] {
            assert!(sanitize_text("name", bad).is_err(), "should reject: {bad}");
        }
    }

    #[test]
    fn test_field_size_cap() {
        let long = "x".repeat(MAX_FIELD_BYTES + 1);
        assert!(sanitize_text("description", &long).is_err());
    }

    #[test]
    fn test_sanitize_map_encodes_every_string_leaf() {
        let mut payload = map(json!({
            "note": "a <b>",
            "nested": { "tag": "x & y" },
            "list": ["<i>", 3],
            "temperature": 22.5,
        }));
        sanitize_map(&mut payload).unwrap();
        assert_eq!(payload["note"], "a &lt;b&gt;");
        assert_eq!(payload["nested"]["tag"], "x &amp; y");
        assert_eq!(payload["list"][0], "&lt;i&gt;");
        assert_eq!(payload["temperature"], 22.5);
    }

    #[test]
    fn test_sanitize_map_rejects_injection_in_nested_values() {
        let mut payload = map(json!({
            "status": { "cmd": "1 UNION SELECT api_key FROM devices" },
        }));
        assert!(sanitize_map(&mut payload).is_err());

        let mut payload = map(json!({ "note": ["ok", "x'; DROP TABLE devices; --"] }));
        assert!(sanitize_map(&mut payload).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!(1);
        for _ in 0..20 {
            value = json!({ "n": value });
        }
        assert!(check_map_shape(&map(json!({ "data": value }))).is_err());

        let shallow = map(json!({"temperature": 22.5, "gps": {"lat": 48.85}}));
        assert!(check_map_shape(&shallow).is_ok());
    }

    #[test]
    fn test_string_leaf_cap() {
        let value = map(json!({"note": "y".repeat(MAX_FIELD_BYTES + 1)}));
        assert!(check_map_shape(&value).is_err());

        let nested = map(json!({"meta": {"blob": "y".repeat(MAX_FIELD_BYTES + 1)}}));
        assert!(check_map_shape(&nested).is_err());
    }
}
