//! Value translation between stored bytes and column text.
//!
//! Stored values are arbitrary bytes. Non-JSON columns treat them as the
//! host's string representation and rely on the host's string-to-type
//! coercion. JSON-flagged columns store a single JSON value and translate it
//! on the way in and out.

use serde_json::Value as JsonValue;

/// A stored value decoded for column output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    /// SQL NULL (a stored JSON `null`).
    Null,
    /// Text handed to the host's string-to-type coercion.
    Text(String),
}

/// Decodes stored value bytes for a column.
///
/// For JSON columns: JSON null becomes SQL NULL, a JSON string is unquoted,
/// numbers and booleans are stringified, arrays and objects are re-serialized
/// JSON text. Bytes that fail to parse as JSON fall back to the raw form.
pub fn decode_value(bytes: &[u8], json: bool) -> DecodedValue {
    if !json {
        return DecodedValue::Text(String::from_utf8_lossy(bytes).into_owned());
    }
    match serde_json::from_slice::<JsonValue>(bytes) {
        Ok(JsonValue::Null) => DecodedValue::Null,
        Ok(JsonValue::String(text)) => DecodedValue::Text(text),
        Ok(JsonValue::Bool(flag)) => DecodedValue::Text(flag.to_string()),
        Ok(JsonValue::Number(number)) => DecodedValue::Text(number.to_string()),
        Ok(value @ (JsonValue::Array(_) | JsonValue::Object(_))) => {
            DecodedValue::Text(value.to_string())
        }
        Err(_) => DecodedValue::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Encodes a column value for storage in a JSON-flagged column.
///
/// String columns get JSON quoting/escaping; numeric and boolean values use
/// their canonical text form, which is already valid JSON.
pub fn encode_json_value(text: &str, is_string_column: bool) -> String {
    if is_string_column {
        // serde_json string serialization cannot fail.
        serde_json::to_string(text).unwrap_or_else(|_| text.to_string())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_pass_through() {
        assert_eq!(
            decode_value(b"hello", false),
            DecodedValue::Text("hello".into())
        );
        assert_eq!(decode_value(b"", false), DecodedValue::Text(String::new()));
    }

    #[test]
    fn json_values_translate() {
        assert_eq!(decode_value(b"null", true), DecodedValue::Null);
        assert_eq!(
            decode_value(br#""quoted""#, true),
            DecodedValue::Text("quoted".into())
        );
        assert_eq!(decode_value(b"42", true), DecodedValue::Text("42".into()));
        assert_eq!(
            decode_value(b"true", true),
            DecodedValue::Text("true".into())
        );
        assert_eq!(
            decode_value(br#"[1,2]"#, true),
            DecodedValue::Text("[1,2]".into())
        );
        // Invalid JSON falls back to the raw bytes.
        assert_eq!(
            decode_value(b"not json", true),
            DecodedValue::Text("not json".into())
        );
    }

    #[test]
    fn json_encoding_quotes_strings_only() {
        assert_eq!(encode_json_value("a\"b", true), r#""a\"b""#);
        assert_eq!(encode_json_value("17", false), "17");
        assert_eq!(encode_json_value("true", false), "true");
    }
}
