//! Extraction of the correlation key and value from response records.

use serde_json::Value;

use super::ResponseError;
use crate::broker::BrokerRecord;

/// Turns a response record into its correlation key and value.
pub trait ResponseDecoder: Send + Sync + 'static {
    type Value: Send + 'static;

    /// # Errors
    ///
    /// Returns `ResponseError::Decode` when the record carries no usable key
    /// or value.
    fn decode(&self, record: &BrokerRecord) -> Result<(String, Self::Value), ResponseError>;
}

/// Decodes JSON responses.
///
/// The key comes from the record key: `key_field` of a JSON object key, a
/// JSON scalar, or the raw key text. Records without a key fall back to
/// `key_field` inside the payload.
#[derive(Debug, Clone)]
pub struct JsonResponseDecoder {
    key_field: String,
}

impl JsonResponseDecoder {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
        }
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    fn key_from_record_key(&self, raw: &[u8]) -> Option<String> {
        match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(map)) => map.get(&self.key_field).map(scalar_text),
            Ok(Value::Null) => None,
            Ok(other) => Some(scalar_text(&other)),
            Err(_) => Some(String::from_utf8_lossy(raw).into_owned()),
        }
    }
}

impl Default for JsonResponseDecoder {
    fn default() -> Self {
        Self::new("request_index")
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ResponseDecoder for JsonResponseDecoder {
    type Value = Value;

    fn decode(&self, record: &BrokerRecord) -> Result<(String, Value), ResponseError> {
        let payload = record
            .payload
            .as_deref()
            .ok_or_else(|| ResponseError::Decode("response has no payload".to_string()))?;
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ResponseError::Decode(format!("invalid JSON response: {}", e)))?;

        let key = record
            .key
            .as_deref()
            .and_then(|raw| self.key_from_record_key(raw))
            .or_else(|| value.get(&self.key_field).map(scalar_text))
            .ok_or_else(|| {
                ResponseError::Decode(format!("response has no '{}' key", self.key_field))
            })?;
        Ok((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(key: Option<&[u8]>, payload: Value) -> BrokerRecord {
        let record = BrokerRecord::new("responses", 0, 0).with_payload(payload.to_string());
        match key {
            Some(key) => record.with_key(key.to_vec()),
            None => record,
        }
    }

    #[test]
    fn test_key_from_object_key() {
        let decoder = JsonResponseDecoder::default();
        let (key, value) = decoder
            .decode(&record(
                Some(br#"{"request_index": "REQ-1"}"#),
                json!({"status": "ok"}),
            ))
            .unwrap();
        assert_eq!(key, "REQ-1");
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn test_key_from_plain_key() {
        let decoder = JsonResponseDecoder::default();
        let (key, _) = decoder.decode(&record(Some(b"REQ-2"), json!({}))).unwrap();
        assert_eq!(key, "REQ-2");
    }

    #[test]
    fn test_key_from_payload_when_record_key_missing() {
        let decoder = JsonResponseDecoder::new("id");
        let (key, _) = decoder.decode(&record(None, json!({"id": 17}))).unwrap();
        assert_eq!(key, "17");
    }

    #[test]
    fn test_missing_key_and_payload_are_errors() {
        let decoder = JsonResponseDecoder::default();
        assert!(decoder.decode(&record(None, json!({"status": "ok"}))).is_err());
        assert!(decoder
            .decode(&BrokerRecord::new("responses", 0, 0).with_key(b"k".to_vec()))
            .is_err());
    }
}
