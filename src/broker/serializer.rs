//! Serializer codecs used by the deserializer behavior.
//!
//! The codec is an external collaborator: the crate only ships a JSON codec
//! and a raw passthrough, brokers plug in whatever their wire format needs.

use bytes::Bytes;
use serde::Deserialize;

use super::MessageHeaders;

/// Errors raised while decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("Failed to decode {codec} payload: {message}")]
    Decode {
        codec: &'static str,
        message: String,
    },
}

/// Decodes message bodies into structured values.
pub trait MessageSerializer: Send + Sync {
    /// Codec name for logging.
    fn name(&self) -> &'static str;

    /// Decode a body. `None` bodies (tombstones) decode to `None`.
    fn deserialize(
        &self,
        body: Option<&Bytes>,
        headers: &MessageHeaders,
    ) -> Result<Option<serde_json::Value>, SerializerError>;
}

/// JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn deserialize(
        &self,
        body: Option<&Bytes>,
        _headers: &MessageHeaders,
    ) -> Result<Option<serde_json::Value>, SerializerError> {
        match body {
            None => Ok(None),
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| SerializerError::Decode {
                    codec: self.name(),
                    message: e.to_string(),
                }),
        }
    }
}

/// Leaves the body untouched; handlers read the raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSerializer;

impl MessageSerializer for RawSerializer {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn deserialize(
        &self,
        _body: Option<&Bytes>,
        _headers: &MessageHeaders,
    ) -> Result<Option<serde_json::Value>, SerializerError> {
        Ok(None)
    }
}

/// Serializer discriminator for configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Json,
    Raw,
}

impl SerializerKind {
    pub fn build(self) -> std::sync::Arc<dyn MessageSerializer> {
        match self {
            Self::Json => std::sync::Arc::new(JsonSerializer),
            Self::Raw => std::sync::Arc::new(RawSerializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_decodes_object() {
        let body = Bytes::from_static(br#"{"id":1}"#);
        let value = JsonSerializer
            .deserialize(Some(&body), &MessageHeaders::new())
            .unwrap();
        assert_eq!(value, Some(serde_json::json!({"id": 1})));
    }

    #[test]
    fn test_json_tombstone_is_none() {
        assert!(JsonSerializer
            .deserialize(None, &MessageHeaders::new())
            .unwrap()
            .is_none());
        assert!(JsonSerializer
            .deserialize(Some(&Bytes::new()), &MessageHeaders::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_json_invalid_payload() {
        let body = Bytes::from_static(b"not json");
        let result = JsonSerializer.deserialize(Some(&body), &MessageHeaders::new());
        assert!(matches!(result, Err(SerializerError::Decode { codec: "json", .. })));
    }

    #[test]
    fn test_raw_passthrough() {
        let body = Bytes::from_static(b"anything");
        assert!(RawSerializer
            .deserialize(Some(&body), &MessageHeaders::new())
            .unwrap()
            .is_none());
    }
}
