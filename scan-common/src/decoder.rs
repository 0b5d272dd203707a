//! Decode raw scan messages into `ScanResult`s.
//!
//! Producers moved from a base64 transport encoding (V1) to plain text (V2)
//! without a coordinated cutover, so both are accepted here and nothing
//! downstream of `decode` ever sees the difference.
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use thiserror::Error;

use crate::scan::{DataVersion, ScanKey, ScanResult, KEY_SEPARATOR};

/// Enumeration of permanent decoding failures: retrying the same bytes can never succeed.
/// Once the envelope parsed, the error carries the key of the message.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed scan envelope: {0}")]
    MalformedEnvelope(String),
    #[error("malformed v{version} payload for {key}: {reason}")]
    MalformedPayload {
        key: ScanKey,
        version: DataVersion,
        reason: String,
    },
    #[error("invalid v{version} payload encoding for {key}: {reason}")]
    InvalidEncoding {
        key: ScanKey,
        version: DataVersion,
        reason: String,
    },
    #[error("unsupported data version {version} for {key}")]
    UnsupportedVersion { key: ScanKey, version: i64 },
}

impl DecodeError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::MalformedEnvelope(_) => "malformed_envelope",
            DecodeError::MalformedPayload { .. } => "malformed_payload",
            DecodeError::InvalidEncoding { .. } => "invalid_encoding",
            DecodeError::UnsupportedVersion { .. } => "unsupported_version",
        }
    }

    pub fn key(&self) -> Option<&ScanKey> {
        match self {
            DecodeError::MalformedEnvelope(_) => None,
            DecodeError::MalformedPayload { key, .. }
            | DecodeError::InvalidEncoding { key, .. }
            | DecodeError::UnsupportedVersion { key, .. } => Some(key),
        }
    }

    /// The `data_version` tag of the message, as sent.
    pub fn data_version(&self) -> Option<i64> {
        match self {
            DecodeError::MalformedEnvelope(_) => None,
            DecodeError::MalformedPayload { version, .. }
            | DecodeError::InvalidEncoding { version, .. } => Some(u8::from(*version).into()),
            DecodeError::UnsupportedVersion { version, .. } => Some(*version),
        }
    }
}

/// The version independent part of a scan message.
#[derive(Deserialize)]
struct Envelope {
    ip: String,
    port: u32,
    service: String,
    timestamp: i64,
    data_version: i64,
    data: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct V1Data {
    response_bytes_utf8: String,
}

#[derive(Deserialize)]
struct V2Data {
    response_str: String,
}

/// Decode a raw message body into a fully populated `ScanResult`.
pub fn decode(bytes: &[u8]) -> Result<ScanResult, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|error| DecodeError::MalformedEnvelope(error.to_string()))?;

    let data = match envelope.data {
        Some(serde_json::Value::Null) | None => {
            return Err(DecodeError::MalformedEnvelope(
                "data is missing or null".to_owned(),
            ))
        }
        Some(data) => data,
    };

    for (field, value) in [("ip", &envelope.ip), ("service", &envelope.service)] {
        if value.contains(KEY_SEPARATOR) {
            return Err(DecodeError::MalformedEnvelope(format!(
                "{field} contains the key separator '{KEY_SEPARATOR}'"
            )));
        }
    }

    let key = ScanKey::new(&envelope.ip, envelope.port, &envelope.service);
    let data_version = match DataVersion::try_from(envelope.data_version) {
        Ok(version) => version,
        Err(unknown) => {
            return Err(DecodeError::UnsupportedVersion {
                key,
                version: unknown.0,
            })
        }
    };

    let response = match data_version {
        DataVersion::V1 => decode_v1(data, key)?,
        DataVersion::V2 => decode_v2(data, key)?,
    };

    Ok(ScanResult {
        ip: envelope.ip,
        port: envelope.port,
        service: envelope.service,
        timestamp: envelope.timestamp,
        response,
        data_version,
    })
}

fn decode_v1(data: serde_json::Value, key: ScanKey) -> Result<String, DecodeError> {
    let v1: V1Data = match serde_json::from_value(data) {
        Ok(v1) => v1,
        Err(error) => {
            return Err(DecodeError::MalformedPayload {
                key,
                version: DataVersion::V1,
                reason: error.to_string(),
            })
        }
    };

    let bytes = match STANDARD.decode(v1.response_bytes_utf8) {
        Ok(bytes) => bytes,
        Err(error) => {
            return Err(DecodeError::InvalidEncoding {
                key,
                version: DataVersion::V1,
                reason: error.to_string(),
            })
        }
    };

    String::from_utf8(bytes).map_err(|error| DecodeError::InvalidEncoding {
        key,
        version: DataVersion::V1,
        reason: error.to_string(),
    })
}

fn decode_v2(data: serde_json::Value, key: ScanKey) -> Result<String, DecodeError> {
    let v2: V2Data =
        serde_json::from_value(data).map_err(|error| DecodeError::MalformedPayload {
            key,
            version: DataVersion::V2,
            reason: error.to_string(),
        })?;

    Ok(v2.response_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_message(encoded: &str) -> String {
        format!(
            r#"{{
                "ip": "192.168.1.1",
                "port": 80,
                "service": "http",
                "timestamp": 1234567890,
                "data_version": 1,
                "data": {{ "response_bytes_utf8": "{encoded}" }}
            }}"#
        )
    }

    fn v2_message(response: &str) -> String {
        format!(
            r#"{{
                "ip": "192.168.1.1",
                "port": 80,
                "service": "http",
                "timestamp": 1234567890,
                "data_version": 2,
                "data": {{ "response_str": "{response}" }}
            }}"#
        )
    }

    #[test]
    fn test_decode_v1() {
        let encoded = STANDARD.encode("hello world");
        let result = decode(v1_message(&encoded).as_bytes()).expect("failed to decode v1");

        assert_eq!(result.ip, "192.168.1.1");
        assert_eq!(result.port, 80);
        assert_eq!(result.service, "http");
        assert_eq!(result.timestamp, 1234567890);
        assert_eq!(result.data_version, DataVersion::V1);
        assert_eq!(result.response, "hello world");
    }

    #[test]
    fn test_decode_v2() {
        let message = r#"{
            "ip": "10.0.0.1",
            "port": 443,
            "service": "https",
            "timestamp": 9876543210,
            "data_version": 2,
            "data": { "response_str": "service response" }
        }"#;

        let result = decode(message.as_bytes()).expect("failed to decode v2");

        assert_eq!(result.ip, "10.0.0.1");
        assert_eq!(result.port, 443);
        assert_eq!(result.service, "https");
        assert_eq!(result.timestamp, 9876543210);
        assert_eq!(result.data_version, DataVersion::V2);
        assert_eq!(result.response, "service response");
    }

    #[test]
    fn test_versions_decode_to_same_response() {
        let text = "HTTP/1.1 200 OK";
        let v1 = decode(v1_message(&STANDARD.encode(text)).as_bytes()).unwrap();
        let v2 = decode(v2_message(text).as_bytes()).unwrap();

        assert_eq!(v1.response, v2.response);
        assert_eq!(v1.key(), v2.key());
        assert_eq!(v1.timestamp, v2.timestamp);
    }

    #[test]
    fn test_invalid_json() {
        let error = decode(br#"{"invalid json"#).unwrap_err();
        assert_eq!(error.kind(), "malformed_envelope");
    }

    #[test]
    fn test_missing_envelope_fields() {
        let missing_ip = r#"{"port": 80, "service": "http", "timestamp": 1, "data_version": 2, "data": {"response_str": "x"}}"#;
        assert!(matches!(
            decode(missing_ip.as_bytes()),
            Err(DecodeError::MalformedEnvelope(_))
        ));

        let missing_data =
            r#"{"ip": "1.1.1.1", "port": 80, "service": "http", "timestamp": 1, "data_version": 2}"#;
        assert!(matches!(
            decode(missing_data.as_bytes()),
            Err(DecodeError::MalformedEnvelope(_))
        ));

        let null_data = r#"{"ip": "1.1.1.1", "port": 80, "service": "http", "timestamp": 1, "data_version": 2, "data": null}"#;
        assert!(matches!(
            decode(null_data.as_bytes()),
            Err(DecodeError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_port_out_of_range() {
        let message = r#"{"ip": "1.1.1.1", "port": 4294967296, "service": "http", "timestamp": 1, "data_version": 2, "data": {"response_str": "x"}}"#;
        assert!(matches!(
            decode(message.as_bytes()),
            Err(DecodeError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_invalid_base64() {
        let error = decode(v1_message("not base64!!").as_bytes()).unwrap_err();
        assert!(matches!(
            error,
            DecodeError::InvalidEncoding {
                version: DataVersion::V1,
                ..
            }
        ));
        assert_eq!(error.kind(), "invalid_encoding");
    }

    #[test]
    fn test_v1_non_utf8_bytes() {
        let encoded = STANDARD.encode([0xff, 0xfe, 0xfd]);
        let error = decode(v1_message(&encoded).as_bytes()).unwrap_err();
        assert_eq!(error.kind(), "invalid_encoding");
    }

    #[test]
    fn test_payload_field_for_other_version() {
        // A V2 payload tagged as V1.
        let message = r#"{"ip": "1.1.1.1", "port": 80, "service": "http", "timestamp": 1, "data_version": 1, "data": {"response_str": "x"}}"#;
        let error = decode(message.as_bytes()).unwrap_err();
        assert!(matches!(
            error,
            DecodeError::MalformedPayload {
                version: DataVersion::V1,
                ..
            }
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let message = r#"{"ip": "1.1.1.1", "port": 80, "service": "http", "timestamp": 1, "data_version": 3, "data": {"response_str": "x"}}"#;
        let error = decode(message.as_bytes()).unwrap_err();
        assert_eq!(
            error,
            DecodeError::UnsupportedVersion {
                key: ScanKey::new("1.1.1.1", 80, "http"),
                version: 3
            }
        );
        assert_eq!(
            error.to_string(),
            "unsupported data version 3 for 1.1.1.1#80#http"
        );
    }

    #[test]
    fn test_errors_carry_key_and_version() {
        let error = decode(v1_message("not base64!!").as_bytes()).unwrap_err();
        assert_eq!(
            error.key(),
            Some(&ScanKey::new("192.168.1.1", 80, "http"))
        );
        assert_eq!(error.data_version(), Some(1));

        let message = r#"{"ip": "1.1.1.1", "port": 80, "service": "http", "timestamp": 1, "data_version": 2, "data": {"response_bytes_utf8": "eA=="}}"#;
        let error = decode(message.as_bytes()).unwrap_err();
        assert_eq!(error.kind(), "malformed_payload");
        assert_eq!(error.key(), Some(&ScanKey::new("1.1.1.1", 80, "http")));
        assert_eq!(error.data_version(), Some(2));

        let message = r#"{"ip": "1.1.1.1", "port": 80, "service": "http", "timestamp": 1, "data_version": 7, "data": {}}"#;
        assert_eq!(decode(message.as_bytes()).unwrap_err().data_version(), Some(7));

        let error = decode(b"[]").unwrap_err();
        assert_eq!(error.key(), None);
        assert_eq!(error.data_version(), None);
    }

    #[test]
    fn test_key_separator_in_ip_or_service() {
        // Both would render as x#1#y#2#z.
        let separator_in_ip = r#"{"ip": "x#1#y", "port": 2, "service": "z", "timestamp": 1, "data_version": 2, "data": {"response_str": "a"}}"#;
        let separator_in_service = r#"{"ip": "x", "port": 1, "service": "y#2#z", "timestamp": 1, "data_version": 2, "data": {"response_str": "b"}}"#;

        for message in [separator_in_ip, separator_in_service] {
            let error = decode(message.as_bytes()).unwrap_err();
            assert!(matches!(error, DecodeError::MalformedEnvelope(_)));
            assert!(error.to_string().contains("key separator"));
        }
    }
}
