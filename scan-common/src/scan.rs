use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The wire encodings producers have used for the `data` object of a scan message.
/// V1: the response is base64 encoded under `response_bytes_utf8`.
/// V2: the response is plain text under `response_str`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "i64")]
pub enum DataVersion {
    V1,
    V2,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a known data version")]
pub struct UnknownDataVersion(pub i64);

impl TryFrom<i64> for DataVersion {
    type Error = UnknownDataVersion;

    fn try_from(tag: i64) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(DataVersion::V1),
            2 => Ok(DataVersion::V2),
            unknown => Err(UnknownDataVersion(unknown)),
        }
    }
}

impl From<DataVersion> for u8 {
    fn from(version: DataVersion) -> Self {
        match version {
            DataVersion::V1 => 1,
            DataVersion::V2 => 2,
        }
    }
}

impl fmt::Display for DataVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// A scan result normalized from any of the supported wire encodings.
/// This is the unit of storage: at most one is kept per `ScanKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub ip: String,
    pub port: u32,
    pub service: String,
    /// Producer clock value. The only ordering used when resolving conflicts.
    pub timestamp: i64,
    pub response: String,
    pub data_version: DataVersion,
}

impl ScanResult {
    pub fn key(&self) -> ScanKey {
        ScanKey::new(&self.ip, self.port, &self.service)
    }
}

/// Identity of a stored scan result: the `(ip, port, service)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanKey {
    pub ip: String,
    pub port: u32,
    pub service: String,
}

impl ScanKey {
    pub fn new(ip: &str, port: u32, service: &str) -> Self {
        Self {
            ip: ip.to_owned(),
            port,
            service: service.to_owned(),
        }
    }
}

/// Joins the parts of the composite storage key. It can't appear in `ip` or `service`,
/// otherwise two different keys could render the same.
pub const KEY_SEPARATOR: char = '#';

/// Composite storage key, `{ip}#{port}#{service}`.
impl fmt::Display for ScanKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.ip,
            self.port,
            self.service,
            sep = KEY_SEPARATOR
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_key_format() {
        let key = ScanKey::new("172.16.0.1", 443, "https");
        assert_eq!(key.to_string(), "172.16.0.1#443#https");
    }

    #[test]
    fn test_data_version_from_tag() {
        assert_eq!(DataVersion::try_from(1), Ok(DataVersion::V1));
        assert_eq!(DataVersion::try_from(2), Ok(DataVersion::V2));
        assert_eq!(DataVersion::try_from(3), Err(UnknownDataVersion(3)));
        assert_eq!(DataVersion::try_from(-1), Err(UnknownDataVersion(-1)));
    }

    #[test]
    fn test_scan_result_serializes_version_as_number() {
        let result = ScanResult {
            ip: "10.0.0.1".to_owned(),
            port: 22,
            service: "ssh".to_owned(),
            timestamp: 42,
            response: "SSH-2.0-OpenSSH_9.6".to_owned(),
            data_version: DataVersion::V2,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["data_version"], 2);

        let back: ScanResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.key().to_string(), "10.0.0.1#22#ssh");
    }
}
