//! Per-invocation instance identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing a malformed [`InstanceId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid instance id {0:?}")]
pub struct ParseIdError(String);

/// A 128-bit random token identifying one container invocation.
///
/// The textual form is exactly 32 lowercase hex characters and round-trips
/// through [`FromStr`] and [`fmt::Display`]. It ends up in the share
/// directory, runtime directory and cgroup leaf names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId([u8; 16]);

impl InstanceId {
    /// Generates a new random instance ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// The raw 16 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InstanceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ParseIdError(s.to_owned()));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = hex_val(chunk[0]);
            let lo = hex_val(chunk[1]);
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        _ => b - b'a' + 10,
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let text = "0123456789abcdef0123456789abcdef";
        let id: InstanceId = text.parse().expect("should parse");
        assert_eq!(id.to_string(), text);
    }

    #[test]
    fn test_generate_round_trip() {
        let id = InstanceId::generate();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<InstanceId>().unwrap(), id);
    }

    #[test]
    fn test_rejects_uppercase() {
        assert!("0123456789ABCDEF0123456789ABCDEF".parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!("0123".parse::<InstanceId>().is_err());
        assert!("".parse::<InstanceId>().is_err());
        assert!("0123456789abcdef0123456789abcdef00".parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_serde() {
        let id: InstanceId = "f2f3bcd492d0266438fa9bf164fe90d9".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"f2f3bcd492d0266438fa9bf164fe90d9\"");
        assert_eq!(serde_json::from_str::<InstanceId>(&json).unwrap(), id);
    }
}
