use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Change-set attached to a BIP. Never inspected here; handed verbatim to
/// the upgrade executor once the proposal passes.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChangePayload(#[serde(with = "crate::governance::payload::serde_hex")] Vec<u8>);

impl ChangePayload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(encoded: &str) -> Result<Self, hex::FromHexError> {
        let trimmed = encoded.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        hex::decode(trimmed).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"bip-payload");
        hasher.update(&self.0);
        hasher.finalize().into()
    }
}

impl From<Vec<u8>> for ChangePayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ChangePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangePayload(0x{})", hex::encode(&self.0))
    }
}

pub(crate) mod serde_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let trimmed = encoded.strip_prefix("0x").unwrap_or(&encoded);
        hex::decode(trimmed).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_hex_on_the_wire() {
        let payload = ChangePayload::new(vec![0xde, 0xad, 0xbe, 0xef]);
        let encoded = serde_json::to_string(&payload).unwrap();
        assert_eq!(encoded, "\"0xdeadbeef\"");
        let decoded: ChangePayload = serde_json::from_str("\"deadbeef\"").unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn from_hex_accepts_prefix_and_empty_call() {
        assert!(ChangePayload::from_hex("0x").unwrap().is_empty());
        assert_eq!(ChangePayload::from_hex(" 0x0102 ").unwrap().len(), 2);
        assert!(ChangePayload::from_hex("zz").is_err());
    }

    #[test]
    fn digest_depends_on_bytes_only() {
        let a = ChangePayload::new(b"cut".to_vec());
        let b = ChangePayload::from_hex(&hex::encode(b"cut")).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), ChangePayload::default().digest());
    }
}
