//! Serde helpers for binary payloads inside JSON messages.

use serde::{Deserialize, Serialize};

/// A byte buffer travelling as a hex string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexBytes(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl From<Vec<u8>> for HexBytes {
    fn from(data: Vec<u8>) -> Self {
        HexBytes(data)
    }
}

/// Encodes a byte buffer as a lowercase hex string.
pub mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(data: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "super::hex_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn bytes_travel_as_hex() {
        let blob = Blob {
            data: vec![0, 0xff, b'a'],
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"data":"00ff61"}"#);
        assert_eq!(serde_json::from_str::<Blob>(&json).unwrap(), blob);
        assert!(serde_json::from_str::<Blob>(r#"{"data":"zz"}"#).is_err());
    }

    #[test]
    fn newtype_is_a_bare_string() {
        let json = serde_json::to_string(&super::HexBytes(b"hi".to_vec())).unwrap();
        assert_eq!(json, r#""6869""#);
    }
}
