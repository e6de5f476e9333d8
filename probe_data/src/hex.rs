use std::fmt::Write;

pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

pub fn decode(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    let text = text.strip_prefix("0x").unwrap_or(text);
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }

    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// `#[serde(with = "probe_data::hex::serde_bytes")]` for byte blobs stored as hex strings.
pub mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(v))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;
        super::decode(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid hex: {v}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        assert_eq!(encode(&[0x0f, 0x0b, 0xff]), "0f0bff");
        assert_eq!(decode("0f0bff"), Some(vec![0x0f, 0x0b, 0xff]));
        assert_eq!(decode("0x90"), Some(vec![0x90]));
        assert_eq!(decode(""), Some(vec![]));
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert_eq!(decode("9"), None);
        assert_eq!(decode("zz"), None);
        assert_eq!(decode("éé"), None);
    }
}
