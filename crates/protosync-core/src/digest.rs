//! SHA-256 content hashes for staged files and staging trees.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 of a file's final bytes. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| format!("invalid content hash: {s}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("content hash must be 32 bytes: {s}"))?;
        Ok(Self(arr))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Order-sensitive digest over `(name, hash)` pairs, NUL-separated.
pub fn ordered_digest<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a ContentHash)>,
{
    let mut hasher = Sha256::new();
    for (name, hash) in entries {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.0);
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_is_deterministic() {
        assert_eq!(ContentHash::compute(b"syntax"), ContentHash::compute(b"syntax"));
        assert_ne!(ContentHash::compute(b"a"), ContentHash::compute(b"b"));
    }

    #[test]
    fn test_hex_parse_roundtrip() {
        let hash = ContentHash::compute(b"package google.y.proto;");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!("abc".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_serializes_as_hex_string() {
        let hash = ContentHash::compute(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
    }

    #[test]
    fn test_ordered_digest_is_order_sensitive() {
        let a = ContentHash::compute(b"a");
        let b = ContentHash::compute(b"b");
        let d1 = ordered_digest([("a.proto", &a), ("b.proto", &b)]);
        let d2 = ordered_digest([("b.proto", &b), ("a.proto", &a)]);
        assert_ne!(d1, d2);
        assert_eq!(d1, ordered_digest([("a.proto", &a), ("b.proto", &b)]));
    }
}
