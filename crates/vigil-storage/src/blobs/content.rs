//! Content keys

use std::fmt;

/// BLAKE3 identity of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub hash: [u8; 32],
    /// Size of the hashed payload in bytes
    pub size: u64,
}

impl ContentKey {
    pub fn from_data(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self {
            hash: *hash.as_bytes(),
            size: data.len() as u64,
        }
    }

    /// Lowercase hex of the hash, used as the blob key and file name
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// First 8 hex chars, for logs
    pub fn short_hash(&self) -> String {
        hex::encode(&self.hash[..4])
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({}, {} bytes)", self.short_hash(), self.size)
    }
}

/// Whether a string looks like a blob key
pub fn is_valid_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_same_key() {
        let a = ContentKey::from_data(b"hello");
        let b = ContentKey::from_data(b"hello");
        let c = ContentKey::from_data(b"hello!");
        assert_eq!(a, b);
        assert_ne!(a.hash_hex(), c.hash_hex());
        assert_eq!(a.size, 5);
    }

    #[test]
    fn test_key_format() {
        let key = ContentKey::from_data(b"payload");
        assert!(is_valid_key(&key.hash_hex()));
        assert_eq!(key.short_hash().len(), 8);
        assert!(!is_valid_key("../etc/passwd"));
        assert!(!is_valid_key(&key.hash_hex().to_uppercase()));
    }
}
