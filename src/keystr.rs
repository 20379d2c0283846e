use core::fmt;

use crate::io::{Decodeable, Encodeable};

/// An order-preserving byte-string key.
///
/// Keys compare lexicographically on their raw bytes; the serialized form
/// is length-prefixed so that keys and non-key payloads can share a page
/// without ambiguity.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyStr {
    bytes: Vec<u8>,
}

impl KeyStr {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The empty key; sorts before every other key, so it doubles as the
    /// infimum fence of a leftmost page.
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Serialized length when stored as a key (length prefix included).
    pub fn length_as_keystr(&self) -> usize {
        2 + self.bytes.len()
    }

    /// Raw length when stored as an unprefixed payload.
    pub fn length_as_nonkeystr(&self) -> usize {
        self.bytes.len()
    }

    pub fn common_prefix_len(&self, other: &KeyStr) -> usize {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.bytes.starts_with(prefix)
    }

    /// The key without its first `n` bytes.
    pub fn suffix(&self, n: usize) -> &[u8] {
        &self.bytes[n..]
    }
}

impl Encodeable for KeyStr {
    fn encode(&self) -> Vec<u8> {
        self.bytes.encode()
    }
}

impl Decodeable for KeyStr {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        Self {
            bytes: Vec::<u8>::decode_from(reader),
        }
    }
}

impl fmt::Debug for KeyStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) => write!(f, "k\"{}\"", s),
            Err(_) => write!(f, "k0x{}", hex::encode(&self.bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order() {
        let a = KeyStr::new(b"abc");
        let b = KeyStr::new(b"abd");
        let c = KeyStr::new(b"abcd");
        assert!(KeyStr::empty() < a);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
        assert_eq!(a.common_prefix_len(&b), 2);
        assert_eq!(a.common_prefix_len(&c), 3);
    }
}
