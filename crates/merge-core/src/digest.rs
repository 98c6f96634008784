use sha2::{Digest as _, Sha512};
use std::fmt;
use std::io::{self, Read};

/// Width in bytes of the digest this crate standardizes on (SHA-512).
pub const DIGEST_LEN: usize = 64;

/// Width in hex characters of a formatted digest: two characters per byte.
pub const DIGEST_HEX_LEN: usize = DIGEST_LEN * 2;

/// A SHA-512 content digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub fn from_hex(s: &str) -> Option<Digest> {
        if s.len() != DIGEST_HEX_LEN {
            return None;
        }
        let mut bytes = [0u8; DIGEST_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = s.as_bytes()[i * 2];
            let lo = s.as_bytes()[i * 2 + 1];
            *byte = (hex_nibble(hi)? << 4) | hex_nibble(lo)?;
        }
        Some(Digest(bytes))
    }
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Hashes a reader in 1 MiB chunks, matching the chunk size the original hasher used for its
/// `SHA512_Update` loop.
pub fn hash_reader(mut r: impl Read) -> io::Result<Digest> {
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let out = hasher.finalize();
    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(&out);
    Ok(Digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let d = hash_reader("hello world".as_bytes()).unwrap();
        let s = d.to_string();
        assert_eq!(s.len(), DIGEST_HEX_LEN);
        let parsed = Digest::from_hex(&s).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn from_hex_rejects_short_and_nonhex() {
        assert!(Digest::from_hex("abcd").is_none());
        let bad = "g".repeat(DIGEST_HEX_LEN);
        assert!(Digest::from_hex(&bad).is_none());
    }

    #[test]
    fn same_content_same_digest() {
        let a = hash_reader("identical".as_bytes()).unwrap();
        let b = hash_reader("identical".as_bytes()).unwrap();
        assert_eq!(a, b);
    }
}
