use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Payload the client writes at the start of its buffer
pub const CLIENT_GREETING: &[u8] = b"Hello from client";

/// SHA-256 of a whole buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Digest of `buf`
    #[must_use]
    pub fn of(buf: &[u8]) -> Self {
        Self(Sha256::digest(buf).into())
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64 lowercase hex characters
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Print the digest of `buf` the way the validate mode reports it
pub fn report_digest(buf: &[u8]) -> Digest {
    let digest = Digest::of(buf);
    println!("Hash of MR1: {digest}");
    digest
}

/// Overwrite all of `buf` with random bytes from a freshly seeded generator
pub fn fill_random(buf: &mut [u8]) {
    StdRng::from_entropy().fill_bytes(buf);
}

/// Write the client greeting at the start of `buf`, truncated to its length
pub fn write_greeting(buf: &mut [u8]) {
    let n = CLIENT_GREETING.len().min(buf.len());
    if let (Some(dst), Some(src)) = (buf.get_mut(..n), CLIENT_GREETING.get(..n)) {
        dst.copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_and_content_sensitive() {
        let mut buf = vec![0_u8; 4096];
        write_greeting(&mut buf);
        let first = Digest::of(&buf);
        assert_eq!(first, Digest::of(&buf));
        assert_eq!(first.to_hex().len(), 64);
        assert!(first
            .to_hex()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        if let Some(last) = buf.last_mut() {
            *last ^= 1;
        }
        assert_ne!(first, Digest::of(&buf));
    }

    #[test]
    fn known_digest_of_empty_input() {
        assert_eq!(
            Digest::of(&[]).to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fill_stays_inside_the_buffer() {
        for len in [1_usize, 7, 64, 4096] {
            // guard bytes on both sides of the filled window
            let mut backing = vec![0_u8; len + 32];
            let window = backing.get_mut(16..16 + len).unwrap();
            fill_random(window);
            assert!(backing[..16].iter().all(|b| *b == 0));
            assert!(backing[16 + len..].iter().all(|b| *b == 0));
            if len >= 64 {
                let changed = backing[16..16 + len].iter().filter(|b| **b != 0).count();
                assert!(changed > len / 2);
            }
        }
    }

    #[test]
    fn consecutive_fills_differ() {
        let mut a = vec![0_u8; 256];
        let mut b = vec![0_u8; 256];
        fill_random(&mut a);
        fill_random(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn greeting_is_truncated_to_short_buffers() {
        let mut short = [0_u8; 5];
        write_greeting(&mut short);
        assert_eq!(&short, b"Hello");
        let mut long = [0_u8; 20];
        write_greeting(&mut long);
        assert_eq!(&long[..17], CLIENT_GREETING);
        assert_eq!(&long[17..], &[0, 0, 0]);
    }
}
