//! Key derivation and randomness.

use rand::Rng;
use sha2::{Digest, Sha256};

/// 16-byte AES-128 key.
pub type AesKey = [u8; 16];

/// Derive the pairing AES key from the 16-byte salt and the user's PIN:
/// the first half of SHA-256(salt || pin).
pub fn gen_aes_key(salt: &[u8; 16], pin: &str) -> AesKey {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Cryptographically-seeded random bytes.
pub fn rand_bytes(count: usize) -> Vec<u8> {
    let mut out = vec![0u8; count];
    rand::thread_rng().fill(&mut out[..]);
    out
}

const DEFAULT_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!%&()=-";

/// Random string drawn from the default alphanumeric-plus-symbols alphabet.
pub fn rand_alphabet(count: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| DEFAULT_ALPHABET[rng.gen_range(0..DEFAULT_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_derivation_is_deterministic() {
        let salt = [0x11u8; 16];
        assert_eq!(gen_aes_key(&salt, "1234"), gen_aes_key(&salt, "1234"));
        assert_ne!(gen_aes_key(&salt, "1234"), gen_aes_key(&salt, "1235"));
        assert_ne!(gen_aes_key(&[0x12u8; 16], "1234"), gen_aes_key(&salt, "1234"));
    }

    #[test]
    fn rand_alphabet_stays_in_alphabet() {
        let s = rand_alphabet(64);
        assert_eq!(s.len(), 64);
        assert!(s.bytes().all(|b| DEFAULT_ALPHABET.contains(&b)));
    }
}
