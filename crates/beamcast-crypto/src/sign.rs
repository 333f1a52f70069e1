//! SHA-256 hashing and RSA signatures for the handshake boundary.
//!
//! The pairing server owns the X.509 certificate store; the core only needs
//! to hash challenges and sign/verify them. Private keys arrive as PKCS#8
//! DER, public keys as PKCS#1 `RSAPublicKey` DER.

use ring::rand::SystemRandom;
use ring::signature::{self, RsaKeyPair};
use sha2::{Digest, Sha256};

use crate::CryptoError;

/// SHA-256 digest of `data`.
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Sign `data` with RSASSA-PKCS1-v1_5 / SHA-256.
pub fn sign256(pkcs8_der: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key_pair = RsaKeyPair::from_pkcs8(pkcs8_der).map_err(|_| CryptoError::SignFailed)?;
    let mut sig = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(&signature::RSA_PKCS1_SHA256, &SystemRandom::new(), data, &mut sig)
        .map_err(|_| CryptoError::SignFailed)?;
    Ok(sig)
}

/// Verify an RSASSA-PKCS1-v1_5 / SHA-256 signature.
pub fn verify256(public_key_der: &[u8], data: &[u8], sig: &[u8]) -> bool {
    signature::UnparsedPublicKey::new(&signature::RSA_PKCS1_2048_8192_SHA256, public_key_der)
        .verify(data, sig)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        let digest = hash_sha256(b"abc");
        assert_eq!(
            digest[..4],
            [0xba, 0x78, 0x16, 0xbf],
        );
    }

    #[test]
    fn verify_rejects_garbage() {
        assert!(!verify256(&[0u8; 64], b"data", &[0u8; 256]));
    }
}
