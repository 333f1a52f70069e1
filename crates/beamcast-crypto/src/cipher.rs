//! AES cipher modes used on the media and control paths.
//!
//! All three wrap AES-128. GCM appends its 16-byte tag to the ciphertext;
//! CBC and ECB use PKCS#7 padding unless constructed with `padding = false`,
//! in which case inputs must be block-aligned.

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes128;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Nonce};

use crate::CryptoError;

/// GCM authentication tag size in bytes.
pub const GCM_TAG_SIZE: usize = 16;

const BLOCK: usize = 16;

/// Round `size` up to a whole number of cipher blocks; upper bound for a
/// PKCS#7-padded ciphertext buffer.
pub const fn round_to_pkcs7_padded(size: usize) -> usize {
    ((size + BLOCK - 1) / BLOCK) * BLOCK
}

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != 16 {
        return Err(CryptoError::KeyLength { len: key.len(), expected: 16 });
    }
    Ok(())
}

// ── GCM ───────────────────────────────────────────────────────────────────────

/// AES-128-GCM with caller-supplied per-message 12-byte IVs.
#[derive(Clone)]
pub struct GcmCipher {
    inner: Aes128Gcm,
}

impl GcmCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        check_key(key)?;
        let inner = Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::KeyLength { len: key.len(), expected: 16 })?;
        Ok(Self { inner })
    }

    /// Encrypt; returns ciphertext with the 16-byte tag appended.
    pub fn encrypt(&self, iv: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|_| CryptoError::SignFailed)
    }

    /// Decrypt a tag-appended ciphertext.
    pub fn decrypt(&self, iv: &[u8; 12], tagged_cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if tagged_cipher.len() < GCM_TAG_SIZE {
            return Err(CryptoError::TagMismatch);
        }
        self.inner
            .decrypt(Nonce::from_slice(iv), tagged_cipher)
            .map_err(|_| CryptoError::TagMismatch)
    }
}

// ── CBC ───────────────────────────────────────────────────────────────────────

/// AES-128-CBC. Used for the audio shards and legacy input blobs.
#[derive(Clone)]
pub struct CbcCipher {
    key: [u8; 16],
    padding: bool,
}

impl CbcCipher {
    pub fn new(key: &[u8], padding: bool) -> Result<Self, CryptoError> {
        check_key(key)?;
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self { key: k, padding })
    }

    pub fn encrypt(&self, iv: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let enc = cbc::Encryptor::<Aes128>::new(&self.key.into(), iv.into());
        if self.padding {
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        } else {
            if plaintext.len() % BLOCK != 0 {
                return Err(CryptoError::BadPadding);
            }
            Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
        }
    }

    pub fn decrypt(&self, iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let dec = cbc::Decryptor::<Aes128>::new(&self.key.into(), iv.into());
        if self.padding {
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::BadPadding)
        } else {
            dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|_| CryptoError::BadPadding)
        }
    }
}

// ── ECB ───────────────────────────────────────────────────────────────────────

/// AES-128-ECB, kept for the pairing key-exchange blocks only.
#[derive(Clone)]
pub struct EcbCipher {
    key: [u8; 16],
    padding: bool,
}

impl EcbCipher {
    pub fn new(key: &[u8], padding: bool) -> Result<Self, CryptoError> {
        check_key(key)?;
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self { key: k, padding })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let enc = ecb::Encryptor::<Aes128>::new(&self.key.into());
        if self.padding {
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        } else {
            if plaintext.len() % BLOCK != 0 {
                return Err(CryptoError::BadPadding);
            }
            Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let dec = ecb::Decryptor::<Aes128>::new(&self.key.into());
        if self.padding {
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::BadPadding)
        } else {
            dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|_| CryptoError::BadPadding)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [7u8; 16];

    #[test]
    fn gcm_roundtrip_and_tag_rejection() {
        let cipher = GcmCipher::new(&KEY).unwrap();
        let iv = [3u8; 12];
        for plaintext in [&b""[..], b"x", b"0123456789abcdef", b"a longer plaintext spanning blocks"] {
            let tagged = cipher.encrypt(&iv, plaintext).unwrap();
            assert_eq!(tagged.len(), plaintext.len() + GCM_TAG_SIZE);
            assert_eq!(cipher.decrypt(&iv, &tagged).unwrap(), plaintext);
        }

        // Flipping any ciphertext bit must fail authentication
        let mut tagged = cipher.encrypt(&iv, b"payload").unwrap();
        tagged[0] ^= 1;
        assert!(cipher.decrypt(&iv, &tagged).is_err());

        // Same plaintext under a different IV yields different ciphertext
        let a = cipher.encrypt(&[1u8; 12], b"payload").unwrap();
        let b = cipher.encrypt(&[2u8; 12], b"payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn cbc_roundtrip_padded() {
        let cipher = CbcCipher::new(&KEY, true).unwrap();
        let iv = [9u8; 16];
        for plaintext in [&b"a"[..], b"0123456789abcdef", b"seventeen bytes!!"] {
            let ct = cipher.encrypt(&iv, plaintext).unwrap();
            assert_eq!(ct.len() % 16, 0);
            assert!(ct.len() > plaintext.len() - 1);
            assert_eq!(cipher.decrypt(&iv, &ct).unwrap(), plaintext);
        }
    }

    #[test]
    fn cbc_unpadded_requires_alignment() {
        let cipher = CbcCipher::new(&KEY, false).unwrap();
        let iv = [0u8; 16];
        assert!(cipher.encrypt(&iv, b"short").is_err());
        let ct = cipher.encrypt(&iv, &[0xabu8; 32]).unwrap();
        assert_eq!(ct.len(), 32);
        assert_eq!(cipher.decrypt(&iv, &ct).unwrap(), vec![0xabu8; 32]);
    }

    #[test]
    fn ecb_roundtrip() {
        let cipher = EcbCipher::new(&KEY, true).unwrap();
        let ct = cipher.encrypt(b"pin exchange blk").unwrap();
        assert_eq!(cipher.decrypt(&ct).unwrap(), b"pin exchange blk");
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        assert!(GcmCipher::new(&[0u8; 15]).is_err());
        assert!(CbcCipher::new(&[0u8; 32], true).is_err());
    }
}
