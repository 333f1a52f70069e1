//! beamcast-crypto — the ciphers and key material the streaming core uses.
//!
//! Media paths are AES, never TLS:
//!
//! | Stream  | Cipher       | IV                                    |
//! |---------|--------------|---------------------------------------|
//! | control | AES-128-GCM  | seed XOR big-endian per-direction seq |
//! | video   | AES-128-GCM  | seed XOR big-endian shard counter     |
//! | audio   | AES-128-CBC  | derived from `avRiKeyId` + sequence   |
//! | pairing | AES-128-ECB  | — (key exchange blocks)               |

pub mod cipher;
pub mod keys;
pub mod sign;

pub use cipher::{CbcCipher, EcbCipher, GcmCipher, round_to_pkcs7_padded, GCM_TAG_SIZE};
pub use keys::{gen_aes_key, rand_alphabet, rand_bytes, AesKey};
pub use sign::{hash_sha256, sign256, verify256};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length {len} (expected {expected})")]
    KeyLength { len: usize, expected: usize },

    #[error("Invalid IV length {len}")]
    IvLength { len: usize },

    #[error("Ciphertext is not block-aligned or padding is invalid")]
    BadPadding,

    #[error("Authentication tag mismatch")]
    TagMismatch,

    #[error("Signing failed")]
    SignFailed,
}
