//! Uniform access to the hash, AES and base64 primitives the two encryption
//! schemes are built from. All operations are pure; key length selects the
//! AES variant and no padding is ever added or stripped, the callers truncate
//! to the logical sizes declared by the file.

use crate::error::{Result, XlsxCryptoError};
use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, KeyInit, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha512;

pub const AES_BLOCK_LEN: usize = 16;

/// The two hash algorithms MS-OFFCRYPTO files in the wild actually use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "SHA1" => Ok(Self::Sha1),
            "SHA512" => Ok(Self::Sha512),
            other => Err(XlsxCryptoError::Unsupported(format!(
                "hash algorithm {other}"
            ))),
        }
    }

    /// Digest length in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha1 => {
                let mut hasher = Sha1::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            Self::Sha512 => {
                let mut hasher = Sha512::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }

    /// Keyed-hash MAC over `data`.
    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Sha1 => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
                    .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            Self::Sha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key)
                    .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }
}

/// AES-ECB decryption; the output has the same length as the input.
pub fn aes_ecb_decrypt(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(XlsxCryptoError::CryptoError(
            "AES-ECB ciphertext is not block aligned".to_string(),
        ));
    }
    let mut buf = ciphertext.to_vec();
    match key.len() {
        16 => {
            let mut cipher = ecb::Decryptor::<Aes128>::new_from_slice(key)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?;
            for block in buf.chunks_exact_mut(AES_BLOCK_LEN) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
        24 => {
            let mut cipher = ecb::Decryptor::<Aes192>::new_from_slice(key)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?;
            for block in buf.chunks_exact_mut(AES_BLOCK_LEN) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
        32 => {
            let mut cipher = ecb::Decryptor::<Aes256>::new_from_slice(key)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?;
            for block in buf.chunks_exact_mut(AES_BLOCK_LEN) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
        n => {
            return Err(XlsxCryptoError::CryptoError(format!(
                "invalid AES key length {n}"
            )));
        }
    }
    Ok(buf)
}

/// AES-CBC decryption; the output has the same length as the input.
pub fn aes_cbc_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(XlsxCryptoError::CryptoError(
            "AES-CBC ciphertext is not block aligned".to_string(),
        ));
    }
    if iv.len() != AES_BLOCK_LEN {
        return Err(XlsxCryptoError::CryptoError(format!(
            "invalid AES-CBC IV length {}",
            iv.len()
        )));
    }
    let mut buf = ciphertext.to_vec();
    match key.len() {
        16 => {
            cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?;
        }
        24 => {
            cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?;
        }
        32 => {
            cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))?;
        }
        n => {
            return Err(XlsxCryptoError::CryptoError(format!(
                "invalid AES key length {n}"
            )));
        }
    }
    Ok(buf)
}

pub fn decode_base64(value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| XlsxCryptoError::CryptoError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn sha1_matches_known_vector() {
        assert_eq!(
            HashAlgorithm::Sha1.digest(&[b"abc"]),
            unhex("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
    }

    #[test]
    fn sha512_matches_known_vector() {
        assert_eq!(
            HashAlgorithm::Sha512.digest(&[b"abc"]),
            unhex(
                "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
                 2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
            )
        );
    }

    #[test]
    fn multi_part_digest_equals_concatenated_digest() {
        assert_eq!(
            HashAlgorithm::Sha512.digest(&[b"ab", b"c"]),
            HashAlgorithm::Sha512.digest(&[b"abc"])
        );
    }

    #[test]
    fn aes128_ecb_matches_fips197_vector() {
        let key = unhex("000102030405060708090a0b0c0d0e0f");
        let ciphertext = unhex("69c4e0d86a7b0430d8cdb78070b4c55a");
        let plaintext = aes_ecb_decrypt(&ciphertext, &key).unwrap();
        assert_eq!(plaintext, unhex("00112233445566778899aabbccddeeff"));
    }

    #[test]
    fn aes128_cbc_matches_sp800_38a_vector() {
        let key = unhex("2b7e151628aed2a6abf7158809cf4f3c");
        let iv = unhex("000102030405060708090a0b0c0d0e0f");
        let ciphertext = unhex("7649abac8119b246cee98e9b12e9197d");
        let plaintext = aes_cbc_decrypt(&ciphertext, &key, &iv).unwrap();
        assert_eq!(plaintext, unhex("6bc1bee22e409f96e93d7e117393172a"));
    }

    #[test]
    fn misaligned_ciphertext_is_a_primitive_failure() {
        let err = aes_ecb_decrypt(&[0u8; 10], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::CryptoError(_)));
        let err = aes_cbc_decrypt(&[0u8; 10], &[0u8; 16], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::CryptoError(_)));
    }

    #[test]
    fn invalid_key_length_is_rejected() {
        let err = aes_ecb_decrypt(&[0u8; 16], &[0u8; 15]).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::CryptoError(_)));
    }

    #[test]
    fn base64_decoding() {
        assert_eq!(decode_base64("AAEC").unwrap(), vec![0, 1, 2]);
        assert!(decode_base64("not base64!").is_err());
    }
}
