//! Password-based decryption of encrypted OOXML spreadsheets.
//!
//! Modern Office files protected with a password are not ZIP archives: the
//! OOXML package is encrypted per [MS-OFFCRYPTO] and wrapped in an OLE2
//! compound file holding an `EncryptionInfo` descriptor stream and an
//! `EncryptedPackage` ciphertext stream. This crate opens the container,
//! parses the descriptor, derives the key from the password and returns the
//! plaintext ZIP bytes.
//!
//! Both schemes found in the wild are supported:
//! - *Standard Encryption* (Office 2007 era): binary descriptor, SHA-1 key
//!   derivation, AES-ECB bulk decryption.
//! - *Agile Encryption* (Office 2010+): XML descriptor, SHA-1 or SHA-512 key
//!   derivation, AES-CBC bulk decryption in 4096-byte segments with
//!   per-segment IVs, plus an HMAC integrity check over the ciphertext.
//!
//! # Examples
//!
//! ```no_run
//! use xlsx_crypto::decrypt_xlsx;
//! use std::fs;
//!
//! let input = fs::read("protected.xlsx").unwrap();
//! let zip_bytes = decrypt_xlsx(&input, "secret").unwrap();
//! fs::write("plain.xlsx", zip_bytes).unwrap();
//! ```

mod crypto;
pub mod error;
mod ole;
mod util;

pub use error::{Result, XlsxCryptoError};

use crypto::{ecma376_agile, ecma376_standard};
use ole::CompoundFile;
use tracing::debug;
use util::EncryptionDescriptor;

const ENCRYPTION_INFO_STREAM: &str = "EncryptionInfo";
const ENCRYPTED_PACKAGE_STREAM: &str = "EncryptedPackage";

/// Decrypts the bytes of an encrypted OOXML container with a password.
///
/// `input` is the whole file (the OLE2 wrapper); `password` is the user
/// password in UTF-8, transcoded internally to the UTF-16LE code units the
/// key derivation hashes. On success the returned bytes are the inner OOXML
/// ZIP package, which this crate does not interpret.
///
/// A wrong password fails with [`XlsxCryptoError::BadPassword`]; every other
/// error kind marks the file as unsupported, corrupt or tampered with.
pub fn decrypt_xlsx(input: &[u8], password: &str) -> Result<Vec<u8>> {
    if input.is_empty() {
        return Err(XlsxCryptoError::EmptyInput);
    }

    let ole = CompoundFile::open(input)?;
    let encryption_info = ole
        .stream(ENCRYPTION_INFO_STREAM)?
        .ok_or(XlsxCryptoError::MissingStream(ENCRYPTION_INFO_STREAM))?;
    let encrypted_package = ole
        .stream(ENCRYPTED_PACKAGE_STREAM)?
        .ok_or(XlsxCryptoError::MissingStream(ENCRYPTED_PACKAGE_STREAM))?;

    match util::parse_encryption_info(&encryption_info)? {
        EncryptionDescriptor::Standard(info) => {
            debug!("decrypting with the Standard scheme");
            ecma376_standard::decrypt(&info, &encrypted_package, password)
        }
        EncryptionDescriptor::Agile(info) => {
            debug!("decrypting with the Agile scheme");
            ecma376_agile::decrypt(&info, &encrypted_package, password)
        }
    }
}

/// Returns `true` if `input` looks like an encrypted OOXML container: an
/// OLE2 compound file with both required streams present.
pub fn is_encrypted(input: &[u8]) -> bool {
    match CompoundFile::open(input) {
        Ok(ole) => {
            ole.has_stream(ENCRYPTION_INFO_STREAM) && ole.has_stream(ENCRYPTED_PACKAGE_STREAM)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_classified() {
        let err = decrypt_xlsx(&[], "password").unwrap_err();
        assert!(matches!(err, XlsxCryptoError::EmptyInput));
    }

    #[test]
    fn non_ole_input_is_classified() {
        let err = decrypt_xlsx(b"not an ole file", "password").unwrap_err();
        assert!(matches!(err, XlsxCryptoError::NotCompoundFile));
    }

    #[test]
    fn is_encrypted_is_false_for_garbage() {
        assert!(!is_encrypted(&[]));
        assert!(!is_encrypted(b"PK\x03\x04plain zip, not ole"));
    }
}
