use crate::crypto::{ecma376_agile, ecma376_standard};
use crate::error::{Result, XlsxCryptoError};
use zeroize::Zeroizing;

/// EncryptionVersionInfo flag bits used by the Standard scheme.
const FLAG_RESERVED: u32 = 0b0000_0011;
const FLAG_CRYPTO_API: u32 = 0b0000_0100;
const FLAG_EXTERNAL: u32 = 0b0001_0000;
const FLAG_AES: u32 = 0b0010_0000;

/// Flags value required for Agile (version 4.4) streams.
const AGILE_FLAGS: u32 = 0x40;

/// The parsed body of an `EncryptionInfo` stream, tagged by scheme.
#[derive(Debug)]
pub enum EncryptionDescriptor {
    Standard(ecma376_standard::StandardEncryptionInfo),
    Agile(ecma376_agile::AgileEncryptionInfo),
}

/// Parses the 8-byte version/flags prefix of an `EncryptionInfo` stream and
/// dispatches the remaining body to the Standard or Agile descriptor parser.
///
/// Version `4.4` selects Agile; minor version `2` with major `2`, `3` or `4`
/// selects Standard after the flag-bit checks below. Anything else is an
/// unsupported version (this includes the `x.3` Extensible variants).
pub fn parse_encryption_info(data: &[u8]) -> Result<EncryptionDescriptor> {
    if data.len() < 8 {
        return Err(XlsxCryptoError::BadHeader);
    }
    let major = u16::from_le_bytes([data[0], data[1]]);
    let minor = u16::from_le_bytes([data[2], data[3]]);
    let flags = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let body = &data[8..];

    if (major, minor) == (4, 4) {
        if flags != AGILE_FLAGS {
            return Err(XlsxCryptoError::BadHeader);
        }
        return ecma376_agile::parse_descriptor(body).map(EncryptionDescriptor::Agile);
    }

    if minor != 2 || !(2..=4).contains(&major) {
        return Err(XlsxCryptoError::UnsupportedVersion(major, minor));
    }

    // Reserved1/Reserved2 must be clear
    if flags & FLAG_RESERVED != 0 {
        return Err(XlsxCryptoError::BadHeader);
    }
    // fCryptoAPI set and fExternal clear, or the document uses an extensible
    // (third-party) encryption module
    if flags & FLAG_CRYPTO_API == 0 || flags & FLAG_EXTERNAL != 0 {
        return Err(XlsxCryptoError::UnsupportedExtensibleEncryption);
    }
    // fAES marks the protected content as an ECMA-376 document
    if flags & FLAG_AES == 0 {
        return Err(XlsxCryptoError::NotOoxml);
    }

    ecma376_standard::parse_descriptor(body).map(EncryptionDescriptor::Standard)
}

/// Transcodes a password to the UTF-16LE byte sequence that enters the hash:
/// two bytes per code unit, no BOM, no terminator.
pub fn password_utf16le(password: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(
        password
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(major: u16, minor: u16, flags: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&major.to_le_bytes());
        data.extend_from_slice(&minor.to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data
    }

    #[test]
    fn rejects_unknown_version() {
        let err = parse_encryption_info(&header(5, 0, 0)).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::UnsupportedVersion(5, 0)));
    }

    #[test]
    fn rejects_agile_with_wrong_flags() {
        let err = parse_encryption_info(&header(4, 4, 0x41)).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::BadHeader));
    }

    #[test]
    fn rejects_standard_with_reserved_bit() {
        let err = parse_encryption_info(&header(4, 2, 0x24 | 0b01)).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::BadHeader));
    }

    #[test]
    fn rejects_standard_with_external_bit() {
        let err = parse_encryption_info(&header(4, 2, 0x24 | 0b1_0000)).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::UnsupportedExtensibleEncryption));
    }

    #[test]
    fn rejects_standard_without_crypto_api_bit() {
        let err = parse_encryption_info(&header(3, 2, 0b10_0000)).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::UnsupportedExtensibleEncryption));
    }

    #[test]
    fn rejects_standard_without_aes_bit() {
        let err = parse_encryption_info(&header(4, 2, 0b0100)).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::NotOoxml));
    }

    #[test]
    fn rejects_truncated_prefix() {
        let err = parse_encryption_info(&[4, 0, 4, 0]).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::BadHeader));
    }

    #[test]
    fn password_transcoding_is_utf16le_without_terminator() {
        assert_eq!(
            password_utf16le("Ab").as_slice(),
            &[0x41, 0x00, 0x62, 0x00]
        );
        // Non-BMP code points become surrogate pairs
        assert_eq!(
            password_utf16le("\u{1f600}").as_slice(),
            &[0x3d, 0xd8, 0x00, 0xde]
        );
    }
}
