use xlsx_crypto::{decrypt_xlsx, is_encrypted, XlsxCryptoError};

const AGILE_SHA512: &[u8] = include_bytes!("fixtures/agile_sha512_aes256.xlsx");
const AGILE_SHA1: &[u8] = include_bytes!("fixtures/agile_sha1_aes128.xlsx");
const STANDARD: &[u8] = include_bytes!("fixtures/standard_aes128.xlsx");
const CERTIFICATE: &[u8] = include_bytes!("fixtures/agile_certificate_encryptor.xlsx");
const TAMPERED: &[u8] = include_bytes!("fixtures/agile_tampered.xlsx");
const MISSING_PACKAGE: &[u8] = include_bytes!("fixtures/missing_package.xlsx");

const PLAINTEXT_LARGE: &[u8] = include_bytes!("fixtures/plaintext_large.zip");
const PLAINTEXT_SMALL: &[u8] = include_bytes!("fixtures/plaintext_small.zip");

const ZIP_MAGIC: &[u8] = &[0x50, 0x4b, 0x03, 0x04];

/// Name of the first local file entry of a ZIP archive.
fn first_zip_entry(zip: &[u8]) -> &[u8] {
    assert_eq!(&zip[..4], ZIP_MAGIC);
    let name_len = u16::from_le_bytes([zip[26], zip[27]]) as usize;
    &zip[30..30 + name_len]
}

#[test]
fn agile_sha512_aes256_decrypts_to_the_original_package() {
    let out = decrypt_xlsx(AGILE_SHA512, "secret").unwrap();
    assert_eq!(first_zip_entry(&out), b"[Content_Types].xml");
    assert_eq!(out, PLAINTEXT_LARGE);
}

#[test]
fn agile_sha1_aes128_decrypts_to_the_original_package() {
    let out = decrypt_xlsx(AGILE_SHA1, "password").unwrap();
    assert_eq!(first_zip_entry(&out), b"[Content_Types].xml");
    assert_eq!(out, PLAINTEXT_SMALL);
}

#[test]
fn standard_aes128_decrypts_to_the_original_package() {
    let out = decrypt_xlsx(STANDARD, "VelvetSweatshop").unwrap();
    assert_eq!(first_zip_entry(&out), b"[Content_Types].xml");
    assert_eq!(out, PLAINTEXT_SMALL);
}

/// The plaintext size is declared in the package stream; the ciphertext of
/// the large fixture is deliberately not a multiple of the 4096-byte segment
/// length, so this also covers the short-final-segment path.
#[test]
fn plaintext_length_matches_the_declared_size() {
    let out = decrypt_xlsx(AGILE_SHA512, "secret").unwrap();
    assert_eq!(out.len(), PLAINTEXT_LARGE.len());
    assert_ne!(PLAINTEXT_LARGE.len() % 4096, 0);
    assert!(PLAINTEXT_LARGE.len() > 2 * 4096);
}

#[test]
fn decryption_is_deterministic() {
    let first = decrypt_xlsx(AGILE_SHA512, "secret").unwrap();
    let second = decrypt_xlsx(AGILE_SHA512, "secret").unwrap();
    assert_eq!(first, second);
}

#[test]
fn wrong_password_is_rejected_not_garbage() {
    for password in ["Secret", "secre", "secrets", ""] {
        let err = decrypt_xlsx(AGILE_SHA512, password).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::BadPassword), "{password:?}");
    }
    let err = decrypt_xlsx(STANDARD, "velvetsweatshop").unwrap_err();
    assert!(matches!(err, XlsxCryptoError::BadPassword));
}

#[test]
fn non_ole_input_is_rejected() {
    let err = decrypt_xlsx(b"not an ole file", "secret").unwrap_err();
    assert!(matches!(err, XlsxCryptoError::NotCompoundFile));
}

#[test]
fn certificate_key_encryptor_is_unsupported() {
    let err = decrypt_xlsx(CERTIFICATE, "secret").unwrap_err();
    assert!(matches!(err, XlsxCryptoError::Unsupported(_)));
}

#[test]
fn tampered_package_fails_the_integrity_check() {
    let err = decrypt_xlsx(TAMPERED, "secret").unwrap_err();
    assert!(matches!(err, XlsxCryptoError::IntegrityCheckFailed));
}

#[test]
fn missing_package_stream_is_reported() {
    let err = decrypt_xlsx(MISSING_PACKAGE, "password").unwrap_err();
    assert!(matches!(
        err,
        XlsxCryptoError::MissingStream("EncryptedPackage")
    ));
}

#[test]
fn encrypted_containers_are_detected() {
    assert!(is_encrypted(AGILE_SHA512));
    assert!(is_encrypted(AGILE_SHA1));
    assert!(is_encrypted(STANDARD));
    assert!(!is_encrypted(PLAINTEXT_SMALL));
    assert!(!is_encrypted(MISSING_PACKAGE));
}
