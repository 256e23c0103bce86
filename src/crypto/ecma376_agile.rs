//! ECMA-376 *Agile Encryption*: XML `EncryptionInfo` descriptor, iterated
//! hash key derivation with block-key subkeys, password verifier, HMAC data
//! integrity and 4096-byte segmented AES-CBC bulk decryption.

use crate::crypto::primitives::{aes_cbc_decrypt, decode_base64, HashAlgorithm, AES_BLOCK_LEN};
use crate::error::{Result, XlsxCryptoError};
use crate::util::password_utf16le;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use tracing::{debug, warn};
use zeroize::Zeroizing;

const NS_ENCRYPTION: &[u8] = b"http://schemas.microsoft.com/office/2006/encryption";
const NS_PASSWORD: &[u8] = b"http://schemas.microsoft.com/office/2006/keyEncryptor/password";

/// Bulk ciphertext is cut into segments of this many bytes, each decrypted
/// with its own IV.
const SEGMENT_LEN: usize = 4096;
const PACKAGE_OFFSET: usize = 8;

/// Upper bound on the declared spin count; anything above is either corrupt
/// or a denial of service.
const MAX_SPIN_COUNT: u32 = 10_000_000;

// Block keys mixed into the iterated hash to derive purpose-specific subkeys
// (MS-OFFCRYPTO 2.3.4.13) and the data integrity IVs (2.3.4.14)
const BLOCK_KEY_VERIFIER_INPUT: [u8; 8] = [0xfe, 0xa7, 0xd2, 0x76, 0x3b, 0x4b, 0x9e, 0x79];
const BLOCK_KEY_VERIFIER_HASH: [u8; 8] = [0xd7, 0xaa, 0x0f, 0x6d, 0x30, 0x61, 0x34, 0x4e];
const BLOCK_KEY_KEY_VALUE: [u8; 8] = [0x14, 0x6e, 0x0b, 0xe7, 0xab, 0xac, 0xd0, 0xd6];
const BLOCK_KEY_HMAC_KEY: [u8; 8] = [0x5f, 0xb2, 0xad, 0x01, 0x0c, 0xb9, 0xe1, 0xf6];
const BLOCK_KEY_HMAC_VALUE: [u8; 8] = [0xa0, 0x67, 0x7f, 0x02, 0xb2, 0x2c, 0x84, 0x33];

/// Parsed body of an Agile `EncryptionInfo` stream.
#[derive(Debug)]
pub struct AgileEncryptionInfo {
    pub key_data: KeyData,
    pub data_integrity: DataIntegrity,
    pub key_encryptor: PasswordKeyEncryptor,
}

/// The `keyData` element: parameters of the bulk package cipher.
#[derive(Debug)]
pub struct KeyData {
    pub salt_size: usize,
    pub block_size: usize,
    pub key_bits: usize,
    pub hash_size: usize,
    pub hash_algorithm: HashAlgorithm,
    pub salt_value: Vec<u8>,
}

/// The `dataIntegrity` element: HMAC key and value, both encrypted with the
/// package key.
#[derive(Debug)]
pub struct DataIntegrity {
    pub encrypted_hmac_key: Vec<u8>,
    pub encrypted_hmac_value: Vec<u8>,
}

/// The password `encryptedKey` element: parameters of the key encryptor plus
/// the verifier pair and the wrapped package key.
#[derive(Debug)]
pub struct PasswordKeyEncryptor {
    pub spin_count: u32,
    pub salt_size: usize,
    pub block_size: usize,
    pub key_bits: usize,
    pub hash_size: usize,
    pub hash_algorithm: HashAlgorithm,
    pub salt_value: Vec<u8>,
    pub encrypted_verifier_hash_input: Vec<u8>,
    pub encrypted_verifier_hash_value: Vec<u8>,
    pub encrypted_key_value: Vec<u8>,
}

fn bad(detail: impl Into<String>) -> XlsxCryptoError {
    XlsxCryptoError::BadEncryptionInfo(detail.into())
}

fn attr_string(element: &BytesStart, name: &str) -> Result<String> {
    let attr = element
        .try_get_attribute(name)
        .map_err(|e| bad(e.to_string()))?
        .ok_or_else(|| bad(format!("missing attribute {name}")))?;
    attr.unescape_value()
        .map(|v| v.into_owned())
        .map_err(|e| bad(e.to_string()))
}

fn attr_usize(element: &BytesStart, name: &str) -> Result<usize> {
    attr_string(element, name)?
        .parse()
        .map_err(|_| bad(format!("attribute {name} is not an integer")))
}

fn attr_u32(element: &BytesStart, name: &str) -> Result<u32> {
    attr_string(element, name)?
        .parse()
        .map_err(|_| bad(format!("attribute {name} is not an integer")))
}

fn attr_base64(element: &BytesStart, name: &str) -> Result<Vec<u8>> {
    decode_base64(&attr_string(element, name)?)
        .map_err(|_| bad(format!("attribute {name} is not valid base64")))
}

/// Requires an AES/CBC cipher spec; every other combination is either not
/// produced by Office for OOXML or deliberately unsupported.
fn check_cipher(element: &BytesStart, key_bits: usize, block_size: usize) -> Result<()> {
    let cipher = attr_string(element, "cipherAlgorithm")?;
    if cipher != "AES" {
        return Err(XlsxCryptoError::Unsupported(format!(
            "cipher algorithm {cipher}"
        )));
    }
    let chaining = attr_string(element, "cipherChaining")?;
    if chaining != "ChainingModeCBC" {
        return Err(XlsxCryptoError::Unsupported(format!(
            "cipher chaining {chaining}"
        )));
    }
    if ![128, 192, 256].contains(&key_bits) {
        return Err(bad(format!("invalid AES key size {key_bits}")));
    }
    if block_size != AES_BLOCK_LEN {
        return Err(bad(format!("invalid AES block size {block_size}")));
    }
    Ok(())
}

fn parse_key_data(element: &BytesStart) -> Result<KeyData> {
    let key_data = KeyData {
        salt_size: attr_usize(element, "saltSize")?,
        block_size: attr_usize(element, "blockSize")?,
        key_bits: attr_usize(element, "keyBits")?,
        hash_size: attr_usize(element, "hashSize")?,
        hash_algorithm: HashAlgorithm::from_name(&attr_string(element, "hashAlgorithm")?)?,
        salt_value: attr_base64(element, "saltValue")?,
    };
    check_cipher(element, key_data.key_bits, key_data.block_size)?;
    if key_data.salt_value.len() != key_data.salt_size {
        return Err(bad("keyData saltValue does not match saltSize"));
    }
    if key_data.hash_size != key_data.hash_algorithm.size() {
        return Err(bad("keyData hashSize does not match hashAlgorithm"));
    }
    Ok(key_data)
}

fn parse_data_integrity(element: &BytesStart) -> Result<DataIntegrity> {
    Ok(DataIntegrity {
        encrypted_hmac_key: attr_base64(element, "encryptedHmacKey")?,
        encrypted_hmac_value: attr_base64(element, "encryptedHmacValue")?,
    })
}

fn parse_encrypted_key(element: &BytesStart) -> Result<PasswordKeyEncryptor> {
    let encryptor = PasswordKeyEncryptor {
        spin_count: attr_u32(element, "spinCount")?,
        salt_size: attr_usize(element, "saltSize")?,
        block_size: attr_usize(element, "blockSize")?,
        key_bits: attr_usize(element, "keyBits")?,
        hash_size: attr_usize(element, "hashSize")?,
        hash_algorithm: HashAlgorithm::from_name(&attr_string(element, "hashAlgorithm")?)?,
        salt_value: attr_base64(element, "saltValue")?,
        encrypted_verifier_hash_input: attr_base64(element, "encryptedVerifierHashInput")?,
        encrypted_verifier_hash_value: attr_base64(element, "encryptedVerifierHashValue")?,
        encrypted_key_value: attr_base64(element, "encryptedKeyValue")?,
    };
    check_cipher(element, encryptor.key_bits, encryptor.block_size)?;
    if encryptor.salt_value.len() != encryptor.salt_size {
        return Err(bad("encryptedKey saltValue does not match saltSize"));
    }
    if encryptor.hash_size != encryptor.hash_algorithm.size() {
        return Err(bad("encryptedKey hashSize does not match hashAlgorithm"));
    }
    if !(1..=MAX_SPIN_COUNT).contains(&encryptor.spin_count) {
        return Err(bad(format!("invalid spinCount {}", encryptor.spin_count)));
    }
    Ok(encryptor)
}

/// Parses the XML descriptor that follows the 8-byte version/flags prefix.
///
/// The document shape is enforced: `encryption` with exactly one `keyData`,
/// one `dataIntegrity` and a `keyEncryptors` sequence whose `keyEncryptor`
/// children must carry password `encryptedKey` elements. A key encryptor of
/// any other kind (e.g. certificate based) is rejected as unsupported.
pub fn parse_descriptor(body: &[u8]) -> Result<AgileEncryptionInfo> {
    let body = body.strip_prefix(b"\xef\xbb\xbf").unwrap_or(body);
    let xml = std::str::from_utf8(body).map_err(|_| bad("descriptor is not UTF-8"))?;

    let mut reader = NsReader::from_str(xml);

    let mut key_data: Option<KeyData> = None;
    let mut data_integrity: Option<DataIntegrity> = None;
    let mut key_encryptor: Option<PasswordKeyEncryptor> = None;
    let mut in_encryption = false;
    let mut in_key_encryptors = false;
    let mut in_key_encryptor = false;

    loop {
        let (resolve, event) = reader
            .read_resolved_event()
            .map_err(|e| bad(e.to_string()))?;
        let (element, is_start) = match &event {
            Event::Start(e) => (e, true),
            Event::Empty(e) => (e, false),
            Event::End(e) => {
                match e.local_name().as_ref() {
                    b"keyEncryptor" => in_key_encryptor = false,
                    b"keyEncryptors" => in_key_encryptors = false,
                    b"encryption" => in_encryption = false,
                    _ => {}
                }
                continue;
            }
            Event::Eof => break,
            Event::Decl(_) | Event::Comment(_) => continue,
            Event::Text(t) if t.iter().all(|b| b.is_ascii_whitespace()) => continue,
            _ => return Err(bad("unexpected XML content")),
        };
        let namespace = match resolve {
            ResolveResult::Bound(Namespace(ns)) => ns,
            _ => return Err(bad("element without namespace")),
        };
        let local = element.local_name();
        let local = local.as_ref();

        if !in_encryption {
            if namespace == NS_ENCRYPTION && local == b"encryption" {
                in_encryption = true;
                continue;
            }
            return Err(bad("root element is not encryption"));
        }

        if in_key_encryptor {
            if namespace == NS_PASSWORD && local == b"encryptedKey" {
                if key_encryptor.is_some() {
                    return Err(bad("more than one password encryptedKey"));
                }
                key_encryptor = Some(parse_encrypted_key(element)?);
            } else {
                warn!(
                    "unsupported key encryptor {}",
                    String::from_utf8_lossy(local)
                );
                return Err(XlsxCryptoError::Unsupported(
                    "non-password key encryptor".to_string(),
                ));
            }
        } else if in_key_encryptors {
            if namespace == NS_ENCRYPTION && local == b"keyEncryptor" {
                if is_start {
                    in_key_encryptor = true;
                }
            } else {
                return Err(bad("unexpected element in keyEncryptors"));
            }
        } else if namespace == NS_ENCRYPTION && local == b"keyData" {
            if key_data.is_some() {
                return Err(bad("more than one keyData"));
            }
            key_data = Some(parse_key_data(element)?);
        } else if namespace == NS_ENCRYPTION && local == b"dataIntegrity" {
            if data_integrity.is_some() {
                return Err(bad("more than one dataIntegrity"));
            }
            data_integrity = Some(parse_data_integrity(element)?);
        } else if namespace == NS_ENCRYPTION && local == b"keyEncryptors" {
            if is_start {
                in_key_encryptors = true;
            }
        } else {
            return Err(bad(format!(
                "unexpected element {}",
                String::from_utf8_lossy(local)
            )));
        }
    }

    let info = AgileEncryptionInfo {
        key_data: key_data.ok_or_else(|| bad("missing keyData"))?,
        data_integrity: data_integrity.ok_or_else(|| bad("missing dataIntegrity"))?,
        key_encryptor: key_encryptor.ok_or(XlsxCryptoError::NoPasswordKey)?,
    };
    debug!(
        spin_count = info.key_encryptor.spin_count,
        key_bits = info.key_data.key_bits,
        hash = ?info.key_encryptor.hash_algorithm,
        "parsed Agile descriptor"
    );
    Ok(info)
}

/// CBC decryption with the alignment check the Agile scheme requires of all
/// its ciphertext fields.
fn cbc_decrypt_aligned(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(XlsxCryptoError::TruncatedCiphertext);
    }
    aes_cbc_decrypt(ciphertext, key, iv)
}

/// Resizes `value` to `len`, padding with `0x36` (MS-OFFCRYPTO truncates
/// long hashes and pads short ones when shaping keys and IVs).
fn fit(mut value: Vec<u8>, len: usize) -> Vec<u8> {
    value.resize(len, 0x36);
    value
}

impl PasswordKeyEncryptor {
    /// `H_spin_count` of §2.3.4.13: the password-and-salt hash iterated with
    /// a little-endian counter.
    fn iterated_hash(&self, password: &str) -> Zeroizing<Vec<u8>> {
        let password = password_utf16le(password);
        let hash_algorithm = self.hash_algorithm;
        let mut hash =
            Zeroizing::new(hash_algorithm.digest(&[&self.salt_value, password.as_slice()]));
        for i in 0..self.spin_count {
            hash = Zeroizing::new(hash_algorithm.digest(&[&i.to_le_bytes(), hash.as_slice()]));
        }
        hash
    }

    /// Derives the subkey for one of the 8-byte block-key constants.
    fn block_key(&self, iterated: &[u8], block_key: &[u8; 8]) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(fit(
            self.hash_algorithm.digest(&[iterated, block_key]),
            self.key_bits / 8,
        ))
    }

    /// The key encryptor IV is the salt itself, shaped to the block size.
    fn iv(&self) -> Vec<u8> {
        fit(self.salt_value.clone(), self.block_size)
    }

    /// Checks the password against the verifier pair and, on success,
    /// unwraps the intermediate package key.
    fn key_from_password(&self, password: &str) -> Result<Zeroizing<Vec<u8>>> {
        let iterated = self.iterated_hash(password);
        let iv = self.iv();

        let input_key = self.block_key(&iterated, &BLOCK_KEY_VERIFIER_INPUT);
        let verifier_input =
            cbc_decrypt_aligned(&self.encrypted_verifier_hash_input, &input_key, &iv)?;
        let calculated = self.hash_algorithm.digest(&[&verifier_input]);

        let value_key = self.block_key(&iterated, &BLOCK_KEY_VERIFIER_HASH);
        let mut expected =
            cbc_decrypt_aligned(&self.encrypted_verifier_hash_value, &value_key, &iv)?;
        expected.truncate(calculated.len());

        if expected != calculated {
            return Err(XlsxCryptoError::BadPassword);
        }
        debug!("Agile password verifier matched");

        let key_key = self.block_key(&iterated, &BLOCK_KEY_KEY_VALUE);
        let mut key = Zeroizing::new(cbc_decrypt_aligned(
            &self.encrypted_key_value,
            &key_key,
            &iv,
        )?);
        if key.len() < self.key_bits / 8 {
            return Err(bad("encryptedKeyValue is shorter than the key size"));
        }
        key.truncate(self.key_bits / 8);
        Ok(key)
    }
}

impl AgileEncryptionInfo {
    /// Derives an IV from the package salt and a block-key constant, shaped
    /// to the cipher block size.
    fn integrity_iv(&self, block_key: &[u8; 8]) -> Vec<u8> {
        let key_data = &self.key_data;
        fit(
            key_data
                .hash_algorithm
                .digest(&[&key_data.salt_value, block_key]),
            key_data.block_size,
        )
    }

    /// Verifies the `dataIntegrity` HMAC over the whole `EncryptedPackage`
    /// stream, size prefix included. A mismatch means the ciphertext was
    /// modified after encryption.
    fn verify_integrity(&self, key: &[u8], encrypted_package: &[u8]) -> Result<()> {
        let hash_algorithm = self.key_data.hash_algorithm;
        let digest_len = hash_algorithm.size();

        let mut hmac_key = Zeroizing::new(cbc_decrypt_aligned(
            &self.data_integrity.encrypted_hmac_key,
            key,
            &self.integrity_iv(&BLOCK_KEY_HMAC_KEY),
        )?);
        if hmac_key.len() < digest_len {
            return Err(bad("encryptedHmacKey is shorter than the hash size"));
        }
        hmac_key.truncate(digest_len);

        let mut expected = cbc_decrypt_aligned(
            &self.data_integrity.encrypted_hmac_value,
            key,
            &self.integrity_iv(&BLOCK_KEY_HMAC_VALUE),
        )?;
        if expected.len() < digest_len {
            return Err(bad("encryptedHmacValue is shorter than the hash size"));
        }
        expected.truncate(digest_len);

        let computed = hash_algorithm.hmac(&hmac_key, encrypted_package)?;
        if computed != expected {
            return Err(XlsxCryptoError::IntegrityCheckFailed);
        }
        debug!("EncryptedPackage HMAC verified");
        Ok(())
    }
}

/// Decrypts an `EncryptedPackage` stream with the Agile scheme.
pub fn decrypt(
    info: &AgileEncryptionInfo,
    encrypted_package: &[u8],
    password: &str,
) -> Result<Vec<u8>> {
    if encrypted_package.len() < PACKAGE_OFFSET {
        return Err(XlsxCryptoError::TruncatedCiphertext);
    }

    let mut key = info.key_encryptor.key_from_password(password)?;
    // The bulk cipher is parameterized by keyData, not by the key encryptor
    key.truncate(info.key_data.key_bits / 8);

    info.verify_integrity(&key, encrypted_package)?;

    let total_size =
        u64::from_le_bytes(encrypted_package[..PACKAGE_OFFSET].try_into().unwrap());
    let ciphertext = &encrypted_package[PACKAGE_OFFSET..];
    let hash_algorithm = info.key_encryptor.hash_algorithm;

    // The per-segment IV hashes the salt with the segment ordinal appended
    // as LE32, exactly saltSize + 4 bytes
    let salt_size = info.key_data.salt_size;
    let mut salt_with_block_key = fit(info.key_data.salt_value.clone(), salt_size + 4);

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    for (segment, segment_ciphertext) in ciphertext.chunks(SEGMENT_LEN).enumerate() {
        salt_with_block_key[salt_size..].copy_from_slice(&(segment as u32).to_le_bytes());
        let iv = fit(
            hash_algorithm.digest(&[&salt_with_block_key]),
            AES_BLOCK_LEN,
        );
        let segment_plaintext = cbc_decrypt_aligned(segment_ciphertext, &key, &iv)?;
        plaintext.extend_from_slice(&segment_plaintext);
    }

    if (plaintext.len() as u64) < total_size {
        return Err(XlsxCryptoError::TruncatedCiphertext);
    }
    plaintext.truncate(total_size as usize);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption" xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
  <keyData saltSize="16" blockSize="16" keyBits="256" hashSize="64" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="SHA512" saltValue="AAECAwQFBgcICQoLDA0ODw=="/>
  <dataIntegrity encryptedHmacKey="AAECAwQFBgcICQoLDA0ODwABAgMEBQYHCAkKCwwNDg8AAQIDBAUGBwgJCgsMDQ4PAAECAwQFBgcICQoLDA0ODw==" encryptedHmacValue="AAECAwQFBgcICQoLDA0ODwABAgMEBQYHCAkKCwwNDg8AAQIDBAUGBwgJCgsMDQ4PAAECAwQFBgcICQoLDA0ODw=="/>
  <keyEncryptors>
    <keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
      <p:encryptedKey spinCount="100000" saltSize="16" blockSize="16" keyBits="256" hashSize="64" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="SHA512" saltValue="AAECAwQFBgcICQoLDA0ODw==" encryptedVerifierHashInput="AAECAwQFBgcICQoLDA0ODw==" encryptedVerifierHashValue="AAECAwQFBgcICQoLDA0ODwABAgMEBQYHCAkKCwwNDg8AAQIDBAUGBwgJCgsMDQ4PAAECAwQFBgcICQoLDA0ODw==" encryptedKeyValue="AAECAwQFBgcICQoLDA0ODwABAgMEBQYHCAkKCwwNDg8="/>
    </keyEncryptor>
  </keyEncryptors>
</encryption>"#;

    #[test]
    fn parses_well_formed_descriptor() {
        let info = parse_descriptor(SAMPLE.as_bytes()).unwrap();
        assert_eq!(info.key_data.key_bits, 256);
        assert_eq!(info.key_data.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(info.key_encryptor.spin_count, 100_000);
        assert_eq!(info.key_encryptor.salt_value, (0u8..16).collect::<Vec<_>>());
        assert_eq!(info.data_integrity.encrypted_hmac_key.len(), 64);
    }

    #[test]
    fn rejects_sha256_hash() {
        let xml = SAMPLE.replace("SHA512", "SHA256").replace(
            "hashSize=\"64\"",
            "hashSize=\"32\"",
        );
        let err = parse_descriptor(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::Unsupported(_)));
    }

    #[test]
    fn rejects_certificate_key_encryptor() {
        let xml = SAMPLE.replace(
            "xmlns:p=\"http://schemas.microsoft.com/office/2006/keyEncryptor/password\"",
            "xmlns:p=\"http://schemas.microsoft.com/office/2006/keyEncryptor/certificate\"",
        );
        let err = parse_descriptor(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::Unsupported(_)));
    }

    #[test]
    fn rejects_empty_key_encryptors() {
        let xml = SAMPLE.replace(
            "<keyEncryptor uri=\"http://schemas.microsoft.com/office/2006/keyEncryptor/password\">",
            "<keyEncryptor uri=\"\">",
        );
        // Still parses: the uri attribute is not what selects the kind
        assert!(parse_descriptor(xml.as_bytes()).is_ok());

        let start = xml.find("<keyEncryptor uri").unwrap();
        let end = xml.find("</keyEncryptors>").unwrap();
        let gutted = format!("{}{}", &xml[..start], &xml[end..]);
        let err = parse_descriptor(gutted.as_bytes()).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::NoPasswordKey));
    }

    #[test]
    fn rejects_missing_salt_attribute() {
        let xml = SAMPLE.replacen("saltValue=\"AAECAwQFBgcICQoLDA0ODw==\" ", "", 1);
        let err = parse_descriptor(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, XlsxCryptoError::BadEncryptionInfo(_)));
    }

    #[test]
    fn rejects_non_xml_body() {
        let err = parse_descriptor(b"\x01\x02\x03").unwrap_err();
        assert!(matches!(err, XlsxCryptoError::BadEncryptionInfo(_)));
    }

    #[test]
    fn iv_shaping_pads_and_truncates() {
        assert_eq!(fit(vec![1, 2, 3], 5), vec![1, 2, 3, 0x36, 0x36]);
        assert_eq!(fit(vec![1, 2, 3], 2), vec![1, 2]);
    }
}
