//! ECMA-376 *Standard Encryption*: binary `EncryptionInfo` descriptor,
//! SHA-1 spin-count key derivation and AES-ECB bulk decryption.

use crate::crypto::primitives::{aes_ecb_decrypt, AES_BLOCK_LEN};
use crate::error::{Result, XlsxCryptoError};
use crate::util::password_utf16le;
use sha1::{Digest, Sha1};
use tracing::debug;
use zeroize::Zeroizing;

const SPIN_COUNT: u32 = 50_000;
const SHA1_LEN: usize = 20;
const PACKAGE_OFFSET: usize = 8;

/// AlgID values that select AES (CALG_AES_128/192/256, or 0 for "use flags").
const AES_ALG_IDS: [u32; 4] = [0, 0x0000_660e, 0x0000_660f, 0x0000_6610];
/// AlgIDHash values that select SHA-1 (CALG_SHA1, or 0 for "use flags").
const SHA1_ALG_IDS: [u32; 2] = [0, 0x0000_8004];
/// ProviderType values for the AES CSP (PROV_RSA_AES, or 0).
const AES_PROVIDER_TYPES: [u32; 2] = [0, 0x0000_0018];

const ALLOWED_CSP_NAMES: [&str; 2] = [
    "Microsoft Enhanced RSA and AES Cryptographic Provider",
    "Microsoft Enhanced RSA and AES Cryptographic Provider (Prototype)",
];

/// Parsed body of a Standard `EncryptionInfo` stream.
///
/// Cipher, hash and spin count are fixed by the scheme (AES, SHA-1, 50000);
/// only the key size and the salt/verifier material vary per file.
#[derive(Debug)]
pub struct StandardEncryptionInfo {
    pub key_bits: u32,
    pub key_bytes: usize,
    pub salt: Vec<u8>,
    pub verifier_hash_input: Vec<u8>,
    pub verifier_hash_size: usize,
    pub verifier_hash_value: Vec<u8>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| truncated())?;
        self.pos += len;
        Ok(slice)
    }
}

fn truncated() -> XlsxCryptoError {
    XlsxCryptoError::BadEncryptionInfo("truncated Standard descriptor".to_string())
}

/// Parses the binary descriptor that follows the 8-byte version/flags prefix.
pub fn parse_descriptor(body: &[u8]) -> Result<StandardEncryptionInfo> {
    let mut cursor = Cursor::new(body);

    let header_length = cursor.u32()? as usize;
    let header_start = cursor.pos;
    let _skip_flags = cursor.u32()?;
    let _size_extra = cursor.u32()?;

    let alg_id = cursor.u32()?;
    if !AES_ALG_IDS.contains(&alg_id) {
        return Err(XlsxCryptoError::InvalidCipher(alg_id));
    }

    let alg_id_hash = cursor.u32()?;
    if !SHA1_ALG_IDS.contains(&alg_id_hash) {
        return Err(XlsxCryptoError::InvalidHash(alg_id_hash));
    }

    let key_bits = cursor.u32()?;
    let expected_bits: &[u32] = match alg_id {
        0x0000_660e => &[128],
        0x0000_660f => &[192],
        0x0000_6610 => &[256],
        _ => &[128, 192, 256],
    };
    if !expected_bits.contains(&key_bits) {
        return Err(XlsxCryptoError::BadEncryptionInfo(format!(
            "key size {key_bits} does not fit AlgID 0x{alg_id:08x}"
        )));
    }

    let provider_type = cursor.u32()?;
    if !AES_PROVIDER_TYPES.contains(&provider_type) {
        return Err(XlsxCryptoError::InvalidProviderType(provider_type));
    }

    let _reserved1 = cursor.u32()?;
    if cursor.u32()? != 0 {
        // Reserved2 must be zero
        return Err(XlsxCryptoError::BadHeader);
    }

    // The CSP name fills the rest of the header: UTF-16LE, null terminated
    let csp_name_length = header_length
        .checked_sub(cursor.pos - header_start)
        .ok_or_else(|| truncated())?;
    if csp_name_length < 2 || csp_name_length % 2 != 0 {
        return Err(truncated());
    }
    let csp_units: Vec<u16> = cursor
        .bytes(csp_name_length)?
        .chunks_exact(2)
        .map(|v| u16::from_le_bytes(v.try_into().unwrap()))
        .collect();
    let csp_name = String::from_utf16(&csp_units[..csp_units.len() - 1])
        .map_err(|_| XlsxCryptoError::BadEncryptionInfo("CSP name is not UTF-16".to_string()))?;
    if !ALLOWED_CSP_NAMES.contains(&csp_name.as_str()) {
        return Err(XlsxCryptoError::InvalidCsp(csp_name));
    }

    let salt_size = cursor.u32()? as usize;
    let salt = cursor.bytes(salt_size)?.to_vec();
    let verifier_hash_input = cursor.bytes(AES_BLOCK_LEN)?.to_vec();
    let verifier_hash_size = cursor.u32()? as usize;
    if verifier_hash_size != SHA1_LEN {
        return Err(XlsxCryptoError::BadEncryptionInfo(format!(
            "verifier hash size {verifier_hash_size} is not a SHA-1 digest"
        )));
    }
    // The encrypted hash is stored padded to whole AES blocks: 32 bytes
    let verifier_hash_value = cursor.bytes(SHA1_LEN.next_multiple_of(AES_BLOCK_LEN))?.to_vec();

    debug!(key_bits, alg_id, csp = %csp_name, "parsed Standard descriptor");

    Ok(StandardEncryptionInfo {
        key_bits,
        key_bytes: key_bits as usize / 8,
        salt,
        verifier_hash_input,
        verifier_hash_size,
        verifier_hash_value,
    })
}

impl StandardEncryptionInfo {
    /// MS-OFFCRYPTO 2.3.4.7: iterated SHA-1 over the salted password, then
    /// the 0x36/0x5C expansion, truncated to the key size.
    fn derive_key(&self, password: &str) -> Zeroizing<Vec<u8>> {
        let password = password_utf16le(password);

        let mut sha1 = Sha1::new();
        sha1.update(&self.salt);
        sha1.update(password.as_slice());
        let mut hash = Zeroizing::new([0u8; SHA1_LEN]);
        sha1.finalize_into_reset((&mut *hash).into());

        // The iteration counter is serialized as LE32 every round; the
        // result must not depend on host endianness
        for i in 0..SPIN_COUNT {
            sha1.update(i.to_le_bytes());
            sha1.update(hash.as_slice());
            sha1.finalize_into_reset((&mut *hash).into());
        }

        sha1.update(hash.as_slice());
        sha1.update(0u32.to_le_bytes());
        sha1.finalize_into_reset((&mut *hash).into());

        let mut buf = [0x36u8; 64];
        for (b, h) in buf.iter_mut().zip(hash.iter()) {
            *b ^= h;
        }
        sha1.update(buf);
        let mut x1 = [0u8; SHA1_LEN];
        sha1.finalize_into_reset((&mut x1).into());

        let mut buf = [0x5cu8; 64];
        for (b, h) in buf.iter_mut().zip(hash.iter()) {
            *b ^= h;
        }
        sha1.update(buf);
        let mut x2 = [0u8; SHA1_LEN];
        sha1.finalize_into((&mut x2).into());

        let mut key = Zeroizing::new(Vec::with_capacity(2 * SHA1_LEN));
        key.extend_from_slice(&x1);
        key.extend_from_slice(&x2);
        key.truncate(self.key_bytes);
        key
    }

    /// Decrypts the verifier pair and checks `SHA1(input)` against the
    /// stored hash.
    fn verify_key(&self, key: &[u8]) -> Result<bool> {
        let verifier = aes_ecb_decrypt(&self.verifier_hash_input, key)?;
        let computed = Sha1::digest(&verifier);
        let decrypted_hash = aes_ecb_decrypt(&self.verifier_hash_value, key)?;
        Ok(decrypted_hash[..self.verifier_hash_size] == computed[..])
    }
}

/// Decrypts an `EncryptedPackage` stream with the Standard scheme.
pub fn decrypt(
    info: &StandardEncryptionInfo,
    encrypted_package: &[u8],
    password: &str,
) -> Result<Vec<u8>> {
    if encrypted_package.len() < PACKAGE_OFFSET {
        return Err(XlsxCryptoError::TruncatedCiphertext);
    }

    let key = info.derive_key(password);
    if !info.verify_key(&key)? {
        return Err(XlsxCryptoError::BadPassword);
    }
    debug!(key_bits = info.key_bits, "Standard password verifier matched");

    let total_size = u64::from_le_bytes(encrypted_package[..PACKAGE_OFFSET].try_into().unwrap());
    let mut plaintext = aes_ecb_decrypt(&encrypted_package[PACKAGE_OFFSET..], &key)?;
    if (plaintext.len() as u64) < total_size {
        return Err(XlsxCryptoError::TruncatedCiphertext);
    }
    plaintext.truncate(total_size as usize);
    Ok(plaintext)
}
