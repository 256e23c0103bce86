use thiserror::Error;

/// Classification of everything that can go wrong while decrypting an
/// encrypted OOXML container.
///
/// `BadPassword` is the only kind a caller can recover from (by asking the
/// user again); all other kinds indicate an unsupported, corrupt or tampered
/// file and are terminal.
#[derive(Error, Debug)]
pub enum XlsxCryptoError {
    #[error("input buffer is empty")]
    EmptyInput,

    #[error("not an OLE compound file")]
    NotCompoundFile,

    #[error("required stream {0:?} is missing from the compound file")]
    MissingStream(&'static str),

    #[error("bad EncryptionInfo header")]
    BadHeader,

    #[error("unsupported encryption version {0}.{1}")]
    UnsupportedVersion(u16, u16),

    #[error("extensible encryption is not supported")]
    UnsupportedExtensibleEncryption,

    #[error("encrypted content is not an OOXML document")]
    NotOoxml,

    #[error("invalid cipher algorithm 0x{0:08x}")]
    InvalidCipher(u32),

    #[error("invalid hash algorithm 0x{0:08x}")]
    InvalidHash(u32),

    #[error("invalid provider type 0x{0:08x}")]
    InvalidProviderType(u32),

    #[error("invalid cryptographic service provider {0:?}")]
    InvalidCsp(String),

    #[error("malformed EncryptionInfo: {0}")]
    BadEncryptionInfo(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no password key encryptor present")]
    NoPasswordKey,

    #[error("bad password")]
    BadPassword,

    #[error("encrypted package failed the integrity check")]
    IntegrityCheckFailed,

    #[error("cryptographic primitive failure: {0}")]
    CryptoError(String),

    #[error("ciphertext is truncated or misaligned")]
    TruncatedCiphertext,
}

pub type Result<T> = std::result::Result<T, XlsxCryptoError>;
