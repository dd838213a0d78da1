//! Error types for kdb-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for kdb-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a key file was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFileProblem {
    /// The file has no content at all
    KeyFileEmpty,
    /// The file looked like an XML key file but its payload is unusable
    Malformed,
}

impl std::fmt::Display for KeyFileProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyFileProblem::KeyFileEmpty => write!(f, "key file is empty"),
            KeyFileProblem::Malformed => write!(f, "key file is malformed"),
        }
    }
}

/// Errors that can occur while loading, editing or saving a database
#[derive(Error, Debug)]
pub enum Error {
    /// Bad magic numbers or an unparseable header
    #[error("Invalid database header: {0}")]
    InvalidHeader(String),

    /// The file declares a major version this library cannot read
    #[error("Unsupported database version: {0:#010x}")]
    InvalidVersion(u32),

    /// The key file is empty or malformed
    #[error("Invalid key file: {0}")]
    InvalidKeyFile(KeyFileProblem),

    /// Neither a password nor a key file was supplied
    #[error("No password or key file supplied")]
    EmptyKey,

    /// A v3 password contains characters outside ISO-8859-1
    #[error("Password contains characters that cannot be encoded for this format")]
    UnsupportedPasswordEncoding,

    /// Integrity check failed after decryption.
    ///
    /// The formats cannot tell a wrong password apart from a damaged file.
    #[error("Invalid password, key file, or corrupt database")]
    WrongKeyOrCorruptFile,

    /// The input ended before a complete structure was read
    #[error("Truncated data: {0}")]
    TruncatedData(String),

    /// The flat group list of a v3 file does not describe a tree
    #[error("Inconsistent group tree: {0}")]
    InconsistentTree(String),

    /// Cipher id or flags name an algorithm that is not supported
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// KDF parameters name an algorithm that is not supported
    #[error("Unsupported key derivation function: {0}")]
    UnsupportedKdf(String),

    /// The decrypted XML document is malformed
    #[error("Malformed XML document: {0}")]
    Xml(String),

    /// Writing the temporary file or renaming it over the target failed
    #[error("Failed to save database: {0}")]
    SaveFailed(String),

    /// Entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(uuid::Uuid),

    /// Group not found
    #[error("Group not found: {0}")]
    GroupNotFound(uuid::Uuid),

    /// Invalid entry data
    #[error("Invalid entry data: {0}")]
    InvalidEntry(String),

    /// Invalid group data or an operation that would break the tree
    #[error("Invalid group data: {0}")]
    InvalidGroup(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Stable, inspectable error category handed to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidHeader,
    InvalidVersion,
    InvalidKeyFile,
    EmptyKey,
    InvalidCredentials,
    WrongKeyOrCorruptFile,
    TruncatedData,
    InconsistentTree,
    Unsupported,
    SaveFailed,
    NotFound,
    InvalidData,
    Io,
}

impl Error {
    /// The error category, independent of the detail message
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidHeader(_) | Error::Xml(_) => ErrorKind::InvalidHeader,
            Error::InvalidVersion(_) => ErrorKind::InvalidVersion,
            Error::InvalidKeyFile(_) => ErrorKind::InvalidKeyFile,
            Error::EmptyKey => ErrorKind::EmptyKey,
            Error::UnsupportedPasswordEncoding => ErrorKind::InvalidCredentials,
            Error::WrongKeyOrCorruptFile => ErrorKind::WrongKeyOrCorruptFile,
            Error::TruncatedData(_) => ErrorKind::TruncatedData,
            Error::InconsistentTree(_) => ErrorKind::InconsistentTree,
            Error::UnsupportedCipher(_) | Error::UnsupportedKdf(_) => ErrorKind::Unsupported,
            Error::SaveFailed(_) => ErrorKind::SaveFailed,
            Error::EntryNotFound(_) | Error::GroupNotFound(_) => ErrorKind::NotFound,
            Error::InvalidEntry(_) | Error::InvalidGroup(_) => ErrorKind::InvalidData,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn truncated(what: &str) -> Self {
        Error::TruncatedData(what.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::TruncatedData(err.to_string()),
            _ => Error::Io(err.to_string()),
        }
    }
}

impl From<xml::reader::Error> for Error {
    fn from(err: xml::reader::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

impl From<xml::writer::Error> for Error {
    fn from(err: xml::writer::Error) -> Self {
        Error::Xml(err.to_string())
    }
}
