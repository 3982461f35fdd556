//! Error taxonomy for the Cask engine
//!
//! Every failure is reported to the caller synchronously; nothing is
//! downgraded or retried internally. Each error maps to a stable numeric
//! code so embedders and tools can report failures without string matching.

use thiserror::Error;

use crate::bjson::CodecError;
use crate::index::KeyKind;

/// Numeric error codes exposed to embedders and used as process exit codes
/// by the bundled tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Operation completed successfully
    Ok = 0,
    /// Device or permission failure
    Io = 1,
    /// Container file failed structural validation
    CorruptFile = 2,
    /// Value graph contains itself
    CyclicValue = 3,
    /// Value kind cannot be encoded in this context
    UnencodableValue = 4,
    /// No constructor registered for a class tag
    UnknownType = 5,
    /// Key does not match the index key kind
    KeyTypeMismatch = 6,
    /// Index belongs to a different container
    ForeignIndexReference = 7,
    /// Container already closed
    ContainerClosed = 8,
    /// Another session holds the container lock
    Locked = 9,
    /// Write attempted through a read-only session
    ReadOnly = 10,

    /// Unknown error code
    Unknown = 65535,
}

impl ErrorCode {
    /// Create an ErrorCode from a raw u16 value
    pub fn from_raw(code: u16) -> Self {
        match code {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Io,
            2 => ErrorCode::CorruptFile,
            3 => ErrorCode::CyclicValue,
            4 => ErrorCode::UnencodableValue,
            5 => ErrorCode::UnknownType,
            6 => ErrorCode::KeyTypeMismatch,
            7 => ErrorCode::ForeignIndexReference,
            8 => ErrorCode::ContainerClosed,
            9 => ErrorCode::Locked,
            10 => ErrorCode::ReadOnly,
            _ => ErrorCode::Unknown,
        }
    }

    /// Get the raw code value
    pub fn as_raw(&self) -> u16 {
        *self as u16
    }

    /// Check if this is a success code
    pub fn is_ok(&self) -> bool {
        matches!(self, ErrorCode::Ok)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_raw(), match self {
            ErrorCode::Ok => "Ok",
            ErrorCode::Io => "I/O error",
            ErrorCode::CorruptFile => "Corrupt container file",
            ErrorCode::CyclicValue => "Cyclic value",
            ErrorCode::UnencodableValue => "Unencodable value",
            ErrorCode::UnknownType => "Unknown class tag",
            ErrorCode::KeyTypeMismatch => "Key type mismatch",
            ErrorCode::ForeignIndexReference => "Foreign index reference",
            ErrorCode::ContainerClosed => "Container closed",
            ErrorCode::Locked => "Container locked",
            ErrorCode::ReadOnly => "Read-only session",
            ErrorCode::Unknown => "Unknown",
        })
    }
}

/// Main error type for the Cask engine
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt container file: {0}")]
    CorruptFile(String),

    #[error("value graph contains a cycle")]
    CyclicValue,

    #[error("value cannot be encoded: {0}")]
    UnencodableValue(String),

    #[error("no constructor registered for class '{0}'")]
    UnknownType(String),

    #[error("key kind mismatch: index holds {expected} keys, got {actual}")]
    KeyTypeMismatch { expected: KeyKind, actual: KeyKind },

    #[error("index belongs to a different container")]
    ForeignIndexReference,

    #[error("container is closed")]
    ContainerClosed,

    #[error("container file is locked by another session")]
    Locked,

    #[error("container was opened read-only")]
    ReadOnly,
}

impl StorageError {
    /// Get the numeric error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::Io(_) => ErrorCode::Io,
            StorageError::CorruptFile(_) => ErrorCode::CorruptFile,
            StorageError::CyclicValue => ErrorCode::CyclicValue,
            StorageError::UnencodableValue(_) => ErrorCode::UnencodableValue,
            StorageError::UnknownType(_) => ErrorCode::UnknownType,
            StorageError::KeyTypeMismatch { .. } => ErrorCode::KeyTypeMismatch,
            StorageError::ForeignIndexReference => ErrorCode::ForeignIndexReference,
            StorageError::ContainerClosed => ErrorCode::ContainerClosed,
            StorageError::Locked => ErrorCode::Locked,
            StorageError::ReadOnly => ErrorCode::ReadOnly,
        }
    }
}

impl From<CodecError> for StorageError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Cyclic => StorageError::CyclicValue,
            CodecError::Unencodable(what) => StorageError::UnencodableValue(what),
            CodecError::UnknownType(name) => StorageError::UnknownType(name),
            CodecError::ForeignIndex => StorageError::ForeignIndexReference,
            CodecError::Truncated => {
                StorageError::CorruptFile("truncated value data".into())
            }
            CodecError::Malformed(detail) => StorageError::CorruptFile(detail),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
