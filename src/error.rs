
//! Error type returned by all fallible operations in this crate.

/// A result that may contain an hfa error.
pub type Result<T> = std::result::Result<T, Error>;

/// A result that, if ok, contains nothing, and otherwise contains an hfa error.
pub type UnitResult = Result<()>;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;


/// All possible errors produced while reading or writing a file.
/// Every failure is surfaced at the operation boundary;
/// panics are reserved for invariant violations on already validated data.
#[derive(Debug)]
pub enum Error {

    /// A named child node or a named field does not exist.
    NotFound(String),

    /// A buffer or file region is shorter than the declared field or item demands.
    Truncated(String),

    /// The embedded data dictionary text violates the grammar.
    MalformedDictionary(String),

    /// An unknown primitive or base data item type code.
    BadType(String),

    /// An index at or beyond the instance count,
    /// or an enumeration value outside the name list.
    OutOfRange(String),

    /// A write would extend a fixed size buffer.
    /// The caller must reallocate the node payload and retry.
    TooLarge(String),

    /// A run length stream that cannot be decoded.
    BadCompression(String),

    /// The operation is deliberately not supported.
    NotSupported(String),

    /// An error of the underlying byte stream.
    /// This error can also occur when reading truncated files,
    /// where the number of bytes to read exceeds the input stream length.
    Io(IoError),
}


impl Error {

    /// Create an error describing a missing child node or field.
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    /// Create an error describing a buffer that ended too early.
    pub fn truncated(message: impl Into<String>) -> Self {
        Error::Truncated(message.into())
    }

    /// Create an error describing invalid dictionary text.
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedDictionary(message.into())
    }

    /// Create an error describing an unknown type code.
    pub fn bad_type(message: impl Into<String>) -> Self {
        Error::BadType(message.into())
    }

    /// Create an error describing an index beyond the instance count.
    pub fn out_of_range(message: impl Into<String>) -> Self {
        Error::OutOfRange(message.into())
    }

    /// Create an error describing a write beyond the allocated payload.
    pub fn too_large(message: impl Into<String>) -> Self {
        Error::TooLarge(message.into())
    }

    /// Create an error describing an undecodable run length stream.
    pub fn bad_compression(message: impl Into<String>) -> Self {
        Error::BadCompression(message.into())
    }

    /// Create an error describing a deliberately unsupported operation.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::NotSupported(message.into())
    }
}


/// Enable using the `?` operator on `io::Result`.
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::Io(error)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(message) => write!(formatter, "not found: {}", message),
            Error::Truncated(message) => write!(formatter, "truncated: {}", message),
            Error::MalformedDictionary(message) => write!(formatter, "malformed dictionary: {}", message),
            Error::BadType(message) => write!(formatter, "bad type: {}", message),
            Error::OutOfRange(message) => write!(formatter, "out of range: {}", message),
            Error::TooLarge(message) => write!(formatter, "too large: {}", message),
            Error::BadCompression(message) => write!(formatter, "bad compression: {}", message),
            Error::NotSupported(message) => write!(formatter, "not supported: {}", message),
            Error::Io(error) => write!(formatter, "io error: {}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}
