use crate::compress::CompressionError;
use crate::key::Key;
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// Occurs when a varint, block header, stanza, or delta instruction can't be parsed. Always
    /// fatal to the single operation that hit it.
    Format(String),
    /// Occurs when decoded data contradicts what was declared about it: a decompressed length
    /// mismatch, a digest mismatch, or an index entry pointing at a missing or mismatched block
    /// entry.
    Corruption(String),
    /// The requested key isn't present. Callers probing for existence should expect this.
    NotFound(Key),
    /// A key didn't have the right number of parts, or one of its parts was empty or contained a
    /// reserved byte.
    InvalidKey(String),
    /// A key was added twice to the same compression group or block.
    DuplicateKey(Key),
    /// The content's digest matched the `nostore_sha` given to an add call.
    ExistingContent(Key),
    /// Lines passed to `add_lines` weren't correctly split.
    InvalidLines { key: Key, line: usize },
    /// A write group is already open on this store.
    WriteGroupActive,
    /// An earlier failure left the write group unable to commit. It can only be aborted.
    WriteGroupFailed(String),
    /// No store factory is registered under the requested name.
    UnknownFormat(String),
    /// Failure within zlib or zstd.
    Compression(CompressionError),
    /// Index nodes failed to serialize or deserialize.
    Serde(String),
    /// I/O failure against the backing directory. Never reinterpreted as corruption.
    Io(std::io::Error),
}

impl Error {
    /// True for corruption failures, the class an inconsistency-tolerant store reports and skips.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Format(ref err) => write!(f, "Bad format: {}", err),
            Error::Corruption(ref err) => write!(f, "Corrupt data: {}", err),
            Error::NotFound(ref key) => write!(f, "Key {} is not present", key),
            Error::InvalidKey(ref err) => write!(f, "Invalid key: {}", err),
            Error::DuplicateKey(ref key) => {
                write!(f, "Key {} was added more than once to the same group", key)
            }
            Error::ExistingContent(ref key) => {
                write!(f, "Content for key {} is already stored", key)
            }
            Error::InvalidLines { ref key, line } => write!(
                f,
                "Line {} of key {} is not a correctly split line",
                line, key
            ),
            Error::WriteGroupActive => f.write_str("A write group is already active on this store"),
            Error::WriteGroupFailed(ref err) => {
                write!(f, "Write group can only be aborted after an earlier failure: {}", err)
            }
            Error::UnknownFormat(ref name) => write!(f, "No store format registered as {:?}", name),
            Error::Compression(ref err) => write!(f, "Compression failure: {}", err),
            Error::Serde(ref msg) => f.write_str(msg),
            Error::Io(ref err) => write!(f, "I/O failure: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Compression(ref err) => Some(err),
            Error::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl std::convert::From<CompressionError> for Error {
    fn from(e: CompressionError) -> Self {
        Self::Compression(e)
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::convert::From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e.to_string())
    }
}
