use std::fmt;
use std::io;

/// Errors surfaced by the container layer.
///
/// A wrong password and a wrong key file both surface as [`Error::BadPassword`];
/// the distinction is deliberately not observable.
#[derive(Debug)]
pub enum Error {
    /// An internal invariant was violated or the API was misused. Not
    /// recoverable or actionable beyond the message.
    Generic(&'static str),

    /// The file does not begin with a KDBX 2.x magic.
    BadSignature((u32, u32)),

    /// The file's major format version is newer than this crate supports.
    UnsupportedVersion(u32),

    /// The outer header could not be parsed or is missing a required field.
    MalformedHeader(&'static str),

    /// The stream start bytes did not match after decryption.
    BadPassword,

    /// A hashed block's SHA-256 did not match its payload.
    IntegrityFailure(&'static str),

    /// A hashed block's index or length was out of range, or the block
    /// stream was truncated.
    CorruptFrame(&'static str),

    /// The inflater or deflater reported a broken stream.
    Compression(&'static str),

    /// An underlying crypto primitive failed.
    Primitive(&'static str),

    /// The XML document handed to a protected-value helper was invalid.
    Xml(&'static str),

    /// An error from the underlying source or sink.
    Io(io::Error),

    /// The allocator refused a request.
    OutOfMemory,

    /// The consumer went away before the stream completed.
    Cancelled,
}

impl Error {
    /// Copy of this error for the in-pipe sentinel while the original is
    /// reported to the runner. Only `Io` carries non-copyable state; its
    /// duplicate preserves the kind and message.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Generic(msg) => Error::Generic(msg),
            Error::BadSignature(sig) => Error::BadSignature(*sig),
            Error::UnsupportedVersion(version) => Error::UnsupportedVersion(*version),
            Error::MalformedHeader(msg) => Error::MalformedHeader(msg),
            Error::BadPassword => Error::BadPassword,
            Error::IntegrityFailure(msg) => Error::IntegrityFailure(msg),
            Error::CorruptFrame(msg) => Error::CorruptFrame(msg),
            Error::Compression(msg) => Error::Compression(msg),
            Error::Primitive(msg) => Error::Primitive(msg),
            Error::Xml(msg) => Error::Xml(msg),
            Error::Io(err) => Error::Io(io::Error::new(err.kind(), err.to_string())),
            Error::OutOfMemory => Error::OutOfMemory,
            Error::Cancelled => Error::Cancelled,
        }
    }

    /// Wrap into an `io::Error` so the value can cross a `std::io` trait
    /// boundary and be recovered on the other side by `Error::from`.
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match &self {
            Error::Io(err) => err.kind(),
            Error::Cancelled => io::ErrorKind::BrokenPipe,
            Error::CorruptFrame(_) => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, self)
    }

    /// True when an `io::Error` is just a wrapped `Error` from `into_io`.
    pub(crate) fn is_wrapped(err: &io::Error) -> bool {
        err.get_ref().map_or(false, |inner| inner.is::<Error>())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        if Error::is_wrapped(&err) {
            match err.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(recovered)) => *recovered,
                _ => Error::Generic("lost an error while unwrapping it"),
            }
        } else {
            Error::Io(err)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Generic(msg) => {
                write!(f, "{}", msg)
            }
            Error::BadSignature(sig) => {
                write!(f, "invalid file signature 0x{:08X}, 0x{:08X}", sig.0, sig.1)
            }
            Error::UnsupportedVersion(version) => {
                write!(f, "unsupported file version 0x{:08X}", version)
            }
            Error::MalformedHeader(msg) => {
                write!(f, "malformed header: {}", msg)
            }
            Error::BadPassword => {
                write!(f, "wrong master key or corrupted file")
            }
            Error::IntegrityFailure(msg) => {
                write!(f, "integrity failure: {}", msg)
            }
            Error::CorruptFrame(msg) => {
                write!(f, "corrupt block frame: {}", msg)
            }
            Error::Compression(msg) => {
                write!(f, "compression error: {}", msg)
            }
            Error::Primitive(msg) => {
                write!(f, "crypto primitive error: {}", msg)
            }
            Error::Xml(msg) => {
                write!(f, "XML error: {}", msg)
            }
            Error::Io(err) => {
                write!(f, "IO error: {}", err)
            }
            Error::OutOfMemory => {
                write!(f, "out of memory")
            }
            Error::Cancelled => {
                write!(f, "stream abandoned before completion")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}
