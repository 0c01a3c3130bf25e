use std::{fmt, io};

/// Errors produced by the wire codec and the discovery engine.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// The end of the message was reached while more data was expected.
    Eof,
    /// A domain name pointer pointed into itself or further into the message, or a name used
    /// too many pointer hops.
    PointerLoop,
    /// A field was set to an invalid (reserved for future use or illegal) value.
    InvalidValue,
    /// The encoded message does not fit into an mDNS packet.
    Truncated,
    /// An empty label was encountered where it is not allowed.
    InvalidEmptyLabel,
    /// A label exceeded the maximum allowable length of a label.
    LabelTooLong,
    /// A domain name exceeded 255 bytes in wire form.
    NameTooLong,
    /// A service type did not match the `_service._proto` grammar.
    InvalidServiceType,
    /// No answer was received before the resolution deadline or the query retry limit.
    ResolutionTimeout,
    /// The service announced its departure while it was being resolved.
    ServiceWithdrawn,
    /// A socket operation failed.
    Socket(io::ErrorKind),
    /// The engine's event loop is no longer running.
    EngineStopped,
    /// A blocking engine operation was invoked from a notifier callback.
    ReentrantCall,
}

/// Coarse classification of an [`Error`], as reported to a [`HostNotifier`].
///
/// [`HostNotifier`]: crate::engine::HostNotifier
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ErrorKind {
    MalformedMessage,
    InvalidServiceType,
    ResolutionTimeout,
    ServiceWithdrawn,
    SocketError,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Eof
            | Error::PointerLoop
            | Error::InvalidValue
            | Error::Truncated
            | Error::InvalidEmptyLabel
            | Error::LabelTooLong
            | Error::NameTooLong => ErrorKind::MalformedMessage,
            Error::InvalidServiceType => ErrorKind::InvalidServiceType,
            Error::ResolutionTimeout => ErrorKind::ResolutionTimeout,
            Error::ServiceWithdrawn => ErrorKind::ServiceWithdrawn,
            Error::Socket(_) => ErrorKind::SocketError,
            Error::EngineStopped | Error::ReentrantCall => ErrorKind::Internal,
        }
    }

    fn description(&self) -> &str {
        match self {
            Error::Eof => "unexpected end of data",
            Error::PointerLoop => "encountered domain name pointer loop",
            Error::InvalidValue => "invalid value",
            Error::Truncated => "message too large",
            Error::InvalidEmptyLabel => "invalid empty label",
            Error::LabelTooLong => "label too long",
            Error::NameTooLong => "domain name too long",
            Error::InvalidServiceType => "invalid service type",
            Error::ResolutionTimeout => "service resolution timed out",
            Error::ServiceWithdrawn => "service was withdrawn",
            Error::Socket(_) => "socket error",
            Error::EngineStopped => "discovery engine is not running",
            Error::ReentrantCall => "blocking call from inside a notifier callback",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Socket(kind) => write!(f, "{}: {}", self.description(), kind),
            _ => f.write_str(self.description()),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Socket(e.kind())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Eof => io::ErrorKind::UnexpectedEof.into(),
            Error::PointerLoop => io::Error::new(
                io::ErrorKind::InvalidData,
                "a domain name pointer loop was encountered; this may indicate a malicious packet",
            ),
            Error::InvalidValue | Error::NameTooLong => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            Error::InvalidEmptyLabel | Error::LabelTooLong | Error::InvalidServiceType => {
                io::Error::new(io::ErrorKind::InvalidInput, e)
            }
            Error::Truncated => io::Error::new(io::ErrorKind::InvalidInput, e),
            Error::ResolutionTimeout => io::Error::new(io::ErrorKind::TimedOut, e),
            Error::ServiceWithdrawn => io::Error::new(io::ErrorKind::NotFound, e),
            Error::Socket(kind) => kind.into(),
            Error::EngineStopped => io::Error::new(io::ErrorKind::BrokenPipe, e),
            Error::ReentrantCall => io::Error::new(io::ErrorKind::WouldBlock, e),
        }
    }
}
