use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error taxonomy for everything touching the wire. `Wait` marks a
/// benign would-block condition that terminates the current drain or
/// readiness cycle; `Fatal` marks conditions after which the endpoint is no
/// longer usable, plus synchronous misuse.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// The stream reached end-of-file, broke mid-write or reported
    /// exceptional readiness. Every later operation fails with this.
    ConnectionLost,
    /// A length prefix above the configured cap, on either direction.
    FrameTooLarge,
    /// A frame too short to carry the 16-byte vector header.
    TruncatedFrame,
    /// `IoMode::Callback` was requested without a callback.
    CallbackRequired,
    /// The endpoint was used after `close`.
    Closed,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}
