use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by a notification handle.
///
/// Kernel errors are translated into this taxonomy at the call that caused
/// them. The only outcomes that are deliberately swallowed are signal
/// interruption during a wait (retried against the caller's deadline) and a
/// descriptor that disappeared before `unregister` ran.
#[derive(Debug)]
pub enum Error {
    /// The kernel could not create, wait on, or otherwise service the
    /// notification object.
    Resource(io::Error),
    /// The descriptor is negative, closed, or of a type the backend
    /// rejects.
    InvalidDescriptor { fd: RawFd, source: io::Error },
    /// The descriptor already holds a registration.
    AlreadyRegistered { fd: RawFd },
    /// No registration exists for the descriptor.
    NotRegistered { fd: RawFd },
    /// An empty interest mask was passed to a registration call.
    EmptyInterest { fd: RawFd },
    /// The handle was closed and can no longer be operated on.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Resource(err) => write!(f, "kernel notification failure: {}", err),
            Error::InvalidDescriptor { fd, source } => {
                write!(f, "invalid descriptor {}: {}", fd, source)
            }
            Error::AlreadyRegistered { fd } => {
                write!(f, "descriptor {} is already registered", fd)
            }
            Error::NotRegistered { fd } => write!(f, "descriptor {} is not registered", fd),
            Error::EmptyInterest { fd } => {
                write!(f, "empty interest mask for descriptor {}", fd)
            }
            Error::Closed => write!(f, "I/O operation on closed notification handle"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Resource(err) => Some(err),
            Error::InvalidDescriptor { source, .. } => Some(source),
            _ => None,
        }
    }
}
