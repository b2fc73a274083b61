use std::io;

use thiserror::Error;

/// Errors surfaced by the HIP transport.
///
/// Transient conditions (`NoSpace`) are left to the caller's retry/drop policy.
/// Malformed inbound data never reaches a caller: the drains drop the frame and
/// keep going, so `Malformed` is only seen by helpers such as `frame_from_ref`.
#[derive(Debug, Error)]
pub enum HipError {
    #[error("no space: {0}")]
    NoSpace(&'static str),

    #[error("address translation failed: {0}")]
    Translation(String),

    #[error("transport is closing")]
    Closing,

    #[error("invalid state transition: {from} -> {to}")]
    State { from: &'static str, to: &'static str },

    #[error("unsupported peer config version {0}")]
    Version(u32),

    #[error("malformed buffer: {0}")]
    Malformed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("smapper: {0}")]
    Smapper(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type HipResult<T> = Result<T, HipError>;

impl From<HipError> for io::Error {
    fn from(err: HipError) -> Self {
        let kind = match &err {
            HipError::NoSpace(_) => io::ErrorKind::WouldBlock,
            HipError::Translation(_) => io::ErrorKind::AddrNotAvailable,
            HipError::Closing => io::ErrorKind::BrokenPipe,
            HipError::State { .. } => io::ErrorKind::Other,
            HipError::Version(_) | HipError::Malformed(_) => io::ErrorKind::InvalidData,
            HipError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            HipError::Smapper(_) => io::ErrorKind::Other,
            HipError::Io(e) => return io::Error::new(e.kind(), e.to_string()),
        };
        io::Error::new(kind, err.to_string())
    }
}
