//! Error types shared across the stack

use thiserror::Error;

/// Reasons a received header fails to decode.
///
/// A decode error never propagates past the layer that produced it: the frame
/// is dropped and the matching counter in [`crate::Stats`] is bumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("checksum mismatch")]
    Checksum,

    #[error("unsupported version {0}")]
    Version(u8),

    #[error("malformed header: {0}")]
    Malformed(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Errors surfaced to applications through the socket interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("no such socket")]
    UnknownSocket,

    #[error("address already in use")]
    AddressInUse,

    #[error("no ephemeral port available")]
    PortsExhausted,

    #[error("address family not configured on this interface")]
    AddressFamily,

    #[error("connection reset by peer")]
    Reset,

    #[error("connection timed out")]
    TimedOut,

    #[error("destination unreachable")]
    Unreachable,

    #[error("connection is closing")]
    Closing,

    #[error("operation not valid in state {0}")]
    InvalidState(&'static str),

    #[error("connection table full")]
    TableFull,

    #[error("datagram too large")]
    MessageTooLarge,

    #[error("stack event loop has stopped")]
    StackGone,
}

pub type SocketResult<T> = std::result::Result<T, SocketError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds device MTU")]
    FrameTooLarge(usize),
}

impl DeviceError {
    /// Whether the device is unusable from now on. Anything else costs at
    /// most the frame in hand.
    pub fn is_fatal(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            DeviceError::FrameTooLarge(_) => false,
            DeviceError::Io(err) => !matches!(
                err.kind(),
                ErrorKind::WouldBlock
                    | ErrorKind::Interrupted
                    | ErrorKind::TimedOut
                    | ErrorKind::OutOfMemory
                    | ErrorKind::InvalidInput
                    | ErrorKind::InvalidData
            ),
        }
    }
}
