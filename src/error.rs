//! Error types for the usbuart crate.

use nix::errno::Errno;

/// The error type for all engine operations.
///
/// Each variant corresponds to one engine error code; [`Error::code`]
/// returns the code as a negative integer for embedders that work with the
/// numeric convention (C-style bindings, logging).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The context has no more live channels; the event loop may stop.
    #[error("no live channels")]
    NoChannels,

    /// The operation is not implemented for this device.
    #[error("not implemented")]
    NotImplemented,

    /// Invalid parameter passed to the API.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// No channel matches the given descriptor pair.
    #[error("no such channel")]
    NoChannel,

    /// Access to the device was denied.
    #[error("access denied")]
    NoAccess,

    /// No registered driver accepts the device.
    #[error("device not supported")]
    NotSupported,

    /// The requested device does not exist.
    #[error("device not found")]
    NoDevice,

    /// The requested interface does not exist on the device.
    #[error("interface not found")]
    NoInterface,

    /// The interface is claimed by another driver or process.
    #[error("interface busy")]
    InterfaceBusy,

    /// The USB backend library failed.
    #[error("USB backend error: {0}")]
    Backend(String),

    /// A USB-level operation failed.
    #[error("USB error: {0}")]
    Usb(String),

    /// The device misbehaved at the hardware level.
    #[error("device error: {0}")]
    Device(String),

    /// The requested baud rate is not achievable on this device.
    #[error("unsupported baud rate {0}")]
    BadBaudrate(u32),

    /// The device returned an unexpected value while probing.
    #[error("probe mismatch")]
    ProbeMismatch,

    /// A control transfer failed.
    #[error("control transfer error: {0}")]
    Control(String),

    /// I/O error on an attached descriptor.
    #[error("i/o error: {0}")]
    Io(Errno),

    /// `fcntl` failed on an attached descriptor.
    #[error("fcntl error: {0}")]
    Fcntl(Errno),

    /// `poll` returned `EINVAL`.
    #[error("poll error")]
    Poll,

    /// Creating a pipe pair failed.
    #[error("pipe error: {0}")]
    Pipe(Errno),

    /// Memory allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Unclassified failure.
    #[error("unknown error")]
    Unknown,
}

impl Error {
    /// The numeric error code, negated, matching the engine's integer
    /// return-value convention (`0` is success, so codes start at `-1`).
    pub fn code(&self) -> i32 {
        -match self {
            Error::NoChannels => 1,
            Error::NotImplemented => 2,
            Error::InvalidParam(_) => 3,
            Error::NoChannel => 4,
            Error::NoAccess => 5,
            Error::NotSupported => 6,
            Error::NoDevice => 7,
            Error::NoInterface => 8,
            Error::InterfaceBusy => 9,
            Error::Backend(_) => 10,
            Error::Usb(_) => 11,
            Error::Device(_) => 12,
            Error::BadBaudrate(_) => 13,
            Error::ProbeMismatch => 14,
            Error::Control(_) => 15,
            Error::Io(_) => 16,
            Error::Fcntl(_) => 17,
            Error::Poll => 18,
            Error::Pipe(_) => 19,
            Error::OutOfMemory => 20,
            Error::Unknown => 21,
        }
    }
}

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
