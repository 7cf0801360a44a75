//! Internal error types
//!
//! These never cross the public API surface: every public operation is
//! total and degrades to a zero/no-op result (the client observes a lost
//! device only through a later `Delete` notification). The enum names the
//! failure kinds so the log sites that swallow them can say what was
//! dropped and why.

use thiserror::Error;

/// Failure kinds of the shim internals
#[derive(Error, Debug)]
pub enum Error {
    /// Operation targeted a unit whose slot is empty
    #[error("no device in slot for unit {0}")]
    NoSuchDevice(i32),

    /// The device path could not be opened
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// The outgoing queue has begun shutting down
    #[error("write queue is shutting down")]
    QueueShutDown,

    /// A read or write syscall failed
    #[error("device I/O failed: {0}")]
    DeviceIo(String),

    /// Enumeration or capability query failed
    #[error("host HID API error: {0}")]
    HostApi(String),
}

impl From<hidapi::HidError> for Error {
    fn from(e: hidapi::HidError) -> Self {
        Error::HostApi(e.to_string())
    }
}
