//! ## USBTMC Errors
//!
//! The errors used throughout the crate.
//!

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no USBTMC device matches the selector")]
    NotFound,
    #[error("access to the device was denied by the operating system")]
    AccessDenied,
    #[error("device does not expose a USBTMC interface")]
    NotUsbtmc,
    #[error("another operation is in progress on this handle")]
    Busy,
    #[error("transfer did not complete within the configured timeout")]
    IoTimeout,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("device reported status {status:#04x} for class request {request}")]
    DeviceStatusFailed { request: u8, status: u8 },
    #[error("interface is halted; issue a device clear to recover")]
    Halted,
    #[error("operation cancelled by the caller")]
    Cancelled,
    #[error("operation not supported by this device: {0}")]
    Unsupported(&'static str),
    #[error("quirks configuration: {0}")]
    Config(String),
    #[error("USB transfer failed: {0}")]
    Usb(rusb::Error),
}

impl Error {
    /// Build a `ProtocolViolation` that carries the offending header bytes.
    pub(crate) fn bad_header(reason: &str, header: &[u8]) -> Error {
        let bytes = header
            .iter()
            .take(crate::constants::misc::USBTMC_HEADER_SIZE)
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        Error::ProtocolViolation(format!("{reason} (header: {bytes})"))
    }
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Error {
        match err {
            rusb::Error::Timeout => Error::IoTimeout,
            rusb::Error::Access => Error::AccessDenied,
            rusb::Error::NoDevice | rusb::Error::NotFound => Error::NotFound,
            rusb::Error::Busy => Error::Busy,
            other => Error::Usb(other),
        }
    }
}
