//! Crate-wide error type
//!
//! Errors fall into four families: enumeration failures (nothing usable on
//! the bus), transport failures (a USB transfer went wrong), protocol
//! violations (the device answered, but not with what the current operation
//! expects) and caller errors, which are rejected before any I/O. Protocol
//! violations abandon the current operation but leave the USB handle usable,
//! so a session end can still be attempted.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// No attached device matched the supported vendor/product table, or the
    /// matched device did not expose the expected interfaces.
    #[error("no supported device detected")]
    DeviceNotDetected,

    #[error("USB transfer failed: {0}")]
    Usb(#[from] rusb::Error),

    /// A bulk-out transfer moved fewer bytes than the frame holds.
    #[error("short bulk transfer: sent {sent} of {len} bytes")]
    ShortTransfer { sent: usize, len: usize },

    /// The receive deadline expired before a full frame arrived.
    #[error("timed out waiting for {wanted} bytes")]
    Timeout { wanted: usize },

    /// The device did not answer the handshake with `LOKE`.
    #[error("handshake failed: expected \"LOKE\", received {received:02X?}")]
    Handshake { received: [u8; 4] },

    /// A response frame carried the wrong type code for the pending
    /// operation.
    #[error("unexpected response type {received:#04x} (expected {expected:#04x})")]
    UnexpectedResponse { expected: u32, received: u32 },

    #[error("unexpected session setup response {0}")]
    UnexpectedSessionValue(u32),

    #[error("unknown device type {0}")]
    UnknownDeviceType(u32),

    /// The device acknowledged a different file part than the one just sent.
    #[error("file part index mismatch: sent {sent}, device acknowledged {received}")]
    PartIndexMismatch { sent: u32, received: u32 },

    #[error("the modem image does not take a file identifier")]
    ModemFileIdentifier,

    #[error("uploading to a phone partition requires a file identifier")]
    MissingFileIdentifier,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
