//! Host-side flashing client for the Odin/Loke firmware download protocol
//!
//! Talks to a phone booted into download mode: claims its CDC-like USB
//! interfaces, replays the line-configuration script, performs the
//! `ODIN`/`LOKE` handshake and then moves partition tables, firmware images
//! and raw chip dumps over the bulk pipe.
//!
//! The transport lives behind the [`bridge::Bridge`] trait; [`port::UsbPort`]
//! implements it on libusb. A [`Session`] brackets the protocol exchanges and
//! carries the transfer operations:
//!
//! ```no_run
//! use std::time::Duration;
//! use odinflash::{session, Session, UsbPort};
//!
//! # fn main() -> odinflash::Result<()> {
//! let mut port = UsbPort::open(Duration::ZERO)?;
//! session::initialise(&mut port)?;
//!
//! let mut session = Session::begin(&mut port)?;
//! let table = session.receive_pit()?;
//! session.end(true)?;
//! # let _ = table;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod error;
mod flash;
mod packet;
pub mod port;
mod ring;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{Error, Result};
pub use port::UsbPort;
pub use session::Session;
pub use types::{ChipType, Destination, DeviceId};
