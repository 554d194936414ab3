//! Interface between the protocol layers and the USB transport
//!
//! [`Bridge`] is what the handshake, session and transfer code talk to. The
//! one real implementation is [`crate::port::UsbPort`]; keeping the protocol
//! generic over this trait means every exchange can also be driven against a
//! scripted implementation in tests, without a device on the bus.

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::types::Endpoints;

/// Number of event pumps (at one-millisecond spacing) in the settle pause.
///
/// Matches the ~500 ms gap the stock flasher leaves between line
/// configuration and the first handshake bytes. Shortening it has broken
/// devices in the field.
const SETTLE_TICKS: u32 = 500;

/// One synchronous control transfer on the default pipe.
///
/// The direction bit of `request_type` decides what happens in the data
/// stage: host-to-device requests send `data`, device-to-host requests read
/// (and discard) `read_len` bytes.
pub struct ControlRequest<'a> {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: &'a [u8],
    pub read_len: usize,
    /// Treat an endpoint stall as success. The device implements the CDC
    /// control requests loosely and stalls on several of them.
    pub pipe_ok: bool,
}

impl<'a> ControlRequest<'a> {
    /// A host-to-device request carrying `data`.
    pub fn out(request_type: u8, request: u8, value: u16, index: u16, data: &'a [u8]) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            data,
            read_len: 0,
            pipe_ok: false,
        }
    }

    /// A device-to-host request reading `read_len` bytes.
    pub fn read(request_type: u8, request: u8, value: u16, index: u16, read_len: usize) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            data: &[],
            read_len,
            pipe_ok: false,
        }
    }

    pub fn tolerate_stall(mut self) -> Self {
        self.pipe_ok = true;
        self
    }
}

/// Transport seam between the protocol engine and the USB port.
pub trait Bridge {
    /// Endpoint addresses and interface numbers captured at enumeration.
    fn endpoints(&self) -> &Endpoints;

    /// Issue one synchronous control transfer. Blocks without limit.
    fn control(&mut self, request: &ControlRequest<'_>) -> Result<()>;

    /// Bulk-out one fully formed frame.
    ///
    /// With `retry` set, a failed transfer is retried a bounded number of
    /// times with increasing back-off before the error surfaces.
    fn send_data(&mut self, data: &[u8], timeout: Duration, retry: bool) -> Result<()>;

    /// Drain received bulk-in bytes into `dest`.
    ///
    /// Pumps USB events until at least `min_len` bytes are available, then
    /// copies up to `dest.len()` bytes and returns the count. Returns 0 once
    /// `timeout` expires; expiry is not itself an error — callers decide
    /// what an empty read means for their exchange.
    fn receive_data(&mut self, dest: &mut [u8], min_len: usize, timeout: Duration) -> usize;

    /// Throw away any received but unread bulk-in bytes.
    fn clear_received(&mut self);

    /// From now on, keep an asynchronous read of the bulk data-in endpoint
    /// outstanding.
    fn arm_bulk_in(&mut self);

    /// From now on, keep an asynchronous read of the notification endpoint
    /// outstanding.
    fn arm_interrupt(&mut self);

    /// Let the USB backend process completions for at most `timeout`.
    fn pump_events(&mut self, timeout: Duration);

    /// Idle pause between line configuration and the handshake, pacing the
    /// bus the way the stock flasher does.
    fn settle(&mut self) {
        for _ in 0..SETTLE_TICKS {
            self.pump_events(Duration::ZERO);
            thread::sleep(Duration::from_millis(1));
        }
    }
}
