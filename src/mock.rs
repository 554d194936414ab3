//! Scripted transport for protocol tests
//!
//! [`ScriptedBridge`] records every control request and outbound frame, and
//! answers reads from a canned byte stream. Responses are either queued up
//! front with [`ScriptedBridge::push_inbound`] or synthesised per outbound
//! frame by a responder closure, which keeps large transfers cheap.
//!
//! Only the length and leading bytes of each outbound frame are retained, so
//! tests can drive multi-hundred-megabyte uploads without keeping every part
//! in memory.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::bridge::{Bridge, ControlRequest};
use crate::error::Result;
use crate::types::Endpoints;

/// Bytes kept from each outbound frame; covers every header field.
const HEAD_LEN: usize = 64;

/// One recorded control transfer.
pub struct ControlCall {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
    pub read_len: usize,
}

/// Length and leading bytes of one recorded outbound frame.
pub struct SentFrame {
    pub len: usize,
    pub head: Vec<u8>,
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

pub struct ScriptedBridge {
    endpoints: Endpoints,
    pub controls: Vec<ControlCall>,
    pub sent: Vec<SentFrame>,
    pub armed_bulk_in: bool,
    pub armed_interrupt: bool,
    inbound: Vec<u8>,
    read_from: usize,
    responder: Option<Responder>,
}

impl ScriptedBridge {
    pub fn new() -> Self {
        Self {
            endpoints: Endpoints {
                comm_interface: 0,
                data_interface: 1,
                comm: 0x82,
                data_in: 0x81,
                data_out: 0x01,
            },
            controls: Vec::new(),
            sent: Vec::new(),
            armed_bulk_in: false,
            armed_interrupt: false,
            inbound: Vec::new(),
            read_from: 0,
            responder: None,
        }
    }

    /// Queue bytes the device will deliver on the bulk-in pipe.
    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Answer each outbound frame through `responder`; whatever it returns
    /// is appended to the inbound stream.
    pub fn respond_with(&mut self, responder: impl FnMut(&[u8]) -> Vec<u8> + 'static) {
        self.responder = Some(Box::new(responder));
    }

    fn pending(&self) -> usize {
        self.inbound.len() - self.read_from
    }
}

impl Bridge for ScriptedBridge {
    fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn control(&mut self, request: &ControlRequest<'_>) -> Result<()> {
        self.controls.push(ControlCall {
            request_type: request.request_type,
            request: request.request,
            value: request.value,
            index: request.index,
            data: request.data.to_vec(),
            read_len: request.read_len,
        });
        Ok(())
    }

    fn send_data(&mut self, data: &[u8], _timeout: Duration, _retry: bool) -> Result<()> {
        self.sent.push(SentFrame {
            len: data.len(),
            head: data[..data.len().min(HEAD_LEN)].to_vec(),
        });
        if let Some(responder) = &mut self.responder {
            let reply = responder(data);
            self.inbound.extend_from_slice(&reply);
        }
        Ok(())
    }

    fn receive_data(&mut self, dest: &mut [u8], min_len: usize, _timeout: Duration) -> usize {
        if self.pending() < min_len {
            // Deadline expiry: nothing is consumed.
            return 0;
        }
        let n = dest.len().min(self.pending());
        dest[..n].copy_from_slice(&self.inbound[self.read_from..self.read_from + n]);
        self.read_from += n;
        n
    }

    fn clear_received(&mut self) {
        self.read_from = self.inbound.len();
    }

    fn arm_bulk_in(&mut self) {
        self.armed_bulk_in = true;
    }

    fn arm_interrupt(&mut self) {
        self.armed_interrupt = true;
    }

    fn pump_events(&mut self, _timeout: Duration) {}

    fn settle(&mut self) {}
}

/// An 8-byte acknowledgement frame.
pub fn ack(family: u32, value: u32) -> Vec<u8> {
    let mut frame = vec![0u8; 8];
    LittleEndian::write_u32(&mut frame[0..4], family);
    LittleEndian::write_u32(&mut frame[4..8], value);
    frame
}

/// Leading little-endian words of a frame.
pub fn words(frame: &[u8], n: usize) -> Vec<u32> {
    frame
        .chunks_exact(4)
        .take(n)
        .map(LittleEndian::read_u32)
        .collect()
}
