//! Line configuration, handshake and session control
//!
//! The device presents itself as a CDC-ACM modem but implements the class
//! requests loosely: several of them stall on real hardware, and the exact
//! order and pacing of the configuration sequence matters. The script below
//! replays a captured trace of the stock flasher frame by frame; removing
//! or reordering steps has broken flashing in the field, so the full script
//! runs on every initialise and no attempt is made to detect an
//! already-initialised session.

use std::time::Duration;

use log::{debug, info, trace, warn};
use rusb::{Direction, Recipient, RequestType};

use crate::bridge::{Bridge, ControlRequest};
use crate::error::{Error, Result};
use crate::packet::{Command, Response, ResponseKind, RESPONSE_FRAME_LEN};

// CDC class request codes (PSTN subset).
const SET_COMM_FEATURE: u8 = 0x02;
const GET_COMM_FEATURE: u8 = 0x03;
const CLEAR_COMM_FEATURE: u8 = 0x04;
const SET_LINE_CODING: u8 = 0x20;
const GET_LINE_CODING: u8 = 0x21;
const SET_CONTROL_LINE_STATE: u8 = 0x22;

const REQUEST_CLEAR_FEATURE: u8 = 0x01;
const FEATURE_ENDPOINT_HALT: u16 = 0x0000;

/// 115 200 baud, no parity; the second variant also sets 8 data bits.
const LINE_CODING_SETUP: [u8; 7] = [0x00, 0xC2, 0x01, 0x00, 0x00, 0x00, 0x00];
const LINE_CODING_8N1: [u8; 7] = [0x00, 0xC2, 0x01, 0x00, 0x00, 0x00, 0x08];

const HANDSHAKE_SEND: [u8; 4] = *b"ODIN";
const HANDSHAKE_REPLY: [u8; 4] = *b"LOKE";
const HANDSHAKE_SEND_TIMEOUT: Duration = Duration::from_secs(1);
const HANDSHAKE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default timeout for one command/acknowledgement exchange.
pub(crate) const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Opaque values a session-begin response may carry: 0 on most devices,
/// 131072 on the Galaxy S II class.
const ACCEPTED_SESSION_VALUES: [u32; 2] = [0, 131_072];

/// Device-type codes seen in the wild. Their meaning is undocumented;
/// anything else is rejected.
const ACCEPTED_DEVICE_TYPES: [u32; 4] = [0, 3, 180, 190];

/// Run the full line-configuration and handshake script.
///
/// Must be called exactly once, after the interfaces are claimed and before
/// [`Session::begin`].
pub fn initialise<B: Bridge>(bridge: &mut B) -> Result<()> {
    info!("initialising protocol");
    configure_line(bridge)?;
    handshake(bridge)
}

/// Clear endpoint halts, then walk the captured CDC control sequence.
fn configure_line<B: Bridge>(bridge: &mut B) -> Result<()> {
    clear_halts(bridge)?;

    let class_out = rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
    let class_in = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);

    debug!("CLEAR_COMM_FEATURE");
    bridge.control(&ControlRequest::out(class_out, CLEAR_COMM_FEATURE, 0x0001, 0, &[]).tolerate_stall())?;

    debug!("GET_COMM_FEATURE");
    bridge.control(&ControlRequest::read(class_in, GET_COMM_FEATURE, 0x0001, 0, 2).tolerate_stall())?;

    debug!("SET_COMM_FEATURE");
    bridge.control(
        &ControlRequest::out(class_out, SET_COMM_FEATURE, 0x0001, 0, &[0x02, 0x00]).tolerate_stall(),
    )?;

    debug!("SET_CONTROL_LINE_STATE DTR|RTS");
    bridge.control(
        &ControlRequest::out(class_out, SET_CONTROL_LINE_STATE, 0x0003, 0, &[]).tolerate_stall(),
    )?;

    debug!("GET_LINE_CODING");
    bridge.control(&ControlRequest::read(class_in, GET_LINE_CODING, 0, 0, 7).tolerate_stall())?;

    // The device starts pushing data before it is asked for anything; reads
    // must be outstanding from here on.
    bridge.arm_bulk_in();

    debug!("GET_LINE_CODING");
    bridge.control(&ControlRequest::read(class_in, GET_LINE_CODING, 0, 0, 0).tolerate_stall())?;

    bridge.arm_interrupt();

    debug!("SET_LINE_CODING");
    bridge.control(
        &ControlRequest::out(class_out, SET_LINE_CODING, 0, 0, &LINE_CODING_SETUP).tolerate_stall(),
    )?;

    debug!("SET_CONTROL_LINE_STATE DTR|RTS");
    bridge.control(
        &ControlRequest::out(class_out, SET_CONTROL_LINE_STATE, 0x0003, 0, &[]).tolerate_stall(),
    )?;

    debug!("SET_CONTROL_LINE_STATE RTS");
    bridge.control(
        &ControlRequest::out(class_out, SET_CONTROL_LINE_STATE, 0x0002, 0, &[]).tolerate_stall(),
    )?;

    debug!("SET_LINE_CODING");
    bridge.control(
        &ControlRequest::out(class_out, SET_LINE_CODING, 0, 0, &LINE_CODING_8N1).tolerate_stall(),
    )?;

    bridge.settle();
    Ok(())
}

/// Clear any halt left on the three endpoints from a previous run.
///
/// Unlike the class requests, a failure here is fatal.
fn clear_halts<B: Bridge>(bridge: &mut B) -> Result<()> {
    let endpoints = *bridge.endpoints();
    let request_type =
        rusb::request_type(Direction::Out, RequestType::Standard, Recipient::Endpoint);

    for endpoint in [endpoints.comm, endpoints.data_in, endpoints.data_out] {
        debug!("clearing halt on endpoint {endpoint:#04x}");
        bridge.control(&ControlRequest::out(
            request_type,
            REQUEST_CLEAR_FEATURE,
            FEATURE_ENDPOINT_HALT,
            endpoint as u16,
            &[],
        ))?;
    }
    Ok(())
}

/// The ASCII exchange that opens the download protocol.
fn handshake<B: Bridge>(bridge: &mut B) -> Result<()> {
    info!("handshaking");
    bridge.send_data(&HANDSHAKE_SEND, HANDSHAKE_SEND_TIMEOUT, false)?;

    let mut reply = [0u8; 4];
    let reply_len = reply.len();
    let received = bridge.receive_data(&mut reply, reply_len, HANDSHAKE_RECEIVE_TIMEOUT);
    if received != reply.len() || reply != HANDSHAKE_REPLY {
        return Err(Error::Handshake { received: reply });
    }
    debug!("device answered LOKE");
    Ok(())
}

/// Send one control frame and wait for its typed acknowledgement.
pub(crate) fn exchange<B: Bridge>(
    bridge: &mut B,
    command: Command,
    expect: ResponseKind,
) -> Result<u32> {
    exchange_timeout(bridge, command, expect, EXCHANGE_TIMEOUT, EXCHANGE_TIMEOUT)
}

pub(crate) fn exchange_timeout<B: Bridge>(
    bridge: &mut B,
    command: Command,
    expect: ResponseKind,
    send_timeout: Duration,
    receive_timeout: Duration,
) -> Result<u32> {
    bridge.send_data(&command.encode(), send_timeout, true)?;
    receive_response(bridge, expect, receive_timeout)
}

/// Wait for one acknowledgement frame of the given kind.
pub(crate) fn receive_response<B: Bridge>(
    bridge: &mut B,
    expect: ResponseKind,
    timeout: Duration,
) -> Result<u32> {
    let mut frame = [0u8; RESPONSE_FRAME_LEN];
    let frame_len = frame.len();
    let received = bridge.receive_data(&mut frame, frame_len, timeout);
    if received < frame.len() {
        return Err(Error::Timeout { wanted: frame.len() });
    }
    let response = Response::decode(expect, &frame)?;
    trace!("{:?} response, value {:#x}", response.kind, response.value);
    Ok(response.value)
}

/// A running download-protocol session.
///
/// Exists between [`Session::begin`] and [`Session::end`]; transfers are
/// methods on it. Holding a session mutably borrows the bridge, so a second
/// concurrent session cannot be created.
pub struct Session<'a, B: Bridge> {
    pub(crate) bridge: &'a mut B,
    device_type: u32,
}

impl<'a, B: Bridge> std::fmt::Debug for Session<'a, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device_type", &self.device_type)
            .finish()
    }
}

impl<'a, B: Bridge> Session<'a, B> {
    /// Negotiate a session with an initialised device.
    pub fn begin(bridge: &'a mut B) -> Result<Self> {
        info!("beginning session");

        let value = exchange(bridge, Command::BeginSession, ResponseKind::Session)?;
        if !ACCEPTED_SESSION_VALUES.contains(&value) {
            return Err(Error::UnexpectedSessionValue(value));
        }

        let device_type = exchange(bridge, Command::DeviceInfo, ResponseKind::Session)?;
        if !ACCEPTED_DEVICE_TYPES.contains(&device_type) {
            return Err(Error::UnknownDeviceType(device_type));
        }

        info!("session begun with device of type {device_type}");
        Ok(Session {
            bridge,
            device_type,
        })
    }

    /// Device-type code reported during session setup.
    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    /// Close the session, optionally asking the device to reboot afterwards.
    pub fn end(self, reboot: bool) -> Result<()> {
        info!("ending session");
        exchange(self.bridge, Command::EndSession, ResponseKind::EndSession).map_err(|err| {
            warn!("no acknowledgement for session end: {err}");
            err
        })?;

        if reboot {
            info!("rebooting device");
            exchange(self.bridge, Command::RebootDevice, ResponseKind::EndSession).map_err(
                |err| {
                    warn!("no acknowledgement for reboot: {err}");
                    err
                },
            )?;
        }
        Ok(())
    }
}
