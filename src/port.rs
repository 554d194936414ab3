//! USB transport backed by libusb
//!
//! [`UsbPort`] owns the libusb context, the device handle and the inbound
//! ring buffer. The bulk data-in and notification endpoints are read through
//! asynchronous transfers that are kept outstanding whenever their "wanted"
//! flag is set; completions run on this same thread, from inside
//! `handle_events`, and re-arm themselves.
//!
//! Everything a completion callback touches lives in [`PortShared`], which is
//! handed to libusb as the transfer's `user_data`. The callback gets its
//! owner back as an explicit parameter instead of a captured `self`, which
//! keeps the single-threaded reentrancy auditable: the callbacks and the
//! blocking reads take the same lock, and the lock is never held across a
//! call into `handle_events`.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rusb::constants::{
    LIBUSB_CLASS_COMM, LIBUSB_CLASS_DATA, LIBUSB_ERROR_ACCESS, LIBUSB_ERROR_BUSY,
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_INVALID_PARAM, LIBUSB_ERROR_IO, LIBUSB_ERROR_NOT_FOUND,
    LIBUSB_ERROR_NOT_SUPPORTED, LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NO_MEM,
    LIBUSB_ERROR_OVERFLOW, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT, LIBUSB_TRANSFER_COMPLETED,
    LIBUSB_TRANSFER_FREE_TRANSFER,
};
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_device_handle,
    libusb_fill_bulk_transfer, libusb_fill_interrupt_transfer, libusb_free_transfer,
    libusb_submit_transfer, libusb_transfer,
};
use rusb::{
    ConfigDescriptor, Context, DeviceDescriptor, DeviceHandle, Direction, SyncType, TransferType,
    UsageType, UsbContext,
};

use crate::bridge::{Bridge, ControlRequest};
use crate::error::{Error, Result};
use crate::ring::InboundRing;
use crate::types::{DeviceId, Endpoints, SUPPORTED_DEVICES};

/// Length of each asynchronous bulk-in read.
const BULK_IN_READ_LEN: usize = 4096;

/// Bulk-out retry schedule.
const SEND_RETRIES: u32 = 5;
const RETRY_DELAY_FLOOR: Duration = Duration::from_millis(250);

/// Event-pump granularity while a blocking read waits for data.
const EVENT_POLL: Duration = Duration::from_millis(500);

/// How long teardown waits for cancelled transfers to complete.
const CANCEL_DRAIN_POLL: Duration = Duration::from_millis(100);
const CANCEL_DRAIN_ATTEMPTS: u32 = 10;

/// A claimed download-mode device.
pub struct UsbPort {
    handle: DeviceHandle<Context>,
    context: Context,
    endpoints: Endpoints,
    /// Pause inserted after each send and receive. Zero by default; some
    /// hosts need it to avoid outpacing the device.
    delay: Duration,
    claimed: Vec<u8>,
    #[cfg_attr(not(unix), allow(dead_code))]
    detached: Vec<u8>,
    shared: Arc<PortShared>,
}

/// State reachable from transfer completion callbacks.
struct PortShared {
    handle: NonNull<libusb_device_handle>,
    data_in: u8,
    comm: u8,
    inner: Mutex<Inbound>,
}

struct Inbound {
    ring: InboundRing,
    want_bulk_in: bool,
    want_interrupt: bool,
    /// In-flight transfers, at most one per endpoint. The pointers stay
    /// valid until the completion callback runs: transfers free themselves
    /// (`LIBUSB_TRANSFER_FREE_TRANSFER`) and completions only ever run
    /// inside `handle_events`.
    bulk_in: Option<NonNull<libusb_transfer>>,
    interrupt: Option<NonNull<libusb_transfer>>,
    /// Set during teardown to stop the callbacks from re-arming.
    closing: bool,
}

impl UsbPort {
    /// Scan the bus for a supported device without opening it.
    pub fn detect() -> Result<DeviceId> {
        let context = Context::new()?;
        for device in context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if let Some(id) = supported(&descriptor) {
                return Ok(id);
            }
        }
        Err(Error::DeviceNotDetected)
    }

    /// Open and claim the first supported device on the bus.
    ///
    /// Resets the device, reads its first configuration, selects the
    /// notification and data endpoints and claims both interfaces, detaching
    /// a bound kernel driver if necessary.
    pub fn open(delay: Duration) -> Result<UsbPort> {
        let context = Context::new()?;

        let mut found = None;
        for device in context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if let Some(id) = supported(&descriptor) {
                found = Some((device, descriptor, id));
                break;
            }
        }
        let Some((device, descriptor, id)) = found else {
            return Err(Error::DeviceNotDetected);
        };

        debug!("opening device {id}");
        let mut handle = device.open()?;

        debug!("resetting device");
        handle.reset()?;

        if let Ok(manufacturer) = handle.read_manufacturer_string_ascii(&descriptor) {
            debug!("manufacturer: {manufacturer:?}");
        }
        if let Ok(product) = handle.read_product_string_ascii(&descriptor) {
            debug!("product: {product:?}");
        }

        let config = device.config_descriptor(0)?;
        let endpoints = select_endpoints(&profile_interfaces(&config)).ok_or_else(|| {
            warn!("device {id} does not expose the expected interfaces");
            Error::DeviceNotDetected
        })?;
        debug!(
            "selected endpoints: comm {:#04x} on interface {}, data in {:#04x} / out {:#04x} on interface {}",
            endpoints.comm,
            endpoints.comm_interface,
            endpoints.data_in,
            endpoints.data_out,
            endpoints.data_interface
        );

        let mut claimed = Vec::new();
        let mut detached = Vec::new();
        for interface in [endpoints.comm_interface, endpoints.data_interface] {
            debug!("claiming interface {interface}");
            if let Err(err) = handle.claim_interface(interface) {
                #[cfg(unix)]
                {
                    warn!("claiming interface {interface} failed ({err}); detaching kernel driver");
                    if handle.detach_kernel_driver(interface).is_ok() {
                        detached.push(interface);
                    }
                    handle.claim_interface(interface)?;
                }
                #[cfg(not(unix))]
                return Err(err.into());
            }
            claimed.push(interface);
        }

        let shared = Arc::new(PortShared {
            // Unwrap safety: libusb never hands out a null device handle.
            handle: NonNull::new(handle.as_raw()).unwrap(),
            data_in: endpoints.data_in,
            comm: endpoints.comm,
            inner: Mutex::new(Inbound {
                ring: InboundRing::new(),
                want_bulk_in: false,
                want_interrupt: false,
                bulk_in: None,
                interrupt: None,
                closing: false,
            }),
        });

        Ok(UsbPort {
            handle,
            context,
            endpoints,
            delay,
            claimed,
            detached,
            shared,
        })
    }
}

fn supported(descriptor: &DeviceDescriptor) -> Option<DeviceId> {
    SUPPORTED_DEVICES
        .iter()
        .copied()
        .find(|id| id.vendor_id == descriptor.vendor_id() && id.product_id == descriptor.product_id())
}

/// One endpoint as seen by the selector.
#[derive(Clone, Copy)]
struct EndpointProfile {
    address: u8,
    direction: Direction,
    transfer: TransferType,
    sync: SyncType,
    usage: UsageType,
}

/// One interface altsetting as seen by the selector.
struct InterfaceProfile {
    number: u8,
    class: u8,
    sub_class: u8,
    protocol: u8,
    endpoints: Vec<EndpointProfile>,
}

fn profile_interfaces(config: &ConfigDescriptor) -> Vec<InterfaceProfile> {
    let mut profiles = Vec::new();
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            profiles.push(InterfaceProfile {
                number: descriptor.interface_number(),
                class: descriptor.class_code(),
                sub_class: descriptor.sub_class_code(),
                protocol: descriptor.protocol_code(),
                endpoints: descriptor
                    .endpoint_descriptors()
                    .map(|endpoint| EndpointProfile {
                        address: endpoint.address(),
                        direction: endpoint.direction(),
                        transfer: endpoint.transfer_type(),
                        sync: endpoint.sync_type(),
                        usage: endpoint.usage_type(),
                    })
                    .collect(),
            });
        }
    }
    profiles
}

/// Pick the notification and data endpoints from the configuration.
///
/// The notification endpoint is an IN interrupt endpoint on an abstract
/// control interface (class 0x02, subclass 0x02, protocol 0x01); the data
/// endpoints are the bulk IN/OUT pair on a data-class interface (class 0x0A,
/// protocol 0x00). Within an altsetting the first acceptable endpoint wins;
/// across altsettings the first one providing a role wins. Extra candidates
/// only produce warnings.
fn select_endpoints(profiles: &[InterfaceProfile]) -> Option<Endpoints> {
    let mut comm: Option<(u8, u8)> = None;
    let mut data: Option<(u8, u8, u8)> = None;

    for profile in profiles {
        let is_comm = profile.class == LIBUSB_CLASS_COMM
            && profile.sub_class == 0x02
            && profile.protocol == 0x01;
        let is_data = profile.class == LIBUSB_CLASS_DATA && profile.protocol == 0x00;
        if !is_comm && !is_data {
            continue;
        }

        let mut candidate_comm: Option<u8> = None;
        let mut candidate_in: Option<u8> = None;
        let mut candidate_out: Option<u8> = None;

        for endpoint in &profile.endpoints {
            let plain_data = endpoint.sync == SyncType::NoSync && endpoint.usage == UsageType::Data;

            if is_comm {
                if endpoint.transfer == TransferType::Interrupt && plain_data {
                    if candidate_comm.is_some() {
                        warn!(
                            "multiple notification endpoints on interface {}; keeping the first",
                            profile.number
                        );
                    } else {
                        candidate_comm = Some(endpoint.address);
                    }
                } else {
                    warn!(
                        "ignoring unexpected endpoint {:#04x} on notification interface {}",
                        endpoint.address, profile.number
                    );
                }
            } else if endpoint.transfer == TransferType::Bulk && plain_data {
                let candidate = match endpoint.direction {
                    Direction::In => &mut candidate_in,
                    Direction::Out => &mut candidate_out,
                };
                if candidate.is_some() {
                    warn!(
                        "multiple bulk {:?} endpoints on interface {}; keeping the first",
                        endpoint.direction, profile.number
                    );
                } else {
                    *candidate = Some(endpoint.address);
                }
            } else {
                warn!(
                    "ignoring unexpected endpoint {:#04x} on data interface {}",
                    endpoint.address, profile.number
                );
            }
        }

        if comm.is_none() {
            if let Some(endpoint) = candidate_comm {
                comm = Some((profile.number, endpoint));
            }
        }
        if data.is_none() {
            if let (Some(data_in), Some(data_out)) = (candidate_in, candidate_out) {
                data = Some((profile.number, data_in, data_out));
            }
        }
    }

    let (comm_interface, comm) = comm?;
    let (data_interface, data_in, data_out) = data?;
    Some(Endpoints {
        comm_interface,
        data_interface,
        comm,
        data_in,
        data_out,
    })
}

/// Submit a fresh transfer for every armed endpoint that has none in flight.
///
/// Idempotent: calling it while a transfer is already outstanding does
/// nothing for that endpoint. Runs from the port itself and from completion
/// callbacks.
fn start_async_transfers(shared: &Arc<PortShared>) {
    let mut inner = shared.inner.lock().unwrap();
    if inner.closing {
        return;
    }

    if inner.want_bulk_in && inner.bulk_in.is_none() {
        let tail = inner.ring.prepare_tail(BULK_IN_READ_LEN);
        let buffer = tail.as_mut_ptr();
        match submit(shared, shared.data_in, buffer, BULK_IN_READ_LEN, true) {
            Ok(transfer) => inner.bulk_in = Some(transfer),
            Err(err) => warn!("failed to submit bulk-in transfer: {err}"),
        }
    }

    if inner.want_interrupt && inner.interrupt.is_none() {
        match submit(shared, shared.comm, std::ptr::null_mut(), 0, false) {
            Ok(transfer) => inner.interrupt = Some(transfer),
            Err(err) => warn!("failed to submit notification transfer: {err}"),
        }
    }
}

/// Allocate, fill and submit one self-freeing asynchronous transfer.
fn submit(
    shared: &Arc<PortShared>,
    endpoint: u8,
    buffer: *mut u8,
    len: usize,
    bulk: bool,
) -> Result<NonNull<libusb_transfer>> {
    // SAFETY: the transfer is filled before submission; `user_data` is a
    // strong reference to `shared` that the completion callback reclaims, so
    // everything the callback dereferences outlives the transfer.
    unsafe {
        let transfer = libusb_alloc_transfer(0);
        let Some(transfer) = NonNull::new(transfer) else {
            return Err(Error::Usb(rusb::Error::NoMem));
        };

        let user_data = Arc::into_raw(Arc::clone(shared)) as *mut c_void;
        let fill = if bulk {
            libusb_fill_bulk_transfer
        } else {
            libusb_fill_interrupt_transfer
        };
        let callback = if bulk {
            bulk_in_complete
        } else {
            interrupt_complete
        };
        fill(
            transfer.as_ptr(),
            shared.handle.as_ptr(),
            endpoint,
            buffer,
            len as i32,
            callback,
            user_data,
            0,
        );
        (*transfer.as_ptr()).flags |= LIBUSB_TRANSFER_FREE_TRANSFER as u8;

        let rc = libusb_submit_transfer(transfer.as_ptr());
        if rc != 0 {
            // The free-transfer flag only applies once the callback has run.
            libusb_free_transfer(transfer.as_ptr());
            drop(Arc::from_raw(user_data as *const PortShared));
            return Err(Error::Usb(libusb_error(rc)));
        }
        Ok(transfer)
    }
}

extern "system" fn bulk_in_complete(transfer: *mut libusb_transfer) {
    // SAFETY: `transfer` is the struct submitted above and `user_data` holds
    // the strong `PortShared` reference taken at submission.
    let shared = unsafe {
        let transfer = &*transfer;
        let shared = Arc::from_raw(transfer.user_data as *const PortShared);

        let mut inner = shared.inner.lock().unwrap();
        inner.bulk_in = None;
        inner.ring.commit(transfer.actual_length as usize);
        if transfer.status != LIBUSB_TRANSFER_COMPLETED {
            debug!("bulk-in transfer ended with status {}", transfer.status);
        } else {
            trace!("bulk-in delivered {} bytes", transfer.actual_length);
        }
        drop(inner);
        shared
    };
    start_async_transfers(&shared);
}

extern "system" fn interrupt_complete(transfer: *mut libusb_transfer) {
    // SAFETY: as in `bulk_in_complete`.
    let shared = unsafe {
        let transfer = &*transfer;
        let shared = Arc::from_raw(transfer.user_data as *const PortShared);

        let mut inner = shared.inner.lock().unwrap();
        inner.interrupt = None;
        if transfer.actual_length != 0 {
            // Never seen in practice; log and discard.
            debug!(
                "notification endpoint delivered {} bytes; ignored",
                transfer.actual_length
            );
        }
        drop(inner);
        shared
    };
    start_async_transfers(&shared);
}

fn libusb_error(rc: i32) -> rusb::Error {
    match rc {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

impl Bridge for UsbPort {
    fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn control(&mut self, request: &ControlRequest<'_>) -> Result<()> {
        // A zero timeout makes libusb wait without limit.
        let timeout = Duration::ZERO;
        let result = if request.request_type & 0x80 != 0 {
            let mut data = vec![0u8; request.read_len];
            self.handle.read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                &mut data,
                timeout,
            )
        } else {
            self.handle.write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                request.data,
                timeout,
            )
        };

        match result {
            Ok(transferred) => {
                trace!(
                    "control {:#04x}/{:#04x} ok ({transferred} bytes)",
                    request.request_type,
                    request.request
                );
                Ok(())
            }
            Err(rusb::Error::Pipe) if request.pipe_ok => {
                debug!(
                    "control request {:#04x} stalled; tolerated",
                    request.request
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn send_data(&mut self, data: &[u8], timeout: Duration, retry: bool) -> Result<()> {
        let mut result = self.handle.write_bulk(self.endpoints.data_out, data, timeout);

        if retry {
            let step = self.delay.max(RETRY_DELAY_FLOOR);
            let mut attempt = 0;
            while let Err(err) = &result {
                attempt += 1;
                if attempt > SEND_RETRIES {
                    break;
                }
                warn!("bulk-out failed ({err}); retry {attempt} of {SEND_RETRIES}");
                thread::sleep(step * attempt);
                result = self.handle.write_bulk(self.endpoints.data_out, data, timeout);
            }
        }

        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let sent = result?;
        if sent != data.len() {
            return Err(Error::ShortTransfer {
                sent,
                len: data.len(),
            });
        }
        Ok(())
    }

    fn receive_data(&mut self, dest: &mut [u8], min_len: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut inner = self.shared.inner.lock().unwrap();
                if inner.ring.available() >= min_len {
                    let count = inner.ring.consume(dest);
                    drop(inner);
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                    return count;
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            if let Err(err) = self.context.handle_events(Some(EVENT_POLL)) {
                warn!("handle_events: {err}");
            }
        }

        let available = self.shared.inner.lock().unwrap().ring.available();
        if available > 0 {
            warn!("partial receive: {available} bytes available, wanted at least {min_len}");
        }
        0
    }

    fn clear_received(&mut self) {
        self.shared.inner.lock().unwrap().ring.clear();
    }

    fn arm_bulk_in(&mut self) {
        self.shared.inner.lock().unwrap().want_bulk_in = true;
        start_async_transfers(&self.shared);
    }

    fn arm_interrupt(&mut self) {
        self.shared.inner.lock().unwrap().want_interrupt = true;
        start_async_transfers(&self.shared);
    }

    fn pump_events(&mut self, timeout: Duration) {
        if let Err(err) = self.context.handle_events(Some(timeout)) {
            warn!("handle_events: {err}");
        }
    }
}

impl Drop for UsbPort {
    fn drop(&mut self) {
        // Stop re-arming, then cancel whatever is in flight. The pointers are
        // valid here: completions (which free the transfers) only run inside
        // handle_events, and nothing is pumping events right now.
        let pending = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.closing = true;
            inner.want_bulk_in = false;
            inner.want_interrupt = false;
            [inner.bulk_in, inner.interrupt]
        };
        for transfer in pending.into_iter().flatten() {
            // SAFETY: see above; a transfer that already completed between
            // the snapshot and this call merely makes cancellation report
            // NotFound.
            unsafe {
                libusb_cancel_transfer(transfer.as_ptr());
            }
        }

        let mut drained = false;
        for _ in 0..CANCEL_DRAIN_ATTEMPTS {
            {
                let inner = self.shared.inner.lock().unwrap();
                if inner.bulk_in.is_none() && inner.interrupt.is_none() {
                    drained = true;
                    break;
                }
            }
            if let Err(err) = self.context.handle_events(Some(CANCEL_DRAIN_POLL)) {
                warn!("handle_events during teardown: {err}");
            }
        }
        if !drained {
            warn!("leaking transfers that never completed after cancellation");
        }

        for &interface in &self.claimed {
            if let Err(err) = self.handle.release_interface(interface) {
                warn!("releasing interface {interface} failed: {err}");
            }
        }

        #[cfg(unix)]
        for &interface in &self.detached {
            debug!("re-attaching kernel driver to interface {interface}");
            if let Err(err) = self.handle.attach_kernel_driver(interface) {
                warn!("re-attaching kernel driver to interface {interface} failed: {err}");
            }
        }
    }
}
