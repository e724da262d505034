//! ## Control
//!
//! The class-specific control requests of USBTMC and its USB488 sub-class.
//!
//! Every request is a single device-to-host control transfer with a fixed
//! response length; the first response byte is the USBTMC_status. Split
//! transactions (aborts, clear) answer PENDING and are re-polled with
//! [`poll_with_backoff`].
//!

use std::thread;
use std::time::{Duration, Instant};

use rusb::{Direction, Recipient, RequestType};
use tracing::trace;

use crate::constants::{control_requests, usbtmc_status};
use crate::error::{Error, Result};
use crate::transport::UsbTransport;
use crate::types::Capabilities;

fn rt_interface_in() -> u8 {
    rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface)
}

fn rt_endpoint_in() -> u8 {
    rusb::request_type(Direction::In, RequestType::Class, Recipient::Endpoint)
}

/// Execute one class request and return the raw response, verifying that the
/// device produced at least `len` bytes.
fn class_request<T: UsbTransport>(
    transport: &mut T,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; len];
    let n = transport.control_in(request_type, request, value, index, &mut buffer, timeout)?;
    trace!("class request {request} -> {n} bytes, status {:#04x}", buffer.first().copied().unwrap_or(0));
    if n < len {
        return Err(Error::ProtocolViolation(format!(
            "control response for request {request} is short ({n} of {len} bytes)"
        )));
    }
    Ok(buffer)
}

fn expect_success(request: u8, status: u8) -> Result<()> {
    match status {
        usbtmc_status::STATUS_SUCCESS => Ok(()),
        other => Err(Error::DeviceStatusFailed { request, status: other }),
    }
}

/// Poll a PENDING split transaction with exponential backoff, 1 ms doubling
/// up to 100 ms, until `attempt` yields a result or `budget` is spent.
pub(crate) fn poll_with_backoff<R>(
    budget: Duration,
    mut attempt: impl FnMut() -> Result<Option<R>>,
) -> Result<R> {
    use crate::constants::misc::{POLL_BACKOFF_CAP, POLL_BACKOFF_START};

    let deadline = Instant::now() + budget;
    let mut delay = POLL_BACKOFF_START;
    loop {
        if let Some(result) = attempt()? {
            return Ok(result);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::IoTimeout);
        }
        thread::sleep(delay.min(deadline - now));
        delay = (delay * 2).min(POLL_BACKOFF_CAP);
    }
}

/// ### Get Capabilities
///
/// Read and parse the interface capability record (USBTMC request 7). The
/// USB488 fields are only meaningful when the interface protocol says so,
/// but the response layout is the same either way.
///
pub fn get_capabilities<T: UsbTransport>(
    transport: &mut T,
    interface_number: u8,
    timeout: Duration,
) -> Result<Capabilities> {
    let response = class_request(
        transport,
        rt_interface_in(),
        control_requests::GET_CAPABILITIES,
        0x0000,
        interface_number as u16,
        0x18,
        timeout,
    )?;
    expect_success(control_requests::GET_CAPABILITIES, response[0])?;

    Ok(Capabilities {
        bcd_usbtmc: u16::from_le_bytes([response[2], response[3]]),
        accepts_indicator_pulse_request: response[4] & 0b0000_0100 != 0,
        is_talk_only: response[4] & 0b0000_0010 != 0,
        is_listen_only: response[4] & 0b0000_0001 != 0,
        supports_bulk_in_term_char: response[5] & 0b0000_0001 != 0,
        bcd_usb488: u16::from_le_bytes([response[12], response[13]]),
        is_488_2: response[14] & 0b0000_0100 != 0,
        accepts_remote_local: response[14] & 0b0000_0010 != 0,
        accepts_trigger: response[14] & 0b0000_0001 != 0,
        supports_mandatory_scpi: response[15] & 0b0000_1000 != 0,
        sr1_capable: response[15] & 0b0000_0100 != 0,
        rl1_capable: response[15] & 0b0000_0010 != 0,
        dt1_capable: response[15] & 0b0000_0001 != 0,
    })
}

/// Start aborting the bulk-out transfer identified by `btag`. Returns the
/// raw USBTMC_status so the caller can dispatch on it.
pub fn initiate_abort_bulk_out<T: UsbTransport>(
    transport: &mut T,
    bulk_out_address: u8,
    btag: u8,
    timeout: Duration,
) -> Result<u8> {
    let response = class_request(
        transport,
        rt_endpoint_in(),
        control_requests::INITIATE_ABORT_BULK_OUT,
        btag as u16,
        bulk_out_address as u16,
        0x02,
        timeout,
    )?;
    Ok(response[0])
}

/// Check progress of a bulk-out abort. Returns the raw status and
/// NBYTES_RXD, the byte count the device retained.
pub fn check_abort_bulk_out_status<T: UsbTransport>(
    transport: &mut T,
    bulk_out_address: u8,
    timeout: Duration,
) -> Result<(u8, u32)> {
    let response = class_request(
        transport,
        rt_endpoint_in(),
        control_requests::CHECK_ABORT_BULK_OUT_STATUS,
        0x0000,
        bulk_out_address as u16,
        0x08,
        timeout,
    )?;
    let nbytes = u32::from_le_bytes([response[4], response[5], response[6], response[7]]);
    Ok((response[0], nbytes))
}

/// Start aborting the bulk-in transfer identified by `btag`.
pub fn initiate_abort_bulk_in<T: UsbTransport>(
    transport: &mut T,
    bulk_in_address: u8,
    btag: u8,
    timeout: Duration,
) -> Result<u8> {
    let response = class_request(
        transport,
        rt_endpoint_in(),
        control_requests::INITIATE_ABORT_BULK_IN,
        btag as u16,
        bulk_in_address as u16,
        0x02,
        timeout,
    )?;
    Ok(response[0])
}

/// Check progress of a bulk-in abort. Returns the raw status and the
/// bmAbortBulkIn flags; bit 0 means the device FIFO still holds data the
/// host should drain.
pub fn check_abort_bulk_in_status<T: UsbTransport>(
    transport: &mut T,
    bulk_in_address: u8,
    timeout: Duration,
) -> Result<(u8, u8)> {
    let response = class_request(
        transport,
        rt_endpoint_in(),
        control_requests::CHECK_ABORT_BULK_IN_STATUS,
        0x0000,
        bulk_in_address as u16,
        0x08,
        timeout,
    )?;
    Ok((response[0], response[1]))
}

pub fn initiate_clear<T: UsbTransport>(
    transport: &mut T,
    interface_number: u8,
    timeout: Duration,
) -> Result<u8> {
    let response = class_request(
        transport,
        rt_interface_in(),
        control_requests::INITIATE_CLEAR,
        0x0000,
        interface_number as u16,
        0x01,
        timeout,
    )?;
    Ok(response[0])
}

/// Check progress of an interface clear. Returns the raw status and the
/// bmClear flags; bit 0 asks the host to drain the bulk-in endpoint before
/// polling again.
pub fn check_clear_status<T: UsbTransport>(
    transport: &mut T,
    interface_number: u8,
    timeout: Duration,
) -> Result<(u8, u8)> {
    let response = class_request(
        transport,
        rt_interface_in(),
        control_requests::CHECK_CLEAR_STATUS,
        0x0000,
        interface_number as u16,
        0x02,
        timeout,
    )?;
    Ok((response[0], response[1]))
}

/// ### Indicator Pulse
///
/// Ask the device to blink its activity indicator (USBTMC request 64).
///
pub fn indicator_pulse<T: UsbTransport>(
    transport: &mut T,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let response = class_request(
        transport,
        rt_interface_in(),
        control_requests::INDICATOR_PULSE,
        0x0000,
        interface_number as u16,
        0x01,
        timeout,
    )?;
    expect_success(control_requests::INDICATOR_PULSE, response[0])
}

/// Issue the USB488 READ_STATUS_BYTE request and return the raw 3-byte
/// response `[status, bTag echo, status byte]`. For devices that answer via
/// the interrupt-in endpoint, byte 2 is meaningless and the real value
/// follows on that endpoint.
pub fn read_status_byte_request<T: UsbTransport>(
    transport: &mut T,
    interface_number: u8,
    rsb_btag: u8,
    timeout: Duration,
) -> Result<[u8; 3]> {
    let response = class_request(
        transport,
        rt_interface_in(),
        control_requests::READ_STATUS_BYTE,
        rsb_btag as u16,
        interface_number as u16,
        0x03,
        timeout,
    )?;
    expect_success(control_requests::READ_STATUS_BYTE, response[0])?;
    if response[1] != rsb_btag {
        return Err(Error::ProtocolViolation(format!(
            "READ_STATUS_BYTE echoed bTag {:#04x}, expected {rsb_btag:#04x}",
            response[1]
        )));
    }
    Ok([response[0], response[1], response[2]])
}

/// ### REN Control
///
/// Assert or release the USB488 remote-enable state.
///
pub fn ren_control<T: UsbTransport>(
    transport: &mut T,
    interface_number: u8,
    enable: bool,
    timeout: Duration,
) -> Result<()> {
    let response = class_request(
        transport,
        rt_interface_in(),
        control_requests::REN_CONTROL,
        enable as u16,
        interface_number as u16,
        0x01,
        timeout,
    )?;
    expect_success(control_requests::REN_CONTROL, response[0])
}

/// ### Go To Local
///
/// Return the device to front-panel (local) control.
///
pub fn go_to_local<T: UsbTransport>(
    transport: &mut T,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let response = class_request(
        transport,
        rt_interface_in(),
        control_requests::GO_TO_LOCAL,
        0x0000,
        interface_number as u16,
        0x01,
        timeout,
    )?;
    expect_success(control_requests::GO_TO_LOCAL, response[0])
}

/// ### Local Lockout
///
/// Lock the device front panel until remote enable is dropped.
///
pub fn local_lockout<T: UsbTransport>(
    transport: &mut T,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let response = class_request(
        transport,
        rt_interface_in(),
        control_requests::LOCAL_LOCKOUT,
        0x0000,
        interface_number as u16,
        0x01,
        timeout,
    )?;
    expect_success(control_requests::LOCAL_LOCKOUT, response[0])
}
