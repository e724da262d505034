//! ## Types
//!
//! The different types used across the crate.
//!

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// ### bTag
///
/// The bTag counter used to identify bulk transfers.
///
/// Each call to `next` hands out the current value and increments. Past 255
/// it wraps around to 1; the value 0 is never produced.
///
#[derive(Debug, Clone)]
pub struct BTag(u8);

impl BTag {
    /// Return a fresh bTag counter whose first value will be 1.
    pub fn new() -> BTag {
        BTag(1)
    }

    /// Hand out the next bTag value.
    pub fn next(&mut self) -> u8 {
        let out = self.0;
        self.0 = if self.0 == 255 { 1 } else { self.0 + 1 };
        out
    }

    /// Reset the counter so the next value is 1 again. Done after open and
    /// after every successful device clear.
    pub fn reset(&mut self) {
        self.0 = 1;
    }
}

impl Default for BTag {
    fn default() -> BTag {
        BTag::new()
    }
}

/// The bTag counter for READ_STATUS_BYTE control requests. USB488 requires
/// this one to cycle within 2..=127, independent of the bulk counter.
#[derive(Debug, Clone)]
pub struct RsbTag(u8);

impl RsbTag {
    pub fn new() -> RsbTag {
        RsbTag(2)
    }

    pub fn next(&mut self) -> u8 {
        let out = self.0;
        self.0 = if self.0 == 127 { 2 } else { self.0 + 1 };
        out
    }
}

impl Default for RsbTag {
    fn default() -> RsbTag {
        RsbTag::new()
    }
}

/// Direction of a live transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// ### Device State
///
/// Lifecycle state of an opened USBTMC interface. Only one non-`Idle`
/// substate may be active at a time; a protocol violation parks the handle
/// in `Halted` until a successful device clear.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Idle,
    Writing,
    Reading,
    Aborting,
    Clearing,
    Halted,
}

/// USB device address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAddr {
    /// USB bus number
    pub bus: u8,
    /// USB device number
    pub device: u8,
}

/// USB device identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceId {
    /// USB Id Vendor
    pub vendor_id: u16,
    /// USB Id Product
    pub product_id: u16,
}

/// Human-readable info about a connected USBTMC device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub address: DeviceAddr,
    /// Manufacturer name from the device descriptor, if present.
    pub manufacturer: Option<String>,
    /// Product name from the device descriptor, if present.
    pub product: Option<String>,
    /// Serial number from the device descriptor, if present.
    pub serial_number: Option<String>,
}

impl DeviceInfo {
    /// The `vid:pid` pair rendered as four-digit hex values.
    pub fn vid_pid(&self) -> String {
        format!("{:04x}:{:04x}", self.id.vendor_id, self.id.product_id)
    }
}

/// ### Selector
///
/// The ways a caller can pick a device to open: by VID/PID, by serial
/// number, by bus+address, or by a VISA-style resource string of the form
/// `USB::<vid>::<pid>::<serial>::INSTR`.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    VidPid { vid: u16, pid: u16 },
    Serial(String),
    BusAddress { bus: u8, address: u8 },
    Resource { vid: u16, pid: u16, serial: Option<String> },
}

fn parse_usb_id(text: &str) -> Result<u16> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| Error::Config(format!("bad USB id in resource string: {text:?}")))
}

impl FromStr for Selector {
    type Err = Error;

    /// Parse a `USB::<vid>::<pid>::<serial>::INSTR` resource string. The
    /// serial segment may be omitted; ids may be decimal or `0x` hex.
    fn from_str(s: &str) -> Result<Selector> {
        let parts: Vec<&str> = s.split("::").collect();
        let bad = || Error::Config(format!("bad resource string: {s:?}"));
        match parts.as_slice() {
            [kind, vid, pid, serial, suffix]
                if kind.eq_ignore_ascii_case("usb") && suffix.eq_ignore_ascii_case("instr") =>
            {
                Ok(Selector::Resource {
                    vid: parse_usb_id(vid)?,
                    pid: parse_usb_id(pid)?,
                    serial: Some((*serial).to_string()),
                })
            }
            [kind, vid, pid, suffix]
                if kind.eq_ignore_ascii_case("usb") && suffix.eq_ignore_ascii_case("instr") =>
            {
                Ok(Selector::Resource {
                    vid: parse_usb_id(vid)?,
                    pid: parse_usb_id(pid)?,
                    serial: None,
                })
            }
            _ => Err(bad()),
        }
    }
}

impl From<(u16, u16)> for Selector {
    fn from((vid, pid): (u16, u16)) -> Selector {
        Selector::VidPid { vid, pid }
    }
}

impl From<DeviceId> for Selector {
    fn from(id: DeviceId) -> Selector {
        Selector::VidPid { vid: id.vendor_id, pid: id.product_id }
    }
}

impl From<DeviceAddr> for Selector {
    fn from(addr: DeviceAddr) -> Selector {
        Selector::BusAddress { bus: addr.bus, address: addr.device }
    }
}

/// ### Endpoint
///
/// The parts of an endpoint descriptor the engine needs.
///
#[derive(Clone, Copy, Debug)]
pub struct Endpoint {
    /// Address of the endpoint on the interface
    pub address: u8,
    /// The maximal size a packet can have on this endpoint
    pub max_packet_size: u16,
}

/// ### USBTMC Endpoints
///
/// Endpoints specific to the USBTMC spec.
///
#[derive(Clone, Debug)]
pub struct UsbtmcEndpoints {
    /// The mandatory BULK OUT endpoint
    pub bulk_out_ep: Endpoint,
    /// The mandatory BULK IN endpoint
    pub bulk_in_ep: Endpoint,
    /// The optional INTERRUPT IN endpoint
    pub interrupt_ep: Option<Endpoint>,
}

/// Identity and layout of the USBTMC interface an engine drives. Frozen at
/// open time.
#[derive(Clone, Debug)]
pub struct InterfaceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice from the device descriptor; used for revision-keyed quirks.
    pub revision: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub bus: u8,
    pub address: u8,
    pub interface_number: u8,
    /// 0x00: plain USBTMC, 0x01: USB488.
    pub interface_protocol: u8,
    pub endpoints: UsbtmcEndpoints,
}

/// ### Capabilities
///
/// The collected capabilities of a USBTMC device, parsed from the
/// GET_CAPABILITIES response. Immutable after open.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    /// BCD version of the USBTMC interface specification
    pub bcd_usbtmc: u16,
    /// Can accept a control command for pulse
    pub accepts_indicator_pulse_request: bool,
    /// Only sends data to the controller
    pub is_talk_only: bool,
    /// Only accepts data from the controller
    pub is_listen_only: bool,
    /// Accepts a terminator character on bulk-in requests
    pub supports_bulk_in_term_char: bool,
    /// BCD version of the USB488 sub-class specification
    pub bcd_usb488: u16,
    /// The interface is a 488.2 interface
    pub is_488_2: bool,
    /// Accepts REN_CONTROL, GO_TO_LOCAL and LOCAL_LOCKOUT
    pub accepts_remote_local: bool,
    /// Accepts the USB488 trigger bulk message
    pub accepts_trigger: bool,
    /// Understands all mandatory SCPI commands
    pub supports_mandatory_scpi: bool,
    /// Device is service-request capable
    pub sr1_capable: bool,
    /// Device is remote-local capable
    pub rl1_capable: bool,
    /// Device is device-trigger capable
    pub dt1_capable: bool,
}

/// ### Cancellation Token
///
/// Cloneable flag a caller can trip from another thread. The engine checks
/// it at USB operation boundaries during reads and at segment boundaries
/// during writes.
///
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// ### Transaction
///
/// A live bulk operation: its current bTag, direction, progress, payload
/// buffer, deadline and cancellation token. At most one transaction per
/// direction is live on a handle.
///
#[derive(Clone, Debug)]
pub struct Transaction {
    /// bTag of the most recent bulk header sent for this transaction;
    /// 0 until the first segment goes out.
    pub btag: u8,
    pub direction: Direction,
    /// Bytes still to be written, or read budget still open.
    pub remaining: usize,
    /// Outgoing payload for writes; accumulated data for reads.
    pub buffer: Vec<u8>,
    pub deadline: Instant,
    pub cancel: Option<CancelToken>,
}

impl Transaction {
    pub fn new(
        direction: Direction,
        remaining: usize,
        timeout: Duration,
        cancel: Option<CancelToken>,
    ) -> Transaction {
        Transaction {
            btag: 0,
            direction,
            remaining,
            buffer: Vec::new(),
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Time left until the transaction deadline, or `IoTimeout` when spent.
    pub fn time_left(&self) -> Result<Duration> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(Error::IoTimeout);
        }
        Ok(self.deadline - now)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btag_wraps_around_skipping_zero() {
        let mut btag = BTag::new();
        for expected in 1..=255u16 {
            assert_eq!(btag.next() as u16, expected);
        }
        assert_eq!(btag.next(), 1);
    }

    #[test]
    fn rsb_tag_stays_in_488_window() {
        let mut tag = RsbTag::new();
        for _ in 0..1000 {
            let v = tag.next();
            assert!((2..=127).contains(&v));
        }
    }

    #[test]
    fn resource_string_parses_hex_and_decimal() {
        let sel: Selector = "USB::0x0957::0x1755::MY1234::INSTR".parse().unwrap();
        assert_eq!(
            sel,
            Selector::Resource { vid: 0x0957, pid: 0x1755, serial: Some("MY1234".into()) }
        );

        let sel: Selector = "USB::1313::8078::INSTR".parse().unwrap();
        assert_eq!(sel, Selector::Resource { vid: 1313, pid: 8078, serial: None });
    }

    #[test]
    fn resource_string_rejects_garbage() {
        assert!("GPIB0::12::INSTR".parse::<Selector>().is_err());
        assert!("USB::zz::1::INSTR".parse::<Selector>().is_err());
    }
}
