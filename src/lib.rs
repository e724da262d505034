//! # USBTMC Protocol
//!
//! Pure Rust implementation of the USBTMC protocol and its USB488
//! sub-class, for SCPI-capable test & measurement instruments.
//!
//! The crate frames instrument messages into correctly sequenced USB bulk
//! transfers, runs the class control requests (aborts, clear, status byte,
//! remote/local), and tolerates a catalogue of non-compliant device
//! behaviours through a per-device quirks registry.
//!
//! ```no_run
//! use usbtmc::UsbtmcDevice;
//!
//! let device = UsbtmcDevice::open((0x0957, 0x1755))?;
//! device.write(b"*IDN?\n")?;
//! let identity = device.read(256)?;
//! println!("{}", String::from_utf8_lossy(&identity));
//! # Ok::<(), usbtmc::Error>(())
//! ```
//!

mod constants;
mod device;
mod error;
mod init;
pub mod quirks;
pub mod transport;
mod types;
pub mod communication {
    pub mod bulk;
    pub mod control;
    pub mod frame;
}

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use constants::misc::DEFAULT_TIMEOUT_DURATION;

pub use device::DeviceCore;
pub use error::{Error, Result};
pub use init::list_devices;
pub use transport::{RusbTransport, UsbTransport};
pub use types::{
    BTag, CancelToken, Capabilities, DeviceAddr, DeviceId, DeviceInfo, DeviceState, Direction,
    Endpoint, InterfaceInfo, RsbTag, Selector, Transaction, UsbtmcEndpoints,
};

/// ### UsbtmcDevice
///
/// A handle to one opened USBTMC instrument.
///
/// All operations are blocking and strictly serialised on an internal
/// exclusive lock, so a handle may be shared across threads; operations on
/// distinct handles are independent.
///
pub struct UsbtmcDevice {
    core: Mutex<DeviceCore<RusbTransport>>,
}

impl UsbtmcDevice {
    /// ### Open
    ///
    /// Find, open and initialise the instrument behind `selector` with the
    /// default I/O timeout.
    ///
    /// #### Arguments
    /// - `selector` -> how to pick the device: `(vid, pid)`, a
    ///   [`DeviceAddr`], or any other [`Selector`] form
    ///
    pub fn open(selector: impl Into<Selector>) -> Result<UsbtmcDevice> {
        UsbtmcDevice::open_with_timeout(selector, DEFAULT_TIMEOUT_DURATION)
    }

    /// ### Open With Timeout
    ///
    /// Like [`UsbtmcDevice::open`] with an explicit I/O timeout.
    ///
    pub fn open_with_timeout(
        selector: impl Into<Selector>,
        timeout: Duration,
    ) -> Result<UsbtmcDevice> {
        let selector = selector.into();
        let (transport, info, quirks, hooks) = init::open_interface(&selector)?;
        let core = DeviceCore::open(transport, info, quirks, hooks, timeout)?;
        Ok(UsbtmcDevice { core: Mutex::new(core) })
    }

    /// ### Open Resource
    ///
    /// Open by VISA-style resource string, e.g.
    /// `USB::0x0957::0x1755::MY1234::INSTR`.
    ///
    pub fn open_resource(resource: &str) -> Result<UsbtmcDevice> {
        UsbtmcDevice::open(resource.parse::<Selector>()?)
    }

    fn core(&self) -> MutexGuard<'_, DeviceCore<RusbTransport>> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// ### Write
    ///
    /// Send one complete message to the instrument.
    ///
    /// #### Arguments
    /// - `bytes` -> the message payload
    ///
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.core().write(bytes, None)
    }

    /// ### Read
    ///
    /// Read one message of at most `max_bytes` from the instrument.
    ///
    pub fn read(&self, max_bytes: usize) -> Result<Vec<u8>> {
        Ok(self.core().read(max_bytes, None, None)?.0)
    }

    /// ### Read With
    ///
    /// Read with an optional termination character and cancellation token.
    /// Returns the bytes (terminator left intact) and whether the device
    /// flagged End-Of-Message.
    ///
    pub fn read_with(
        &self,
        max_bytes: usize,
        term_char: Option<u8>,
        cancel: Option<&CancelToken>,
    ) -> Result<(Vec<u8>, bool)> {
        self.core().read(max_bytes, term_char, cancel.cloned())
    }

    /// ### Query
    ///
    /// Send a message and read the reply, holding the handle's exclusive
    /// lock across both.
    ///
    /// #### Arguments
    /// - `request` -> the message to send
    /// - `max_bytes` -> reply size budget
    ///
    pub fn query(&self, request: &[u8], max_bytes: usize) -> Result<Vec<u8>> {
        Ok(self.core().query(request, max_bytes, None)?.0)
    }

    /// ### Query With
    ///
    /// [`UsbtmcDevice::query`] with a cancellation token; returns the reply
    /// and whether End-Of-Message was seen.
    ///
    pub fn query_with(
        &self,
        request: &[u8],
        max_bytes: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<(Vec<u8>, bool)> {
        self.core().query(request, max_bytes, cancel.cloned())
    }

    /// ### Trigger
    ///
    /// Send the USB488 trigger message.
    ///
    pub fn trigger(&self) -> Result<()> {
        self.core().trigger()
    }

    /// ### Read Status Byte
    ///
    /// Fetch the IEEE-488 status byte.
    ///
    pub fn read_stb(&self) -> Result<u8> {
        self.core().read_stb()
    }

    /// ### Clear
    ///
    /// Run the interface clear sequence. Also the way out of the halted
    /// state after a failed recovery.
    ///
    pub fn clear(&self) -> Result<()> {
        self.core().clear()
    }

    /// ### Remote
    ///
    /// Put the instrument in remote mode (assert remote enable).
    ///
    pub fn remote(&self) -> Result<()> {
        self.core().remote()
    }

    /// ### Local
    ///
    /// Return the instrument to front-panel control.
    ///
    pub fn local(&self) -> Result<()> {
        self.core().local()
    }

    /// ### Lock
    ///
    /// Lock the instrument front panel (local lockout).
    ///
    pub fn lock(&self) -> Result<()> {
        self.core().lock()
    }

    /// ### Unlock
    ///
    /// Release remote enable, ending a local lockout.
    ///
    pub fn unlock(&self) -> Result<()> {
        self.core().unlock()
    }

    /// ### Indicator Pulse
    ///
    /// Blink the instrument's activity indicator.
    ///
    pub fn indicator_pulse(&self) -> Result<()> {
        self.core().indicator_pulse()
    }

    /// ### Set Timeout
    ///
    /// Set a new logical I/O timeout for subsequent operations.
    ///
    pub fn set_timeout(&self, timeout: Duration) {
        self.core().set_timeout(timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.core().timeout()
    }

    /// Identity of the opened device.
    pub fn device_info(&self) -> DeviceInfo {
        self.core().device_info()
    }

    /// The capability record read at open time.
    pub fn capabilities(&self) -> Capabilities {
        *self.core().capabilities()
    }

    /// Current lifecycle state, for diagnostics.
    pub fn state(&self) -> DeviceState {
        self.core().state()
    }

    /// ### Close
    ///
    /// Release the interface and drop the handle. Dropping the handle has
    /// the same effect; `close` just makes the point explicit.
    ///
    pub fn close(self) -> Result<()> {
        let core = self.core.into_inner().unwrap_or_else(|e| e.into_inner());
        core.close();
        Ok(())
    }
}
