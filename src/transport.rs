//! ## Transport
//!
//! Narrow interface over libusb-1.0. The engine only ever talks to a
//! [`UsbTransport`]; `RusbTransport` adapts a claimed `rusb` device handle,
//! and the test suite substitutes a scripted instrument.
//!

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rusb::{Context, DeviceHandle};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// The transfer-and-control surface the engine consumes.
///
/// One implementor drives one claimed USBTMC interface. All calls are
/// synchronous; the timeout is the per-call deadline derived from the
/// handle's configured I/O timeout.
pub trait UsbTransport: Send {
    /// Class control transfer, device-to-host.
    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Single bulk-out transfer; returns the number of bytes accepted.
    fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Single bulk-in transfer; returns the number of bytes received.
    fn bulk_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Single interrupt-in transfer; returns the number of bytes received.
    fn interrupt_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Clear a halt/stall condition on an endpoint.
    fn clear_halt(&mut self, endpoint: u8) -> Result<()>;

    fn claim_interface(&mut self, interface_number: u8) -> Result<()>;

    fn release_interface(&mut self, interface_number: u8) -> Result<()>;

    /// Port-level device reset.
    fn reset_device(&mut self) -> Result<()>;
}

// The libusb context is process-wide: initialised when the first handle
// opens, dropped when the last one closes. Only init/teardown take the lock.
static SHARED_CONTEXT: Mutex<Weak<Context>> = Mutex::new(Weak::new());

/// Get the process-wide libusb context, initialising it if no handle
/// currently holds one.
pub(crate) fn shared_context() -> Result<Arc<Context>> {
    let mut slot = SHARED_CONTEXT.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(ctx) = slot.upgrade() {
        return Ok(ctx);
    }
    let ctx = Context::new().map_err(|e| {
        Error::Config(format!(
            "libusb initialisation failed: {e}. If libusb-1.0 is installed in a \
             non-standard location, note that LIBUSB_LIBRARY_PATH only affects \
             dlopen-based bindings; this crate links libusb at build time."
        ))
    })?;
    let ctx = Arc::new(ctx);
    *slot = Arc::downgrade(&ctx);
    debug!("initialised process-wide libusb context");
    Ok(ctx)
}

/// ### Rusb Transport
///
/// [`UsbTransport`] over a claimed `rusb` device handle. Releases the
/// interface and reattaches the kernel driver (when one was detached) on
/// drop.
///
pub struct RusbTransport {
    handle: DeviceHandle<Context>,
    interface_number: u8,
    had_kernel_driver: bool,
    // Keeps the process-wide context alive for the lifetime of the handle.
    _context: Arc<Context>,
}

impl RusbTransport {
    pub(crate) fn new(
        handle: DeviceHandle<Context>,
        interface_number: u8,
        had_kernel_driver: bool,
        context: Arc<Context>,
    ) -> RusbTransport {
        RusbTransport { handle, interface_number, had_kernel_driver, _context: context }
    }
}

impl UsbTransport for RusbTransport {
    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let n = self.handle.read_control(request_type, request, value, index, buf, timeout)?;
        Ok(n)
    }

    fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let n = self.handle.write_bulk(endpoint, data, timeout)?;
        Ok(n)
    }

    fn bulk_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self.handle.read_bulk(endpoint, buf, timeout)?;
        Ok(n)
    }

    fn interrupt_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self.handle.read_interrupt(endpoint, buf, timeout)?;
        Ok(n)
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        self.handle.clear_halt(endpoint)?;
        Ok(())
    }

    fn claim_interface(&mut self, interface_number: u8) -> Result<()> {
        self.handle.claim_interface(interface_number)?;
        Ok(())
    }

    fn release_interface(&mut self, interface_number: u8) -> Result<()> {
        self.handle.release_interface(interface_number)?;
        Ok(())
    }

    fn reset_device(&mut self) -> Result<()> {
        self.handle.reset()?;
        Ok(())
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface_number) {
            warn!("failed to release interface {}: {e}", self.interface_number);
        }
        if self.had_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface_number) {
                warn!("failed to reattach kernel driver to interface {}: {e}", self.interface_number);
            }
        }
    }
}
