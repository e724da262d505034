//! ## Device
//!
//! The per-handle engine: owns the transport, the bTag counters and the
//! lifecycle state, and drives the transaction engine and control layer
//! through abort and clear recovery.
//!

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::communication::{bulk, control};
use crate::constants::{control_requests, misc, usb, usbtmc_status};
use crate::error::{Error, Result};
use crate::quirks::{AbortRecoveryPolicy, Hook, HookAction, HookContext, Hooks, QuirksRecord, StbChannel};
use crate::transport::UsbTransport;
use crate::types::{
    BTag, CancelToken, DeviceAddr, DeviceId, DeviceInfo, DeviceState, Direction, InterfaceInfo,
    RsbTag, Transaction,
};

/// Read bulk-in transfers until the device terminates with a short packet.
/// Used when CHECK_*_STATUS asks the host to empty the device FIFO.
fn drain_bulk_in<T: UsbTransport>(
    transport: &mut T,
    endpoint: u8,
    max_packet_size: usize,
    timeout: Duration,
) -> Result<()> {
    let mut buffer = vec![0u8; max_packet_size.max(1)];
    loop {
        let n = transport.bulk_read(endpoint, &mut buffer, timeout)?;
        if n < buffer.len() {
            return Ok(());
        }
    }
}

/// ### Device Core
///
/// One opened USBTMC interface. All operations are synchronous and assume
/// the caller holds the handle's exclusive lock; the engine itself enforces
/// the lifecycle state machine.
///
pub struct DeviceCore<T: UsbTransport> {
    transport: T,
    info: InterfaceInfo,
    capabilities: crate::types::Capabilities,
    quirks: QuirksRecord,
    hooks: Hooks,
    btag: BTag,
    rsb_tag: RsbTag,
    state: DeviceState,
    timeout: Duration,
}

impl<T: UsbTransport> DeviceCore<T> {
    /// ### Open
    ///
    /// Bring up an engine over an already-located USBTMC interface: claim
    /// it, read the capability record, and apply the open-time quirks
    /// (initial clear, remote enable).
    ///
    pub fn open(
        mut transport: T,
        info: InterfaceInfo,
        quirks: QuirksRecord,
        hooks: Hooks,
        timeout: Duration,
    ) -> Result<DeviceCore<T>> {
        if let Some(hook) = hooks.pre_open.clone() {
            let ctx = HookContext {
                vendor_id: info.vendor_id,
                product_id: info.product_id,
                state: DeviceState::Closed,
                transaction: None,
            };
            if let HookAction::Fail(e) = hook(&ctx) {
                return Err(e);
            }
        }

        transport.claim_interface(info.interface_number)?;
        let capabilities = control::get_capabilities(&mut transport, info.interface_number, timeout)?;
        debug!(
            "opened {:04x}:{:04x} interface {} (usbtmc {:#06x}, usb488 {:#06x})",
            info.vendor_id, info.product_id, info.interface_number,
            capabilities.bcd_usbtmc, capabilities.bcd_usb488,
        );

        let mut core = DeviceCore {
            transport,
            info,
            capabilities,
            quirks,
            hooks,
            btag: BTag::new(),
            rsb_tag: RsbTag::new(),
            state: DeviceState::Idle,
            timeout,
        };

        if core.quirks.requires_clear_before_first_io {
            core.clear()?;
        }
        if core.quirks.remote_at_open {
            core.remote()?;
        }
        core.run_hook(core.hooks.post_open.clone(), None)?;
        Ok(core)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn capabilities(&self) -> &crate::types::Capabilities {
        &self.capabilities
    }

    pub fn quirks(&self) -> &QuirksRecord {
        &self.quirks
    }

    pub fn interface_info(&self) -> &InterfaceInfo {
        &self.info
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId { vendor_id: self.info.vendor_id, product_id: self.info.product_id },
            address: DeviceAddr { bus: self.info.bus, device: self.info.address },
            manufacturer: self.info.manufacturer.clone(),
            product: self.info.product.clone(),
            serial_number: self.info.serial_number.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Release the interface and drop the handle.
    pub fn close(mut self) {
        self.state = DeviceState::Closed;
        debug!("closing {:04x}:{:04x}", self.info.vendor_id, self.info.product_id);
    }

    fn gates_enforced(&self) -> bool {
        !self.quirks.ignore_capabilities_flags
    }

    fn require_usb488(&self, what: &'static str) -> Result<()> {
        if self.gates_enforced() && self.info.interface_protocol != usb::USB488_PROTOCOL_CODE {
            return Err(Error::Unsupported(what));
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.state {
            DeviceState::Idle => Ok(()),
            DeviceState::Halted => Err(Error::Halted),
            _ => Err(Error::Busy),
        }
    }

    fn run_hook(&self, hook: Option<Hook>, tx: Option<&Transaction>) -> Result<Option<Transaction>> {
        let Some(hook) = hook else { return Ok(None) };
        let ctx = HookContext {
            vendor_id: self.info.vendor_id,
            product_id: self.info.product_id,
            state: self.state,
            transaction: tx,
        };
        match hook(&ctx) {
            HookAction::Continue => Ok(None),
            HookAction::Replace(replacement) => Ok(Some(replacement)),
            HookAction::Fail(e) => Err(e),
        }
    }

    /// ### Write
    ///
    /// Send one complete message (End-Of-Message on the final segment).
    /// Returns the number of payload bytes written.
    ///
    pub fn write(&mut self, bytes: &[u8], cancel: Option<CancelToken>) -> Result<usize> {
        self.write_message(bytes, true, cancel)
    }

    pub fn write_message(
        &mut self,
        bytes: &[u8],
        end_of_message: bool,
        cancel: Option<CancelToken>,
    ) -> Result<usize> {
        self.ensure_idle()?;
        if bytes.is_empty() {
            return Err(Error::Unsupported("zero-length host-to-device messages"));
        }
        if self.gates_enforced() && self.capabilities.is_talk_only {
            return Err(Error::Unsupported("device is talk-only"));
        }

        let mut tx = Transaction::new(Direction::Out, bytes.len(), self.timeout, cancel);
        tx.buffer = bytes.to_vec();
        if let Some(replacement) = self.run_hook(self.hooks.before_write.clone(), Some(&tx))? {
            tx = replacement;
        }

        self.state = DeviceState::Writing;
        let result = bulk::write_message(
            &mut self.transport,
            &self.info.endpoints,
            &mut self.btag,
            &self.quirks,
            &mut tx,
            end_of_message,
        );
        match result {
            Ok(written) => {
                self.state = DeviceState::Idle;
                if end_of_message && self.quirks.post_write_settle_us > 0 {
                    thread::sleep(Duration::from_micros(self.quirks.post_write_settle_us));
                }
                self.run_hook(self.hooks.after_write.clone(), Some(&tx))?;
                Ok(written)
            }
            Err(e) => Err(self.recover_bulk_failure(Direction::Out, tx.btag, e)),
        }
    }

    /// ### Read
    ///
    /// Read a message of at most `max_bytes`, optionally letting the device
    /// terminate early at `term_char`. Returns the bytes (terminator left
    /// intact) and whether End-Of-Message was seen.
    ///
    pub fn read(
        &mut self,
        max_bytes: usize,
        term_char: Option<u8>,
        cancel: Option<CancelToken>,
    ) -> Result<(Vec<u8>, bool)> {
        self.ensure_idle()?;
        if self.gates_enforced() {
            if self.capabilities.is_listen_only {
                return Err(Error::Unsupported("device is listen-only"));
            }
            if term_char.is_some() && !self.capabilities.supports_bulk_in_term_char {
                return Err(Error::Unsupported("device does not accept a termination character"));
            }
        }

        let mut tx = Transaction::new(Direction::In, max_bytes, self.timeout, cancel);
        if let Some(replacement) = self.run_hook(self.hooks.before_read.clone(), Some(&tx))? {
            tx = replacement;
        }

        self.state = DeviceState::Reading;
        let result = bulk::read_message(
            &mut self.transport,
            &self.info.endpoints,
            &mut self.btag,
            &self.quirks,
            &mut tx,
            term_char,
        );
        match result {
            Ok(outcome) => {
                self.state = DeviceState::Idle;
                self.run_hook(self.hooks.after_read.clone(), Some(&tx))?;
                Ok((outcome.data, outcome.end_of_message))
            }
            Err(e) => Err(self.recover_bulk_failure(Direction::In, tx.btag, e)),
        }
    }

    /// Write then read while the caller keeps holding the handle lock.
    pub fn query(
        &mut self,
        bytes: &[u8],
        max_bytes: usize,
        cancel: Option<CancelToken>,
    ) -> Result<(Vec<u8>, bool)> {
        self.write(bytes, cancel.clone())?;
        self.read(max_bytes, None, cancel)
    }

    /// ### Trigger
    ///
    /// Send the USB488 trigger bulk message (MsgID 128, header only).
    ///
    pub fn trigger(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.require_usb488("trigger requires a USB488 interface")?;
        if self.gates_enforced() && !self.capabilities.accepts_trigger {
            return Err(Error::Unsupported("device does not accept the trigger message"));
        }

        self.state = DeviceState::Writing;
        let mut tx = Transaction::new(Direction::Out, 0, self.timeout, None);
        match bulk::send_trigger(&mut self.transport, &self.info.endpoints, &mut self.btag, &mut tx)
        {
            Ok(()) => {
                self.state = DeviceState::Idle;
                Ok(())
            }
            Err(e) => Err(self.recover_bulk_failure(Direction::Out, tx.btag, e)),
        }
    }

    /// ### Read Status Byte
    ///
    /// Fetch the IEEE-488 status byte over the channel the device's quirks
    /// select; `Both` cross-checks the two channels against each other.
    ///
    pub fn read_stb(&mut self) -> Result<u8> {
        self.ensure_idle()?;
        self.require_usb488("the status byte requires a USB488 interface")?;

        match self.quirks.read_status_byte_via {
            StbChannel::Control => self.read_stb_control(),
            StbChannel::Interrupt => self.read_stb_interrupt(),
            StbChannel::Both => {
                let via_interrupt = self.read_stb_interrupt()?;
                let via_control = self.read_stb_control()?;
                if via_interrupt != via_control {
                    return Err(Error::ProtocolViolation(format!(
                        "status byte disagrees between channels \
                         (interrupt {via_interrupt:#04x}, control {via_control:#04x})"
                    )));
                }
                Ok(via_control)
            }
        }
    }

    fn read_stb_control(&mut self) -> Result<u8> {
        let tag = self.rsb_tag.next();
        let response = control::read_status_byte_request(
            &mut self.transport,
            self.info.interface_number,
            tag,
            self.timeout,
        )?;
        Ok(response[2])
    }

    fn read_stb_interrupt(&mut self) -> Result<u8> {
        let Some(interrupt_ep) = self.info.endpoints.interrupt_ep else {
            warn!("status byte routed to the interrupt endpoint but none exists; using control");
            return self.read_stb_control();
        };

        let tag = self.rsb_tag.next();
        control::read_status_byte_request(
            &mut self.transport,
            self.info.interface_number,
            tag,
            self.timeout,
        )?;

        let mut notification = [0u8; 2];
        let n = self.transport.interrupt_read(interrupt_ep.address, &mut notification, self.timeout)?;
        if n < 2 {
            return Err(Error::ProtocolViolation(format!(
                "status byte notification is short ({n} bytes)"
            )));
        }
        if notification[0] != 0x80 | tag {
            return Err(Error::ProtocolViolation(format!(
                "status byte notification carries tag {:#04x}, expected {:#04x}",
                notification[0],
                0x80 | tag
            )));
        }
        Ok(notification[1])
    }

    /// ### Indicator Pulse
    ///
    /// Blink the device's activity indicator.
    ///
    pub fn indicator_pulse(&mut self) -> Result<()> {
        self.ensure_idle()?;
        if self.gates_enforced() && !self.capabilities.accepts_indicator_pulse_request {
            return Err(Error::Unsupported("device does not support the indicator pulse"));
        }
        control::indicator_pulse(&mut self.transport, self.info.interface_number, self.timeout)
    }

    fn require_remote_local(&self) -> Result<()> {
        self.require_usb488("remote/local control requires a USB488 interface")?;
        if self.gates_enforced() && !self.capabilities.accepts_remote_local {
            return Err(Error::Unsupported("device does not accept remote/local commands"));
        }
        Ok(())
    }

    /// Assert remote enable.
    pub fn remote(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.require_remote_local()?;
        control::ren_control(&mut self.transport, self.info.interface_number, true, self.timeout)
    }

    /// Return the device to front-panel control.
    pub fn local(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.require_remote_local()?;
        control::go_to_local(&mut self.transport, self.info.interface_number, self.timeout)
    }

    /// Lock the front panel.
    pub fn lock(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.require_remote_local()?;
        control::local_lockout(&mut self.transport, self.info.interface_number, self.timeout)
    }

    /// Drop remote enable, releasing a local lockout.
    pub fn unlock(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.require_remote_local()?;
        control::ren_control(&mut self.transport, self.info.interface_number, false, self.timeout)
    }

    /// ### Clear
    ///
    /// Run the INITIATE_CLEAR sequence and reset the bTag counter. This is
    /// also the only way out of the `Halted` state.
    ///
    pub fn clear(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Idle | DeviceState::Halted => {}
            _ => return Err(Error::Busy),
        }
        self.state = DeviceState::Clearing;
        match self.clear_sequence() {
            Ok(()) => {
                self.state = DeviceState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Halted;
                Err(e)
            }
        }
    }

    fn clear_sequence(&mut self) -> Result<()> {
        if self.quirks.clear_disabled {
            debug!("interface clear disabled for this device; resetting host state only");
            self.btag.reset();
            return Ok(());
        }

        let iface = self.info.interface_number;
        let status = control::initiate_clear(&mut self.transport, iface, self.timeout)?;
        if status != usbtmc_status::STATUS_SUCCESS {
            return Err(Error::DeviceStatusFailed {
                request: control_requests::INITIATE_CLEAR,
                status,
            });
        }

        // A device may keep answering PENDING for a long time while it empties
        // its buffers; bound the poll at a multiple of the I/O timeout.
        let budget = self.timeout * misc::CLEAR_BUDGET_MULTIPLIER;
        let timeout = self.timeout;
        let bulk_in = self.info.endpoints.bulk_in_ep;
        let skip_drain = self.quirks.clear_skip_intermediate_reads;
        {
            let transport = &mut self.transport;
            control::poll_with_backoff(budget, || {
                let (status, bm_clear) = control::check_clear_status(transport, iface, timeout)?;
                match status {
                    usbtmc_status::STATUS_SUCCESS => Ok(Some(())),
                    usbtmc_status::STATUS_PENDING => {
                        if !skip_drain && bm_clear & 0x01 != 0 {
                            drain_bulk_in(
                                transport,
                                bulk_in.address,
                                bulk_in.max_packet_size as usize,
                                timeout,
                            )?;
                        }
                        Ok(None)
                    }
                    other => Err(Error::DeviceStatusFailed {
                        request: control_requests::CHECK_CLEAR_STATUS,
                        status: other,
                    }),
                }
            })
            .map_err(|e| match e {
                Error::IoTimeout => Error::DeviceStatusFailed {
                    request: control_requests::CHECK_CLEAR_STATUS,
                    status: usbtmc_status::STATUS_PENDING,
                },
                other => other,
            })?;
        }

        self.transport.clear_halt(self.info.endpoints.bulk_out_ep.address)?;
        if self.quirks.clear_resets_bulk_in {
            self.transport.clear_halt(self.info.endpoints.bulk_in_ep.address)?;
        }
        self.btag.reset();
        debug!("interface cleared; bTag counter reset");
        Ok(())
    }

    /// Route a failed bulk operation through abort recovery and decide the
    /// final handle state. Returns the error to surface to the caller.
    fn recover_bulk_failure(&mut self, direction: Direction, btag: u8, err: Error) -> Error {
        self.state = DeviceState::Aborting;

        if let Some(hook) = self.hooks.abort_override.clone() {
            let ctx = HookContext {
                vendor_id: self.info.vendor_id,
                product_id: self.info.product_id,
                state: self.state,
                transaction: None,
            };
            if let HookAction::Fail(e) = hook(&ctx) {
                self.state = DeviceState::Halted;
                return e;
            }
        }

        match err {
            Error::IoTimeout | Error::Cancelled => match self.abort_transfer(direction, btag) {
                Ok(()) => {
                    self.state = DeviceState::Idle;
                    err
                }
                Err(abort_err) => self.apply_abort_policy(abort_err, err),
            },
            Error::ProtocolViolation(_) => {
                if let Err(e) = self.abort_transfer(direction, btag) {
                    warn!("best-effort abort after protocol violation failed: {e}");
                }
                self.state = DeviceState::Halted;
                err
            }
            other => {
                self.state = DeviceState::Halted;
                other
            }
        }
    }

    fn apply_abort_policy(&mut self, abort_err: Error, original: Error) -> Error {
        warn!("abort recovery failed ({abort_err}); applying {:?} policy", self.quirks.abort_recovery_policy);
        match self.quirks.abort_recovery_policy {
            AbortRecoveryPolicy::Spec => {
                self.state = DeviceState::Halted;
                original
            }
            AbortRecoveryPolicy::Clear => match self.clear_sequence() {
                Ok(()) => {
                    self.state = DeviceState::Idle;
                    original
                }
                Err(e) => {
                    warn!("clear after failed abort also failed: {e}");
                    self.state = DeviceState::Halted;
                    original
                }
            },
            AbortRecoveryPolicy::Reopen => {
                let iface = self.info.interface_number;
                let reopened = match self.transport.release_interface(iface) {
                    Ok(()) => self.transport.claim_interface(iface),
                    Err(e) => Err(e),
                };
                match reopened {
                    Ok(()) => {
                        self.btag.reset();
                        self.state = DeviceState::Idle;
                        original
                    }
                    Err(e) => {
                        warn!("reopen after failed abort also failed: {e}");
                        self.state = DeviceState::Halted;
                        original
                    }
                }
            }
        }
    }

    fn abort_transfer(&mut self, direction: Direction, btag: u8) -> Result<()> {
        match direction {
            Direction::In => self.abort_bulk_in(btag),
            Direction::Out => self.abort_bulk_out(btag),
        }
    }

    fn abort_bulk_in(&mut self, btag: u8) -> Result<()> {
        let endpoint = self.info.endpoints.bulk_in_ep;
        let status =
            control::initiate_abort_bulk_in(&mut self.transport, endpoint.address, btag, self.timeout)?;
        match status {
            usbtmc_status::STATUS_SUCCESS | usbtmc_status::STATUS_PENDING => {
                let timeout = self.timeout;
                let transport = &mut self.transport;
                control::poll_with_backoff(timeout, || {
                    let (status, flags) =
                        control::check_abort_bulk_in_status(transport, endpoint.address, timeout)?;
                    match status {
                        usbtmc_status::STATUS_SUCCESS => Ok(Some(())),
                        usbtmc_status::STATUS_PENDING => {
                            if flags & 0x01 != 0 {
                                drain_bulk_in(
                                    transport,
                                    endpoint.address,
                                    endpoint.max_packet_size as usize,
                                    timeout,
                                )?;
                            }
                            Ok(None)
                        }
                        other => Err(Error::DeviceStatusFailed {
                            request: control_requests::CHECK_ABORT_BULK_IN_STATUS,
                            status: other,
                        }),
                    }
                })?;
                self.transport.clear_halt(endpoint.address)
            }
            usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS => Ok(()),
            other => Err(Error::DeviceStatusFailed {
                request: control_requests::INITIATE_ABORT_BULK_IN,
                status: other,
            }),
        }
    }

    fn abort_bulk_out(&mut self, btag: u8) -> Result<()> {
        let endpoint = self.info.endpoints.bulk_out_ep;
        let status =
            control::initiate_abort_bulk_out(&mut self.transport, endpoint.address, btag, self.timeout)?;
        match status {
            usbtmc_status::STATUS_SUCCESS | usbtmc_status::STATUS_PENDING => {
                let timeout = self.timeout;
                let transport = &mut self.transport;
                control::poll_with_backoff(timeout, || {
                    let (status, _nbytes) =
                        control::check_abort_bulk_out_status(transport, endpoint.address, timeout)?;
                    match status {
                        usbtmc_status::STATUS_SUCCESS => Ok(Some(())),
                        usbtmc_status::STATUS_PENDING => Ok(None),
                        other => Err(Error::DeviceStatusFailed {
                            request: control_requests::CHECK_ABORT_BULK_OUT_STATUS,
                            status: other,
                        }),
                    }
                })?;
                self.transport.clear_halt(endpoint.address)
            }
            usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS => Ok(()),
            other => Err(Error::DeviceStatusFailed {
                request: control_requests::INITIATE_ABORT_BULK_OUT,
                status: other,
            }),
        }
    }
}
