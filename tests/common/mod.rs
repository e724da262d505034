//! A scripted USBTMC instrument behind the `UsbTransport` trait.
//!
//! The mock parses the host's bulk-out headers the way a device firmware
//! would, answers REQUEST_DEV_DEP_MSG_IN from a queue of canned messages,
//! and records every control request and bulk transfer for assertions.
//! Behavioural switches let individual tests misbehave on purpose.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use usbtmc::quirks::{Hooks, QuirksRecord};
use usbtmc::{
    DeviceCore, Endpoint, Error, InterfaceInfo, Result, UsbTransport, UsbtmcEndpoints,
};

pub const BULK_OUT_EP: u8 = 0x02;
pub const BULK_IN_EP: u8 = 0x82;
pub const INTERRUPT_EP: u8 = 0x83;
pub const INTERFACE: u8 = 0;
pub const MPS: usize = 64;
pub const TIMEOUT: Duration = Duration::from_millis(200);

pub const STATUS_SUCCESS: u8 = 0x01;
pub const STATUS_PENDING: u8 = 0x02;
pub const STATUS_FAILED: u8 = 0x80;
pub const STATUS_TRANSFER_NOT_IN_PROGRESS: u8 = 0x81;

pub const REQ_INITIATE_ABORT_BULK_OUT: u8 = 1;
pub const REQ_INITIATE_ABORT_BULK_IN: u8 = 3;
pub const REQ_CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
pub const REQ_INITIATE_CLEAR: u8 = 5;
pub const REQ_READ_STATUS_BYTE: u8 = 128;

const HEADER_SIZE: usize = 12;

/// A fully capable USB488 capability record.
pub fn default_capabilities() -> [u8; 24] {
    let mut caps = [0u8; 24];
    caps[0] = STATUS_SUCCESS;
    caps[2] = 0x00; // bcdUSBTMC 1.00
    caps[3] = 0x01;
    caps[4] = 0b0000_0100; // indicator pulse
    caps[5] = 0b0000_0001; // TermChar
    caps[12] = 0x00; // bcdUSB488 1.00
    caps[13] = 0x01;
    caps[14] = 0b0000_0111; // 488.2, remote-local, trigger
    caps[15] = 0b0000_1111; // SCPI, SR1, RL1, DT1
    caps
}

/// Behaviour switches for a single mock instrument.
pub struct MockBehavior {
    pub capabilities: [u8; 24],
    /// Cap on the payload the device puts in one bulk-in transfer.
    pub max_in_payload: Option<usize>,
    /// Omit the EOM bit on the final transfer of every message.
    pub omit_eom: bool,
    /// Prefix the next response with one stale transfer carrying a wrong bTag.
    pub wrong_btag_once: bool,
    /// Answer every request with wrong-bTag transfers only.
    pub wrong_btag_always: bool,
    /// Never answer bulk-in reads.
    pub unresponsive: bool,
    /// Echo completed host messages back as responses.
    pub echo: bool,
    pub stb: u8,
    /// Status byte delivered on the interrupt endpoint, when different.
    pub interrupt_stb: Option<u8>,
    pub abort_in_initiate_status: u8,
    pub abort_out_initiate_status: u8,
    /// PENDING answers before an abort status poll reports success.
    pub abort_in_pending_polls: usize,
    /// PENDING answers before a clear status poll reports success.
    pub clear_pending_polls: usize,
}

impl Default for MockBehavior {
    fn default() -> MockBehavior {
        MockBehavior {
            capabilities: default_capabilities(),
            max_in_payload: None,
            omit_eom: false,
            wrong_btag_once: false,
            wrong_btag_always: false,
            unresponsive: false,
            echo: false,
            stb: 0x00,
            interrupt_stb: None,
            abort_in_initiate_status: STATUS_SUCCESS,
            abort_out_initiate_status: STATUS_SUCCESS,
            abort_in_pending_polls: 0,
            clear_pending_polls: 0,
        }
    }
}

#[derive(Default)]
pub struct MockState {
    pub behavior: MockBehavior,
    /// Canned device replies, one complete message each.
    pub responses: VecDeque<Vec<u8>>,
    current_message: Option<Vec<u8>>,
    out_message: Vec<u8>,
    in_transfers: VecDeque<Vec<u8>>,
    interrupt_queue: VecDeque<Vec<u8>>,
    abort_pending_left: usize,
    clear_pending_left: usize,
    /// Every bulk-out transfer as received, headers included.
    pub bulk_out_transfers: Vec<Vec<u8>>,
    /// Every control request as `(bRequest, wValue)`.
    pub control_log: Vec<(u8, u16)>,
    pub clear_halt_log: Vec<u8>,
    pub trigger_count: usize,
    pub clear_count: usize,
    pub claim_count: usize,
    pub release_count: usize,
}

impl MockState {
    /// Count of control requests with the given bRequest code.
    pub fn control_requests(&self, request: u8) -> usize {
        self.control_log.iter().filter(|(r, _)| *r == request).count()
    }

    /// Bulk-out transfers whose MsgID matches.
    pub fn out_transfers_with_msg_id(&self, msg_id: u8) -> Vec<Vec<u8>> {
        self.bulk_out_transfers
            .iter()
            .filter(|t| t.first() == Some(&msg_id))
            .cloned()
            .collect()
    }

    fn push_in_transfer(&mut self, transfer: Vec<u8>) {
        let boundary = !transfer.is_empty() && transfer.len() % MPS == 0;
        self.in_transfers.push_back(transfer);
        if boundary {
            // The standard obliges a terminating short packet here.
            self.in_transfers.push_back(Vec::new());
        }
    }

    fn reset_io(&mut self) {
        self.out_message.clear();
        self.in_transfers.clear();
        self.interrupt_queue.clear();
        self.current_message = None;
        self.responses.clear();
    }

    fn handle_request_in(&mut self, btag: u8, requested: usize) {
        if self.behavior.unresponsive {
            return;
        }
        if self.behavior.wrong_btag_always {
            for _ in 0..2 {
                self.push_in_transfer(build_in_transfer(btag.wrapping_add(1), b"junk", false));
            }
            return;
        }
        if requested == 0 {
            // Probe: answer immediately with a header-only EOM transfer.
            self.push_in_transfer(build_in_transfer(btag, &[], true));
            return;
        }
        if self.current_message.is_none() {
            self.current_message = self.responses.pop_front();
        }
        let Some(message) = self.current_message.as_mut() else {
            return; // nothing to say; the host read will time out
        };

        let cap = self.behavior.max_in_payload.unwrap_or(usize::MAX);
        let take = requested.min(cap).min(message.len());
        let payload: Vec<u8> = message.drain(..take).collect();
        let done = message.is_empty();
        if done {
            self.current_message = None;
        }
        let eom = done && !self.behavior.omit_eom;

        if self.behavior.wrong_btag_once {
            self.behavior.wrong_btag_once = false;
            self.push_in_transfer(build_in_transfer(btag.wrapping_add(1), &payload, eom));
        }
        self.push_in_transfer(build_in_transfer(btag, &payload, eom));
    }

    fn handle_bulk_out(&mut self, data: &[u8]) {
        self.bulk_out_transfers.push(data.to_vec());
        if data.len() < HEADER_SIZE {
            return;
        }
        let msg_id = data[0];
        let btag = data[1];
        let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        match msg_id {
            1 => {
                let payload_end = (HEADER_SIZE + size).min(data.len());
                self.out_message.extend_from_slice(&data[HEADER_SIZE..payload_end]);
                if data[8] & 0x01 != 0 {
                    let message = std::mem::take(&mut self.out_message);
                    if self.behavior.echo {
                        self.responses.push_back(message);
                    }
                }
            }
            2 => self.handle_request_in(btag, size),
            128 => self.trigger_count += 1,
            _ => {}
        }
    }

    fn handle_control(&mut self, request: u8, value: u16, buf: &mut [u8]) -> Result<usize> {
        self.control_log.push((request, value));
        buf.fill(0);
        match request {
            7 => buf[..24].copy_from_slice(&self.behavior.capabilities),
            1 => {
                buf[0] = self.behavior.abort_out_initiate_status;
                buf[1] = value as u8;
            }
            2 => buf[0] = STATUS_SUCCESS,
            3 => {
                buf[0] = self.behavior.abort_in_initiate_status;
                buf[1] = value as u8;
                self.abort_pending_left = self.behavior.abort_in_pending_polls;
                self.in_transfers.clear();
                self.current_message = None;
            }
            4 => {
                if self.abort_pending_left > 0 {
                    self.abort_pending_left -= 1;
                    buf[0] = STATUS_PENDING;
                } else {
                    buf[0] = STATUS_SUCCESS;
                }
            }
            5 => {
                buf[0] = STATUS_SUCCESS;
                self.clear_pending_left = self.behavior.clear_pending_polls;
                self.clear_count += 1;
                self.reset_io();
            }
            6 => {
                if self.clear_pending_left > 0 {
                    self.clear_pending_left -= 1;
                    buf[0] = STATUS_PENDING;
                } else {
                    buf[0] = STATUS_SUCCESS;
                }
            }
            64 => buf[0] = STATUS_SUCCESS,
            128 => {
                buf[0] = STATUS_SUCCESS;
                buf[1] = value as u8;
                buf[2] = self.behavior.stb;
                let stb = self.behavior.interrupt_stb.unwrap_or(self.behavior.stb);
                self.interrupt_queue.push_back(vec![0x80 | value as u8, stb]);
            }
            160..=162 => buf[0] = STATUS_SUCCESS,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "mock: unexpected control request {other}"
                )))
            }
        }
        Ok(buf.len())
    }
}

fn build_in_transfer(btag: u8, payload: &[u8], eom: bool) -> Vec<u8> {
    let mut transfer = Vec::with_capacity(HEADER_SIZE + payload.len() + 3);
    transfer.push(2); // DEV_DEP_MSG_IN
    transfer.push(btag);
    transfer.push(!btag);
    transfer.push(0);
    transfer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    transfer.push(if eom { 0x01 } else { 0x00 });
    transfer.extend_from_slice(&[0, 0, 0]);
    transfer.extend_from_slice(payload);
    while transfer.len() % 4 != 0 {
        transfer.push(0);
    }
    transfer
}

/// Cloneable handle to a shared mock instrument.
#[derive(Clone)]
pub struct MockTransport(Arc<Mutex<MockState>>);

impl MockTransport {
    pub fn new(behavior: MockBehavior) -> MockTransport {
        MockTransport(Arc::new(Mutex::new(MockState { behavior, ..Default::default() })))
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    /// Queue one complete device reply.
    pub fn push_response(&self, message: &[u8]) {
        self.state().responses.push_back(message.to_vec());
    }
}

impl UsbTransport for MockTransport {
    fn control_in(
        &mut self,
        _request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        self.state().handle_control(request, value, buf)
    }

    fn bulk_write(&mut self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        assert_eq!(endpoint, BULK_OUT_EP, "bulk-out transfer on wrong endpoint");
        self.state().handle_bulk_out(data);
        Ok(data.len())
    }

    fn bulk_read(&mut self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        assert_eq!(endpoint, BULK_IN_EP, "bulk-in transfer on wrong endpoint");
        let Some(transfer) = self.state().in_transfers.pop_front() else {
            return Err(Error::IoTimeout);
        };
        if transfer.len() > buf.len() {
            return Err(Error::ProtocolViolation(format!(
                "mock: host buffer ({}) smaller than transfer ({})",
                buf.len(),
                transfer.len()
            )));
        }
        buf[..transfer.len()].copy_from_slice(&transfer);
        Ok(transfer.len())
    }

    fn interrupt_read(&mut self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        assert_eq!(endpoint, INTERRUPT_EP, "interrupt transfer on wrong endpoint");
        let Some(notification) = self.state().interrupt_queue.pop_front() else {
            return Err(Error::IoTimeout);
        };
        buf[..notification.len()].copy_from_slice(&notification);
        Ok(notification.len())
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        self.state().clear_halt_log.push(endpoint);
        Ok(())
    }

    fn claim_interface(&mut self, _interface_number: u8) -> Result<()> {
        self.state().claim_count += 1;
        Ok(())
    }

    fn release_interface(&mut self, _interface_number: u8) -> Result<()> {
        self.state().release_count += 1;
        Ok(())
    }

    fn reset_device(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Interface layout matching the mock's endpoints.
pub fn interface_info() -> InterfaceInfo {
    InterfaceInfo {
        vendor_id: 0x0957,
        product_id: 0x1755,
        revision: 0x0100,
        serial_number: Some("MY1234".into()),
        manufacturer: Some("Mock Instruments".into()),
        product: Some("Scriptable DMM".into()),
        bus: 1,
        address: 5,
        interface_number: INTERFACE,
        interface_protocol: 1,
        endpoints: UsbtmcEndpoints {
            bulk_out_ep: Endpoint { address: BULK_OUT_EP, max_packet_size: MPS as u16 },
            bulk_in_ep: Endpoint { address: BULK_IN_EP, max_packet_size: MPS as u16 },
            interrupt_ep: Some(Endpoint { address: INTERRUPT_EP, max_packet_size: 8 }),
        },
    }
}

pub fn open_core(mock: &MockTransport) -> DeviceCore<MockTransport> {
    open_core_with(mock, QuirksRecord::default())
}

pub fn open_core_with(mock: &MockTransport, quirks: QuirksRecord) -> DeviceCore<MockTransport> {
    DeviceCore::open(mock.clone(), interface_info(), quirks, Hooks::default(), TIMEOUT)
        .expect("mock open failed")
}
