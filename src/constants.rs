//! ## Constants
//!
//! Protocol constants used throughout the crate.
//!

#[allow(unused)]
pub mod usb {
    /// The class code for usbtmc
    pub const USBTMC_CLASS_CODE: u8 = 0xFE;
    /// The subclass code for usbtmc
    pub const USBTMC_SUBCLASS_CODE: u8 = 0x03;
    /// The protocol code for a plain USBTMC interface
    pub const USBTMC_PROTOCOL_CODE: u8 = 0x00;
    /// The protocol code for the USB488 sub-class of usbtmc
    pub const USB488_PROTOCOL_CODE: u8 = 0x01;
}

#[allow(unused)]
pub mod misc {
    use std::time::Duration;

    /// The default timeout duration
    pub const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_secs(2);
    /// The size in bytes of a USBTMC header in a bulk transfer
    pub const USBTMC_HEADER_SIZE: usize = 12;
    /// Default cap on the TransferSize field of a single bulk transfer
    pub const DEFAULT_MAX_TRANSFER_SIZE: u32 = 16 * 1024;
    /// Default termination character (NI-VISA default '\n')
    pub const DEFAULT_TERM_CHAR: u8 = b'\n';
    /// First backoff step when polling a PENDING split transaction
    pub const POLL_BACKOFF_START: Duration = Duration::from_millis(1);
    /// Backoff ceiling when polling a PENDING split transaction
    pub const POLL_BACKOFF_CAP: Duration = Duration::from_millis(100);
    /// CHECK_CLEAR_STATUS may stay PENDING far longer than an abort; bound the
    /// poll at this multiple of the I/O timeout before giving up.
    pub const CLEAR_BUDGET_MULTIPLIER: u32 = 10;
}

#[allow(unused)]
pub mod usbtmc_status {
    /// Success
    pub const STATUS_SUCCESS: u8 = 0x01;
    /// The device has received a split transaction CHECK_STATUS request and the request is being processed
    pub const STATUS_PENDING: u8 = 0x02;
    /// Failure for unspecified or undefined reason
    pub const STATUS_FAILED: u8 = 0x80;
    /// The device received an INITIATE_ABORT request, but the transfer is not in progress
    pub const STATUS_TRANSFER_NOT_IN_PROGRESS: u8 = 0x81;
    /// The device got a CHECK_STATUS request without any INITIATE request being processed
    pub const STATUS_SPLIT_NOT_IN_PROGRESS: u8 = 0x82;
    /// The device got an INITIATE request, but another one is already being processed
    pub const STATUS_SPLIT_IN_PROGRESS: u8 = 0x83;
    /// USB488: the interrupt-in endpoint is busy with a previous notification
    pub const STATUS_INTERRUPT_IN_BUSY: u8 = 0x20;
}

#[allow(unused)]
pub mod control_requests {
    // Requests defined by the USBTMC protocol.
    pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
    pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
    pub const INITIATE_ABORT_BULK_IN: u8 = 3;
    pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
    pub const INITIATE_CLEAR: u8 = 5;
    pub const CHECK_CLEAR_STATUS: u8 = 6;
    pub const GET_CAPABILITIES: u8 = 7;
    pub const INDICATOR_PULSE: u8 = 64;
    // Requests defined by the USB488 sub-protocol.
    pub const READ_STATUS_BYTE: u8 = 128;
    pub const REN_CONTROL: u8 = 160;
    pub const GO_TO_LOCAL: u8 = 161;
    pub const LOCAL_LOCKOUT: u8 = 162;
}

#[allow(unused)]
pub mod bulk_msg_id {
    pub const DEVICE_DEPENDENT_MSG_OUT: u8 = 1;
    pub const REQUEST_DEVICE_DEPENDENT_MSG_IN: u8 = 2;
    pub const DEVICE_DEPENDENT_MSG_IN: u8 = 2;
    pub const VENDOR_SPECIFIC_MSG_OUT: u8 = 126;
    pub const REQUEST_VENDOR_SPECIFIC_MSG_IN: u8 = 127;
    pub const VENDOR_SPECIFIC_MSG_IN: u8 = 127;
    /// USB488 trigger message, bulk-out, header only
    pub const USB488_TRIGGER: u8 = 128;
}
