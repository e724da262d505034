//! Frame
//!
//! Codec for the 12-byte USBTMC bulk transfer headers.
//!
//! Header layout, offsets in bytes: `[0]`=MsgID, `[1]`=bTag,
//! `[2]`=bTagInverse, `[3]`=reserved, `[4..8]`=TransferSize (little-endian),
//! `[8]`=bmTransferAttributes, `[9]`=TermChar (requests only),
//! `[10..12]`=reserved.
//!

use crate::constants::{bulk_msg_id, misc};
use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = misc::USBTMC_HEADER_SIZE;

const ATTR_EOM: u8 = 0b0000_0001;
const ATTR_TERM_CHAR: u8 = 0b0000_0010;

/// Round `len` up to the 4-byte alignment required for bulk payloads.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Append zero padding so the payload after a header ends on a 4-byte
/// boundary.
pub fn pad_to_alignment(transfer: &mut Vec<u8>) {
    let payload_len = transfer.len() - HEADER_SIZE;
    transfer.resize(HEADER_SIZE + padded_len(payload_len), 0x00);
}

fn base_header(msg_id: u8, btag: u8, transfer_size: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0x00; HEADER_SIZE];
    header[0] = msg_id;
    header[1] = btag;
    header[2] = !btag;
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    header
}

/// Header of a DEV_DEP_MSG_OUT transfer carrying `transfer_size` payload
/// bytes, with the End-Of-Message bit set on the final segment.
pub fn dev_dep_msg_out(btag: u8, transfer_size: u32, end_of_message: bool) -> [u8; HEADER_SIZE] {
    let mut header = base_header(bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT, btag, transfer_size);
    if end_of_message {
        header[8] |= ATTR_EOM;
    }
    header
}

/// Header of a REQUEST_DEV_DEP_MSG_IN transfer asking the device for at most
/// `transfer_size` bytes, optionally terminated early at `term_char`.
pub fn request_dev_dep_msg_in(
    btag: u8,
    transfer_size: u32,
    term_char: Option<u8>,
) -> [u8; HEADER_SIZE] {
    let mut header =
        base_header(bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN, btag, transfer_size);
    if let Some(tc) = term_char {
        header[8] |= ATTR_TERM_CHAR;
        header[9] = tc;
    }
    header
}

/// Header of a VENDOR_SPECIFIC_MSG_OUT transfer.
pub fn vendor_specific_out(btag: u8, transfer_size: u32) -> [u8; HEADER_SIZE] {
    base_header(bulk_msg_id::VENDOR_SPECIFIC_MSG_OUT, btag, transfer_size)
}

/// Header of a REQUEST_VENDOR_SPECIFIC_MSG_IN transfer.
pub fn request_vendor_specific_in(btag: u8, transfer_size: u32) -> [u8; HEADER_SIZE] {
    base_header(bulk_msg_id::REQUEST_VENDOR_SPECIFIC_MSG_IN, btag, transfer_size)
}

/// Header-only USB488 trigger message.
pub fn trigger(btag: u8) -> [u8; HEADER_SIZE] {
    base_header(bulk_msg_id::USB488_TRIGGER, btag, 0)
}

/// Decoded header of a DEV_DEP_MSG_IN response transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkInHeader {
    pub btag: u8,
    /// Number of payload bytes the device announces for this transfer.
    pub transfer_size: u32,
    /// End-Of-Message: this is the last transfer of the message.
    pub end_of_message: bool,
    /// The transfer ended because the TermChar was hit.
    pub term_char_seen: bool,
}

/// Validation knobs for [`decode_bulk_in`], driven by the device quirks.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeOptions {
    /// Do not reject headers whose reserved bytes are nonzero.
    pub tolerate_reserved_bytes: bool,
    /// Do not require TransferSize to fit in the received transfer (for
    /// devices that report the padded size).
    pub tolerate_size_overrun: bool,
}

/// Decode and validate the header of a bulk-in transfer.
///
/// `transfer` is the complete transfer as received, header included.
pub fn decode_bulk_in(transfer: &[u8], options: DecodeOptions) -> Result<BulkInHeader> {
    if transfer.len() < HEADER_SIZE {
        return Err(Error::ProtocolViolation(format!(
            "bulk-in transfer is too short ({} bytes)",
            transfer.len()
        )));
    }

    let msg_id = transfer[0];
    if msg_id != bulk_msg_id::DEVICE_DEPENDENT_MSG_IN {
        return Err(Error::bad_header("unexpected bulk-in message id", transfer));
    }

    let btag = transfer[1];
    if transfer[2] != !btag {
        return Err(Error::bad_header("bTagInverse does not match bTag", transfer));
    }

    if !options.tolerate_reserved_bytes {
        let reserved_clear = transfer[3] == 0
            && (transfer[8] & !(ATTR_EOM | ATTR_TERM_CHAR)) == 0
            && transfer[9..HEADER_SIZE].iter().all(|b| *b == 0);
        if !reserved_clear {
            return Err(Error::bad_header("reserved header bytes are nonzero", transfer));
        }
    }

    let transfer_size = u32::from_le_bytes([transfer[4], transfer[5], transfer[6], transfer[7]]);
    if !options.tolerate_size_overrun && (transfer_size as usize) > transfer.len() - HEADER_SIZE {
        return Err(Error::bad_header(
            "announced TransferSize exceeds the received transfer",
            transfer,
        ));
    }

    Ok(BulkInHeader {
        btag,
        transfer_size,
        end_of_message: transfer[8] & ATTR_EOM != 0,
        term_char_seen: transfer[8] & ATTR_TERM_CHAR != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idn_query_header_matches_wire_capture() {
        // *IDN?\n with bTag 1, single segment.
        let header = dev_dep_msg_out(1, 6, true);
        assert_eq!(
            header,
            [0x01, 0x01, 0xFE, 0x00, 0x06, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn request_header_carries_term_char() {
        let header = request_dev_dep_msg_in(3, 512, Some(b'\n'));
        assert_eq!(header[0], 2);
        assert_eq!(header[1], 3);
        assert_eq!(header[2], !3u8);
        assert_eq!(&header[4..8], &512u32.to_le_bytes());
        assert_eq!(header[8], 0b0000_0010);
        assert_eq!(header[9], b'\n');
    }

    #[test]
    fn decode_rejects_btag_inverse_mismatch() {
        let mut transfer = vec![0u8; HEADER_SIZE];
        transfer[0] = 2;
        transfer[1] = 5;
        transfer[2] = 5; // should be !5
        let err = decode_bulk_in(&transfer, DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn decode_rejects_reserved_bytes_unless_tolerated() {
        let mut transfer = vec![0u8; HEADER_SIZE + 4];
        transfer[0] = 2;
        transfer[1] = 7;
        transfer[2] = !7;
        transfer[4] = 4;
        transfer[10] = 0xAA;
        assert!(decode_bulk_in(&transfer, DecodeOptions::default()).is_err());

        let options = DecodeOptions { tolerate_reserved_bytes: true, ..Default::default() };
        let header = decode_bulk_in(&transfer, options).unwrap();
        assert_eq!(header.btag, 7);
        assert_eq!(header.transfer_size, 4);
    }

    #[test]
    fn decode_checks_size_against_received_transfer() {
        let mut transfer = vec![0u8; HEADER_SIZE + 2];
        transfer[0] = 2;
        transfer[1] = 1;
        transfer[2] = !1;
        transfer[4] = 8; // announces more than the 2 payload bytes present
        assert!(decode_bulk_in(&transfer, DecodeOptions::default()).is_err());

        let options = DecodeOptions { tolerate_size_overrun: true, ..Default::default() };
        assert!(decode_bulk_in(&transfer, options).is_ok());
    }

    #[test]
    fn padding_rounds_up_to_four() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(6), 8);

        let mut transfer = vec![0u8; HEADER_SIZE];
        transfer.extend_from_slice(b"*IDN?\n");
        pad_to_alignment(&mut transfer);
        assert_eq!(transfer.len(), HEADER_SIZE + 8);
        assert_eq!(&transfer[HEADER_SIZE + 6..], &[0x00, 0x00]);
    }
}
