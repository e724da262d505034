//! Bulk
//!
//! The transaction engine: sequences multi-segment writes and the
//! REQUEST/response read loop over the bulk endpoints, reassembling device
//! replies into messages.
//!

use tracing::{debug, trace};

use crate::communication::frame::{self, DecodeOptions, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::quirks::QuirksRecord;
use crate::transport::UsbTransport;
use crate::types::{BTag, Endpoint, Transaction, UsbtmcEndpoints};

/// Result of a completed message read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    /// The device flagged End-Of-Message on the final transfer (or the
    /// short-read quirk promoted a short packet to one).
    pub end_of_message: bool,
}

/// Issue one bulk-out transfer, retrying a partially accepted transfer at
/// most once before surfacing a timeout.
fn write_transfer<T: UsbTransport>(
    transport: &mut T,
    endpoint: &Endpoint,
    transfer: &[u8],
    tx: &Transaction,
) -> Result<()> {
    let mut attempts = 0;
    loop {
        let n = transport.bulk_write(endpoint.address, transfer, tx.time_left()?)?;
        if n == transfer.len() {
            return Ok(());
        }
        attempts += 1;
        if attempts > 1 {
            return Err(Error::IoTimeout);
        }
        trace!("partial bulk-out transfer ({n} of {} bytes), retrying once", transfer.len());
    }
}

/// ### Write Message
///
/// Split the transaction's payload into DEV_DEP_MSG_OUT segments capped by
/// the device's TransferSize limit, pad each to the 4-byte boundary, and
/// send them in order. The End-Of-Message bit is set only on the final
/// segment (and only when the caller asked for it).
///
/// Returns the number of payload bytes written.
///
pub fn write_message<T: UsbTransport>(
    transport: &mut T,
    endpoints: &UsbtmcEndpoints,
    btag: &mut BTag,
    quirks: &QuirksRecord,
    tx: &mut Transaction,
    end_of_message: bool,
) -> Result<usize> {
    let total = tx.buffer.len();
    let max_segment = quirks.max_transfer_size as usize;
    let mut offset = 0;

    loop {
        tx.check_cancelled()?;

        let segment_len = (total - offset).min(max_segment);
        let last = offset + segment_len == total;
        let tag = btag.next();
        tx.btag = tag;

        let mut transfer = Vec::with_capacity(HEADER_SIZE + frame::padded_len(segment_len));
        transfer.extend_from_slice(&frame::dev_dep_msg_out(
            tag,
            segment_len as u32,
            end_of_message && last,
        ));
        transfer.extend_from_slice(&tx.buffer[offset..offset + segment_len]);
        frame::pad_to_alignment(&mut transfer);

        write_transfer(transport, &endpoints.bulk_out_ep, &transfer, tx)?;

        offset += segment_len;
        tx.remaining = total - offset;
        if last {
            break;
        }
    }

    debug!("wrote {total} byte message (eom={end_of_message})");
    Ok(total)
}

/// Send the header-only USB488 trigger message.
pub fn send_trigger<T: UsbTransport>(
    transport: &mut T,
    endpoints: &UsbtmcEndpoints,
    btag: &mut BTag,
    tx: &mut Transaction,
) -> Result<()> {
    let tag = btag.next();
    tx.btag = tag;
    write_transfer(transport, &endpoints.bulk_out_ep, &frame::trigger(tag), tx)
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// One complete bulk-in transfer: decoded header, raw bytes, and whether the
/// last USB packet of it was short.
struct InTransfer {
    header: frame::BulkInHeader,
    bytes: Vec<u8>,
    short_terminated: bool,
}

/// Read one bulk-in transfer: the 12-byte header plus however many reads it
/// takes to drain the announced payload and its alignment padding.
fn read_transfer<T: UsbTransport>(
    transport: &mut T,
    endpoints: &UsbtmcEndpoints,
    quirks: &QuirksRecord,
    tx: &Transaction,
    request_size: usize,
) -> Result<InTransfer> {
    let mps = endpoints.bulk_in_ep.max_packet_size as usize;
    let options = DecodeOptions {
        tolerate_reserved_bytes: quirks.tolerate_reserved_header_bytes,
        tolerate_size_overrun: quirks.report_padded_transfer_size,
    };

    let alloc = if quirks.read_extra_alignment_padding {
        HEADER_SIZE + round_up(frame::padded_len(request_size), mps.max(1))
    } else {
        HEADER_SIZE + frame::padded_len(request_size)
    };
    let mut buffer = vec![0u8; alloc];
    let n = transport.bulk_read(endpoints.bulk_in_ep.address, &mut buffer, tx.time_left()?)?;
    let mut short = n < buffer.len();
    buffer.truncate(n);

    if buffer.len() < HEADER_SIZE {
        return Err(Error::ProtocolViolation(format!(
            "bulk-in transfer is too short ({} bytes)",
            buffer.len()
        )));
    }

    let header = frame::decode_bulk_in(&buffer, options)?;
    let announced = header.transfer_size as usize;
    if announced > request_size && !quirks.report_padded_transfer_size {
        return Err(Error::bad_header("device announced more bytes than requested", &buffer));
    }

    // The device may deliver the announced payload across several USB
    // transfers; keep reading while the last one filled its buffer.
    let expected = if quirks.read_extra_alignment_padding {
        HEADER_SIZE + round_up(announced, mps.max(1))
    } else {
        HEADER_SIZE + frame::padded_len(announced)
    };
    while buffer.len() < expected && !short {
        let want = round_up(expected - buffer.len(), mps.max(1));
        let mut chunk = vec![0u8; want];
        let n = transport.bulk_read(endpoints.bulk_in_ep.address, &mut chunk, tx.time_left()?)?;
        short = n < chunk.len();
        buffer.extend_from_slice(&chunk[..n]);
    }

    if buffer.len() < HEADER_SIZE + announced && !quirks.report_padded_transfer_size {
        if quirks.accept_short_read_as_eom {
            trace!("short bulk-in transfer accepted as message end");
        } else {
            return Err(Error::ProtocolViolation(format!(
                "bulk-in transfer truncated ({} of {announced} payload bytes)",
                buffer.len() - HEADER_SIZE
            )));
        }
    }

    // A transfer ending exactly on a packet boundary must be terminated by a
    // short (possibly zero-length) packet; drain it.
    if mps > 0 && !buffer.is_empty() && buffer.len() % mps == 0 {
        let mut dummy = vec![0u8; mps];
        let n = transport.bulk_read(endpoints.bulk_in_ep.address, &mut dummy, tx.time_left()?)?;
        if n >= mps {
            return Err(Error::ProtocolViolation(
                "device sent a full packet where a terminating short packet was required".into(),
            ));
        }
        short = true;
    }

    Ok(InTransfer { header, bytes: buffer, short_terminated: short })
}

/// ### Read Message
///
/// Drive the REQUEST_DEV_DEP_MSG_IN / DEV_DEP_MSG_IN loop until the device
/// flags End-Of-Message, the caller's byte budget is reached, or a device
/// quirk ends the message early. Collected bytes accumulate in the
/// transaction buffer; the terminator, when present, is left in the data.
///
/// A response carrying an unexpected bTag is discarded and the read retried
/// once; a second mismatch is a protocol violation.
///
pub fn read_message<T: UsbTransport>(
    transport: &mut T,
    endpoints: &UsbtmcEndpoints,
    btag: &mut BTag,
    quirks: &QuirksRecord,
    tx: &mut Transaction,
    term_char: Option<u8>,
) -> Result<ReadOutcome> {
    let max_bytes = tx.remaining;
    let mut end_of_message = false;

    loop {
        tx.check_cancelled()?;

        let request_size = (max_bytes - tx.buffer.len()).min(quirks.max_transfer_size as usize);
        let tag = btag.next();
        tx.btag = tag;
        let request = frame::request_dev_dep_msg_in(tag, request_size as u32, term_char);
        write_transfer(transport, &endpoints.bulk_out_ep, &request, tx)?;

        let mut transfer = read_transfer(transport, endpoints, quirks, tx, request_size)?;
        if transfer.header.btag != tag {
            trace!(
                "bulk-in response carries bTag {} instead of {tag}; discarding and retrying",
                transfer.header.btag
            );
            transfer = read_transfer(transport, endpoints, quirks, tx, request_size)?;
            if transfer.header.btag != tag {
                return Err(Error::bad_header("bulk-in bTag mismatch after retry", &transfer.bytes));
            }
        }

        let header = transfer.header;
        let announced = header.transfer_size as usize;
        let available = transfer.bytes.len() - HEADER_SIZE;
        let take = announced.min(available).min(max_bytes - tx.buffer.len());
        tx.buffer.extend_from_slice(&transfer.bytes[HEADER_SIZE..HEADER_SIZE + take]);
        tx.remaining = max_bytes - tx.buffer.len();

        if header.end_of_message {
            end_of_message = true;
            break;
        }
        if header.term_char_seen {
            // Device-side early termination; the message itself continues.
            break;
        }
        if tx.buffer.len() >= max_bytes {
            break;
        }
        if quirks.accept_short_read_as_eom && transfer.short_terminated {
            debug!("promoting short packet to End-Of-Message per device quirk");
            end_of_message = true;
            break;
        }
        if announced == 0 {
            return Err(Error::ProtocolViolation(
                "device sent an empty transfer without End-Of-Message".into(),
            ));
        }
    }

    if quirks.report_padded_transfer_size && end_of_message {
        strip_reported_padding(&mut tx.buffer);
        tx.remaining = max_bytes - tx.buffer.len();
    }

    debug!("read {} byte message (eom={end_of_message})", tx.buffer.len());
    Ok(ReadOutcome { data: std::mem::take(&mut tx.buffer), end_of_message })
}

/// Devices that count padding into TransferSize leave 1..=3 NUL bytes after
/// the terminating newline; restore the original message when that shape is
/// recognised, leave the data alone otherwise.
fn strip_reported_padding(message: &mut Vec<u8>) {
    let tail = message.len().saturating_sub(4);
    if let Some(newline) = message[tail..].iter().rposition(|b| *b == b'\n') {
        let end = tail + newline + 1;
        if message[end..].iter().all(|b| *b == 0x00) {
            message.truncate(end);
        }
    }
}
