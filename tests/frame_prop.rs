//! Property tests for the bulk header codec and the write-side segmentation
//! of the transaction engine.

mod common;

use common::*;
use proptest::collection::vec;
use proptest::prelude::*;
use usbtmc::communication::frame::{self, DecodeOptions};
use usbtmc::quirks::QuirksRecord;

proptest! {
    // Every emitted header carries a valid bTag/bTagInverse pair, the exact
    // little-endian TransferSize, and clean reserved bytes.
    #[test]
    fn out_headers_are_well_formed(
        btag in 1u8..=255,
        size in 0u32..1_000_000,
        eom in any::<bool>(),
    ) {
        let header = frame::dev_dep_msg_out(btag, size, eom);
        prop_assert_eq!(header[0], 1);
        prop_assert!(header[1] >= 1);
        prop_assert_eq!(header[2], !btag);
        prop_assert_eq!(header[3], 0);
        prop_assert_eq!(u32::from_le_bytes([header[4], header[5], header[6], header[7]]), size);
        prop_assert_eq!(header[8] & 0x01 != 0, eom);
        prop_assert_eq!(&header[9..12], &[0, 0, 0]);
    }

    #[test]
    fn request_headers_are_well_formed(
        btag in 1u8..=255,
        size in 0u32..1_000_000,
        term in proptest::option::of(any::<u8>()),
    ) {
        let header = frame::request_dev_dep_msg_in(btag, size, term);
        prop_assert_eq!(header[0], 2);
        prop_assert_eq!(header[2], !btag);
        prop_assert_eq!(u32::from_le_bytes([header[4], header[5], header[6], header[7]]), size);
        match term {
            Some(tc) => {
                prop_assert_eq!(header[8], 0b0000_0010);
                prop_assert_eq!(header[9], tc);
            }
            None => {
                prop_assert_eq!(header[8], 0);
                prop_assert_eq!(header[9], 0);
            }
        }
    }

    // A compliant device transfer decodes back to exactly what was framed.
    #[test]
    fn bulk_in_decode_roundtrip(
        btag in 1u8..=255,
        payload in vec(any::<u8>(), 0..512),
        eom in any::<bool>(),
    ) {
        let mut transfer = vec![2, btag, !btag, 0];
        transfer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        transfer.push(if eom { 0x01 } else { 0x00 });
        transfer.extend_from_slice(&[0, 0, 0]);
        transfer.extend_from_slice(&payload);
        while transfer.len() % 4 != 0 {
            transfer.push(0);
        }

        let header = frame::decode_bulk_in(&transfer, DecodeOptions::default()).unwrap();
        prop_assert_eq!(header.btag, btag);
        prop_assert_eq!(header.transfer_size as usize, payload.len());
        prop_assert_eq!(header.end_of_message, eom);
    }

    // Arbitrary byte salads never panic the decoder.
    #[test]
    fn decode_never_panics(transfer in vec(any::<u8>(), 0..64)) {
        let _ = frame::decode_bulk_in(&transfer, DecodeOptions::default());
    }

    // Splitting a payload into segments of any size reassembles to the
    // original, with zero padding and EOM on exactly the last segment.
    #[test]
    fn segmented_writes_reassemble(
        payload in vec(any::<u8>(), 1..600),
        split in 1u32..64,
    ) {
        let mock = MockTransport::new(MockBehavior::default());
        let mut core = open_core_with(
            &mock,
            QuirksRecord { max_transfer_size: split, ..Default::default() },
        );
        core.write(&payload, None).unwrap();

        let transfers = mock.state().out_transfers_with_msg_id(1);
        let mut collected = Vec::new();
        for (index, transfer) in transfers.iter().enumerate() {
            let size =
                u32::from_le_bytes([transfer[4], transfer[5], transfer[6], transfer[7]]) as usize;
            prop_assert!(size as u32 <= split);
            prop_assert!(transfer[1] >= 1);
            prop_assert_eq!(transfer[2], !transfer[1]);
            prop_assert_eq!(transfer.len(), 12 + size.div_ceil(4) * 4);
            prop_assert!(transfer[12 + size..].iter().all(|b| *b == 0));
            let is_last = index + 1 == transfers.len();
            prop_assert_eq!(transfer[8] & 0x01 != 0, is_last);
            collected.extend_from_slice(&transfer[12..12 + size]);
        }
        prop_assert_eq!(collected, payload);
    }

    // Whatever the device's per-transfer cap, an echoed message reads back
    // byte-identical with End-Of-Message seen.
    #[test]
    fn echo_roundtrip_under_any_device_cap(
        payload in vec(any::<u8>(), 1..400),
        device_cap in 1usize..128,
    ) {
        let mock = MockTransport::new(MockBehavior {
            echo: true,
            max_in_payload: Some(device_cap),
            ..Default::default()
        });
        let mut core = open_core(&mock);

        core.write(&payload, None).unwrap();
        let (data, eom) = core.read(payload.len(), None, None).unwrap();
        prop_assert_eq!(data, payload);
        prop_assert!(eom);
    }
}
