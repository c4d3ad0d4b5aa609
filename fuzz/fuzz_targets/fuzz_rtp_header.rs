#![no_main]

use codec::{PacketKind, rtp::{RtpHeader, rtcp_sender_ssrc}};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match PacketKind::classify(data) {
        PacketKind::Rtcp => {
            let _ = rtcp_sender_ssrc(data);
        }
        _ => {
            if let Ok(header) = RtpHeader::decode(data) {
                assert!(header.len() <= data.len());

                // the decoded header writes back to the same size.
                let mut buffer = vec![0u8; header.len()];
                assert_eq!(header.encode(&mut buffer).ok(), Some(header.len()));
            }
        }
    }
});
