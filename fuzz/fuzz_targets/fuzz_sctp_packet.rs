#![no_main]

use codec::sctp::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Packet::peek_verification_tag(data);

    if let Ok(packet) = Packet::decode(data) {
        let _ = Packet::decode(&packet.encode());
    }
});
