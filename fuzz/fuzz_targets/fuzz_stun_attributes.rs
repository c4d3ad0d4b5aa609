#![no_main]

use codec::stun::{Message, attributes::*};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::decode(data) {
        let _ = message.get::<UserName>();
        let _ = message.get::<Software>();
        let _ = message.get::<MappedAddress>();
        let _ = message.get::<XorMappedAddress>();
        let _ = message.get::<ErrorCode>();
        let _ = message.get::<Fingerprint>();
        let _ = message.get::<MessageIntegrity>();
        let _ = message.get::<Priority>();
        let _ = message.get::<UseCandidate>();
        let _ = message.get::<IceControlling>();
        let _ = message.get::<IceControlled>();
    }
});
