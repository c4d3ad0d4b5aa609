#![no_main]

use codec::stun::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::decode(data) {
        let _ = message.method();
        let _ = message.class();
        let _ = message.transaction_id();

        // integrity and fingerprint checks must never panic on a
        // message that decoded.
        let _ = message.verify_integrity(b"password");
        let _ = message.verify_fingerprint();
    }
});
