#![no_main]

use knit_core::payload::HandshakePayload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Trailing fields are dropped, so only check the parse is stable.
    if let Ok(payload) = HandshakePayload::parse(data) {
        let bytes = payload.encode().expect("parsed payload must encode");
        assert_eq!(HandshakePayload::parse(&bytes).ok(), Some(payload));
    }
});
