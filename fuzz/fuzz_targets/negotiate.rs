#![no_main]

use knit_core::negotiate::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::parse(data) {
        let bytes = message.serialize().expect("parsed message must serialize");
        assert_eq!(bytes, data);
    }
});
