#![no_main]

use knit_core::frame::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // GoAway flags are not kept, so compare frames rather than bytes.
    if let Ok(frame) = Frame::parse(data) {
        let bytes = frame.serialize().expect("parsed frame must serialize");
        assert_eq!(bytes.len(), data.len());
        assert_eq!(Frame::parse(&bytes).ok(), Some(frame));
    }
});
