//! Fuzz target: `frame::decode`
//!
//! Drives arbitrary notification bytes into the frame decoder and asserts
//! that it never panics, never yields an oversized payload, and that any
//! accepted frame re-encodes to the same prefix of the input.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use cryolink::protocol::frame::{self, MAX_PAYLOAD_LEN};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(decoded) = frame::decode(data) else {
        return;
    };
    assert!(decoded.payload().len() <= MAX_PAYLOAD_LEN, "payload exceeds MAX_PAYLOAD_LEN");

    let encoded = decoded.encode().expect("decoded frame re-encodes");
    assert_eq!(&data[..encoded.len()], encoded.as_slice(), "re-encode differs from input");
});
