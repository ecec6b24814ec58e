//! Fuzz target: `TelemetrySnapshot::decode`
//!
//! Arbitrary telemetry payloads must decode or fail cleanly. A decoded
//! snapshot must survive an encode / decode cycle unchanged.
//!
//! cargo fuzz run fuzz_telemetry_decoder

#![no_main]

use cryolink::protocol::telemetry::{MAX_CONTROLLERS, TelemetrySnapshot};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(snapshot) = TelemetrySnapshot::decode(data) else {
        return;
    };
    assert!(snapshot.controllers.len() <= MAX_CONTROLLERS);

    let payload = snapshot.encode().expect("decoded snapshot re-encodes");
    let again = TelemetrySnapshot::decode(&payload).expect("re-encoded snapshot decodes");
    assert_eq!(snapshot, again);
});
