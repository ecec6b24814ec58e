//! Fuzz target: `LinkSupervisor::handle_frame`
//!
//! Opens a session against a sink that swallows every write, then feeds
//! the input as a stream of length-prefixed notifications interleaved
//! with clock advances. The supervisor must never panic, and its state
//! must always be one the link can legally be in while connected.
//!
//! cargo fuzz run fuzz_supervisor_inbound

#![no_main]

use cryolink::error::TransportError;
use cryolink::link::ports::{FrameSink, NullSink};
use cryolink::link::state::LinkState;
use cryolink::link::supervisor::{Control, LinkSupervisor};
use cryolink::LinkConfig;
use libfuzzer_sys::fuzz_target;

struct Swallow;

impl FrameSink for Swallow {
    fn write_frame(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let Ok(mut sup) = LinkSupervisor::new(LinkConfig::default()) else {
        return;
    };
    let mut out = NullSink;
    let mut tx = Swallow;
    let mut now = 0u64;

    if !sup.begin_connect(now, &mut out)
        || !sup.advance(LinkState::Discovering, now, &mut out)
        || !sup.advance(LinkState::Subscribing, now, &mut out)
    {
        return;
    }
    if sup.establish_session(now, &mut tx, &mut out) != Control::Continue {
        return;
    }

    let mut rest = data;
    while let Some((&head, tail)) = rest.split_first() {
        let len = (head as usize).min(tail.len());
        let (chunk, tail) = tail.split_at(len);
        rest = tail;
        now += u64::from(head & 0x0F) * 50;

        let control = sup.handle_frame(chunk, now, &mut tx, &mut out);
        let polled = sup.poll(now, &mut tx, &mut out);
        if control != Control::Continue || polled != Control::Continue {
            return;
        }
        assert!(
            matches!(
                sup.state(),
                LinkState::OpeningSession | LinkState::Live | LinkState::Degraded
            ),
            "unexpected state {:?}",
            sup.state()
        );
    }
});
