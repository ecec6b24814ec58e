//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that drives a real [`LinkEngine`]
//! against the in-process loopback controller. Everything runs on the
//! host with no radio required.
//!
//! [`LinkEngine`]: cryolink::link::LinkEngine

mod command_tests;
mod harness;
mod lifecycle_tests;
mod session_flow_tests;
