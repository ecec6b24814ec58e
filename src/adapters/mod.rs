//! Adapters: concrete implementations of the link port traits.
//!
//! | Adapter    | Implements                 | Connects to                 |
//! |------------|----------------------------|-----------------------------|
//! | `log_sink` | EventSink                  | `log` facade                |
//! | `loopback` | LinkTransport + FrameSink  | In-process simulated peer   |
//! | `time`     | Clock                      | `std::time::Instant`        |

pub mod log_sink;
pub mod loopback;
pub mod time;
