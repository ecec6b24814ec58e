//! Link and session engine.
//!
//! Pure state pieces (`state`, `reconnect`, `correlator`, `session`,
//! `alarms`, `run_progress`) are composed by the synchronous
//! `supervisor`, which the async `engine` task owns and drives.
//!
//! ```text
//!  LinkHandle ─► engine ─► supervisor ─┬─ state / reconnect
//!                  ▲                   ├─ correlator
//!  InboundPort ────┘                   ├─ session
//!                                      ├─ alarms
//!                                      └─ run_progress
//! ```

pub mod alarms;
pub mod commands;
pub mod correlator;
pub mod engine;
pub mod events;
pub mod ports;
pub mod reconnect;
pub mod run_progress;
pub mod session;
pub mod state;
pub mod supervisor;

pub use engine::{EventSubscriber, InboundPort, LinkEngine, LinkHandle};
pub use events::{LinkEvent, LinkQuality, LinkStatus, QualityGrade};
pub use run_progress::Recipe;
pub use state::LinkState;
