//! Cryolink: link and session engine for the cryogenic mill controller.
//!
//! Exposes the wire protocol, the link engine and its adapters. The
//! presentation layer holds a [`link::LinkHandle`]; everything below it
//! is driven by one owner task.

#![deny(unused_must_use)]

pub mod adapters;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod link;
pub mod protocol;

pub use config::LinkConfig;
pub use error::{CommandError, Error, Result};
