//! Requests into the link engine.
//!
//! These represent actions asked for by the presentation layer through a
//! [`LinkHandle`](super::engine::LinkHandle). The owner task is the only
//! consumer; every state change goes through this queue.

use crate::error::CommandError;
use crate::link::correlator::{LocalEffect, Reply};
use crate::link::session::SessionInfo;
use crate::protocol::messages::{AckPayload, CommandData, CommandId};

/// A tracked command and the caller awaiting its ack.
pub struct CommandRequest {
    pub cmd_id: CommandId,
    pub data: CommandData,
    /// Overrides the configured command timeout.
    pub timeout_ms: Option<u32>,
    pub effect: LocalEffect,
    pub reply: Reply<AckPayload>,
}

pub enum LinkRequest {
    /// Begin the connect sequence and arm automatic reconnection.
    Connect,

    /// Drop the link and disarm reconnection.
    Disconnect,

    /// Open a session on an already-connected link.
    OpenSession(Reply<SessionInfo>),

    /// CLOSE_SESSION, then stay connected without a session.
    CloseSession(Reply<()>),

    Command(CommandRequest),

    /// Send without registering a pending entry.
    FireAndForget { cmd_id: CommandId, data: CommandData },

    SetKeepaliveEnabled(bool),

    /// Fail everything outstanding and stop the owner task.
    Shutdown,
}

impl LinkRequest {
    /// Answer whoever is waiting on this request with `err`.
    pub fn fail(self, err: CommandError) {
        match self {
            Self::OpenSession(reply) => reply.signal(Err(err)),
            Self::CloseSession(reply) => reply.signal(Err(err)),
            Self::Command(req) => req.reply.signal(Err(err)),
            Self::Connect
            | Self::Disconnect
            | Self::FireAndForget { .. }
            | Self::SetKeepaliveEnabled(_)
            | Self::Shutdown => {}
        }
    }
}
