//! Command/acknowledgement correlation.
//!
//! Every tracked command gets the next sequence number of the current
//! connection and a pending entry keyed by that sequence. An inbound
//! COMMAND_ACK resolves the entry whose sequence equals the ack's
//! `acked_sequence`, regardless of arrival order. Entries leave the table
//! exactly once: on ack, on deadline, or when the connection is torn down.
//!
//! The table is owned by the engine task alone; nothing here locks.

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use burster::Limiter;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use heapless::FnvIndexMap;
use log::{debug, warn};

use crate::error::CommandError;
use crate::link::run_progress::Recipe;
use crate::link::session::SessionInfo;
use crate::protocol::frame::{EncodedFrame, MessageType, encode};
use crate::protocol::messages::{AckPayload, CommandId, CommandPayload};
use crate::protocol::telemetry::Fixed10;

/// Pending table capacity (power of two for the index map).
pub const MAX_PENDING: usize = 32;

/// Time source for the rate limiter: the engine's clock as last seen by
/// [`Correlator::admit`].
type LimiterClock = Box<dyn Fn() -> Duration + Send + Sync>;

/// One-shot reply slot shared between a waiting caller and the engine.
pub type Reply<T> = Arc<Signal<CriticalSectionRawMutex, Result<T, CommandError>>>;

pub fn reply_slot<T>() -> Reply<T> {
    Arc::new(Signal::new())
}

/// Who is waiting on a pending command.
pub enum Waiter {
    /// A handle caller awaiting the ack.
    Caller(Reply<AckPayload>),
    /// The engine's own OPEN_SESSION, optionally on behalf of a caller.
    SessionOpen(Option<Reply<SessionInfo>>),
    /// CLOSE_SESSION on behalf of a caller.
    SessionClose(Reply<()>),
}

impl Waiter {
    /// Deliver a failure to whoever is waiting.
    pub fn fail(self, err: CommandError) {
        match self {
            Self::Caller(reply) => reply.signal(Err(err)),
            Self::SessionOpen(Some(reply)) => reply.signal(Err(err)),
            Self::SessionOpen(None) => {}
            Self::SessionClose(reply) => reply.signal(Err(err)),
        }
    }
}

impl core::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Caller(_) => f.write_str("Caller"),
            Self::SessionOpen(r) => write!(f, "SessionOpen(caller={})", r.is_some()),
            Self::SessionClose(_) => f.write_str("SessionClose"),
        }
    }
}

/// Local bookkeeping attached to a command.
///
/// `Relay` and `Setpoint` are optimistic: they patch the published view
/// at send time and are dropped if the command fails. The others apply
/// only once the controller answers OK.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalEffect {
    None,
    StartRun(Recipe),
    PauseRun,
    ResumeRun,
    StopRun,
    AcknowledgeAlarms(u32),
    Relay { mask: u16, state: u16 },
    Setpoint { controller: u8, value: Fixed10 },
}

#[derive(Debug)]
pub struct PendingCommand {
    pub sequence: u16,
    pub cmd_id: CommandId,
    pub sent_at_ms: u64,
    pub deadline_ms: u64,
    pub waiter: Waiter,
    pub effect: LocalEffect,
}

pub struct Correlator {
    next_sequence: u16,
    pending: FnvIndexMap<u16, PendingCommand, MAX_PENDING>,
    max_in_flight: usize,
    limiter_now_ms: Arc<AtomicU64>,
    rate_limiter: burster::TokenBucket<LimiterClock>,
}

impl Correlator {
    pub fn new(max_in_flight: u8) -> Self {
        let limiter_now_ms = Arc::new(AtomicU64::new(0));
        let clock = Arc::clone(&limiter_now_ms);
        let time_provider: LimiterClock =
            Box::new(move || Duration::from_millis(clock.load(Ordering::Relaxed)));
        Self {
            next_sequence: 1,
            pending: FnvIndexMap::new(),
            max_in_flight: (max_in_flight as usize).clamp(1, MAX_PENDING),
            limiter_now_ms,
            rate_limiter: burster::TokenBucket::new_with_time_provider(
                20,
                20, // 20 tracked commands per second, 20 burst capacity
                time_provider,
            ),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, sequence: u16) -> bool {
        self.pending.contains_key(&sequence)
    }

    /// Earliest deadline among pending entries.
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.values().map(|p| p.deadline_ms).min()
    }

    /// Check in-flight capacity and the outbound rate before building a
    /// tracked command. The bucket refills on the engine clock.
    pub fn admit(&mut self, now_ms: u64) -> Result<(), CommandError> {
        if self.pending.len() >= self.max_in_flight {
            return Err(CommandError::Busy);
        }
        self.limiter_now_ms.fetch_max(now_ms, Ordering::Relaxed);
        if self.rate_limiter.try_consume(1).is_err() {
            warn!("CORR: outbound rate limit hit");
            return Err(CommandError::RateLimited);
        }
        Ok(())
    }

    /// Allocate the next sequence number. Wraps at 16 bits and skips 0,
    /// which marks unsolicited frames, and any value still pending.
    pub fn allocate_sequence(&mut self) -> u16 {
        loop {
            let seq = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            if seq != 0 && !self.pending.contains_key(&seq) {
                return seq;
            }
        }
    }

    /// Build a COMMAND frame under a fresh sequence number.
    pub fn build(&mut self, cmd_id: CommandId, data: &[u8]) -> Result<(u16, EncodedFrame), CommandError> {
        let payload = CommandPayload::new(cmd_id, data)
            .and_then(|c| c.encode())
            .map_err(|_| CommandError::PayloadTooLarge { len: data.len() })?;
        let sequence = self.allocate_sequence();
        let frame = encode(MessageType::Command, sequence, &payload)
            .map_err(|_| CommandError::PayloadTooLarge { len: data.len() })?;
        Ok((sequence, frame))
    }

    /// Register a pending entry. Hands the entry back if the table is full.
    pub fn track(&mut self, entry: PendingCommand) -> Result<(), PendingCommand> {
        let seq = entry.sequence;
        match self.pending.insert(seq, entry) {
            Ok(None) => {
                debug!("CORR: tracking #{seq} ({} pending)", self.pending.len());
                Ok(())
            }
            // Sequence allocation never hands out a pending value.
            Ok(Some(previous)) => {
                warn!("CORR: replaced pending #{seq}");
                previous.waiter.fail(CommandError::Disconnected);
                Ok(())
            }
            Err((_, entry)) => Err(entry),
        }
    }

    /// Remove a pending entry without resolving it (write failed).
    pub fn cancel(&mut self, sequence: u16) -> Option<PendingCommand> {
        self.pending.remove(&sequence)
    }

    /// Match an ack against the table. `None` means a late or unknown
    /// ack, which the caller counts and discards.
    pub fn resolve(&mut self, ack: &AckPayload) -> Option<PendingCommand> {
        let entry = self.pending.remove(&ack.acked_sequence)?;
        if entry.cmd_id != ack.cmd_id {
            warn!(
                "CORR: ack #{} names {} but {} was sent",
                ack.acked_sequence, ack.cmd_id, entry.cmd_id
            );
        }
        Some(entry)
    }

    /// Remove every entry whose deadline has passed.
    pub fn expire(&mut self, now_ms: u64) -> Vec<PendingCommand> {
        let due: heapless::Vec<u16, MAX_PENDING> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline_ms <= now_ms)
            .map(|(seq, _)| *seq)
            .collect();
        due.iter().filter_map(|seq| self.pending.remove(seq)).collect()
    }

    /// Remove every entry (connection teardown) and restart numbering for
    /// the next connection.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        let keys: heapless::Vec<u16, MAX_PENDING> = self.pending.keys().copied().collect();
        let drained = keys.iter().filter_map(|seq| self.pending.remove(seq)).collect();
        self.next_sequence = 1;
        drained
    }
}
