//! Leased session and heartbeat bookkeeping.
//!
//! ```text
//!  NoSession ──begin_open──► Opening{nonce} ──activate(grant)──► Active{id, lease}
//!      ▲                          │                                  │
//!      └────── abort_open ────────┘◄──────────── teardown ───────────┘
//! ```
//!
//! OPEN_SESSION carries a fresh random nonce and, when a pre-shared key
//! is configured, `HMAC-SHA256(key, nonce)`. The grant in the ack names
//! the session id and lease. Keepalives go out every
//! `keepalive_interval_ms` regardless of the lease length, and
//! `last_keepalive` advances when a keepalive is *sent*, not when it is
//! acknowledged. Lease validity is therefore an advisory, client-side
//! figure: `now - last_keepalive < lease`.

use log::{info, warn};
use serde::Serialize;

use crate::config::SessionKey;
use crate::error::SessionError;
use crate::protocol::messages::{NONCE_LEN, SESSION_TAG_LEN, SessionGrant, open_session_data};

/// OPEN_SESSION argument bytes.
pub type OpenSessionData = heapless::Vec<u8, { NONCE_LEN + SESSION_TAG_LEN }>;

// ── Lease ────────────────────────────────────────────────────

/// Lease health derived for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LeaseState {
    Live,
    Degraded,
}

/// An established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub lease_ms: u32,
    pub opened_at_ms: u64,
    last_keepalive_ms: u64,
}

impl Session {
    pub fn last_keepalive_ms(&self) -> u64 {
        self.last_keepalive_ms
    }

    pub fn lease_age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_keepalive_ms)
    }

    /// Strict: at exactly `age == lease` the lease has lapsed.
    pub fn is_lease_valid(&self, now_ms: u64) -> bool {
        self.lease_age_ms(now_ms) < self.lease_ms as u64
    }

    pub fn lease_state(&self, now_ms: u64) -> LeaseState {
        if self.is_lease_valid(now_ms) {
            LeaseState::Live
        } else {
            LeaseState::Degraded
        }
    }

    /// First instant at which the lease is no longer valid.
    pub fn lease_expires_at_ms(&self) -> u64 {
        self.last_keepalive_ms.saturating_add(self.lease_ms as u64)
    }
}

/// Published view of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: u32,
    pub lease_ms: u32,
    pub lease_age_ms: u64,
    pub lease: LeaseState,
}

impl SessionInfo {
    fn of(session: &Session, now_ms: u64) -> Self {
        Self {
            id: session.id,
            lease_ms: session.lease_ms,
            lease_age_ms: session.lease_age_ms(now_ms),
            lease: session.lease_state(now_ms),
        }
    }
}

// ── Manager ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    Opening { nonce: [u8; NONCE_LEN], started_at_ms: u64 },
    Active(Session),
}

pub struct SessionManager {
    phase: SessionPhase,
    key: Option<SessionKey>,
    keepalive_interval_ms: u64,
    default_lease_ms: u32,
    keepalive_enabled: bool,
    next_keepalive_ms: u64,
}

impl SessionManager {
    pub fn new(keepalive_interval_ms: u32, default_lease_ms: u32, key: Option<SessionKey>) -> Self {
        Self {
            phase: SessionPhase::NoSession,
            key,
            keepalive_interval_ms: keepalive_interval_ms as u64,
            default_lease_ms,
            keepalive_enabled: true,
            next_keepalive_ms: 0,
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        match &self.phase {
            SessionPhase::Active(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, SessionPhase::Active(_))
    }

    pub fn is_opening(&self) -> bool {
        matches!(self.phase, SessionPhase::Opening { .. })
    }

    pub fn info(&self, now_ms: u64) -> Option<SessionInfo> {
        self.session().map(|s| SessionInfo::of(s, now_ms))
    }

    /// Start an open: pick a nonce and build the OPEN_SESSION argument.
    pub fn begin_open(&mut self, now_ms: u64) -> Result<OpenSessionData, SessionError> {
        match self.phase {
            SessionPhase::Opening { .. } => return Err(SessionError::AlreadyOpening),
            SessionPhase::Active(_) => return Err(SessionError::AlreadyActive),
            SessionPhase::NoSession => {}
        }
        let nonce = fill_random_nonce();
        let tag = self.key.as_ref().map(|k| compute_session_tag(k, &nonce));
        self.phase = SessionPhase::Opening {
            nonce,
            started_at_ms: now_ms,
        };
        Ok(open_session_data(&nonce, tag.as_ref()))
    }

    /// Accept the grant from a successful OPEN_SESSION ack.
    pub fn activate(&mut self, grant_data: &[u8], now_ms: u64) -> Result<SessionInfo, SessionError> {
        if !self.is_opening() {
            return Err(SessionError::NotOpening);
        }
        let Some(grant) = SessionGrant::decode(grant_data) else {
            self.phase = SessionPhase::NoSession;
            return Err(SessionError::MalformedGrant {
                len: grant_data.len(),
            });
        };
        let lease_ms = grant.lease_ms.unwrap_or(self.default_lease_ms);
        if lease_ms == 0 {
            self.phase = SessionPhase::NoSession;
            return Err(SessionError::ZeroLease);
        }

        let session = Session {
            id: grant.session_id,
            lease_ms,
            opened_at_ms: now_ms,
            last_keepalive_ms: now_ms,
        };
        info!(
            "SESSION: opened id=0x{:08X} lease={}ms",
            session.id, session.lease_ms
        );
        let info = SessionInfo::of(&session, now_ms);
        self.phase = SessionPhase::Active(session);
        self.next_keepalive_ms = now_ms.saturating_add(self.keepalive_interval_ms);
        Ok(info)
    }

    /// Give up on an in-flight open (rejected, timed out).
    pub fn abort_open(&mut self) {
        if self.is_opening() {
            warn!("SESSION: open aborted");
            self.phase = SessionPhase::NoSession;
        }
    }

    /// Drop all session state. Returns the id of the session that was active.
    pub fn teardown(&mut self) -> Option<u32> {
        let closed = self.session().map(|s| s.id);
        if let Some(id) = closed {
            info!("SESSION: closed id=0x{id:08X}");
        }
        self.phase = SessionPhase::NoSession;
        self.next_keepalive_ms = 0;
        closed
    }

    // ── Keepalive loop ───────────────────────────────────────

    pub fn keepalive_enabled(&self) -> bool {
        self.keepalive_enabled
    }

    pub fn set_keepalive_enabled(&mut self, enabled: bool, now_ms: u64) {
        if enabled && !self.keepalive_enabled {
            // Resume promptly rather than waiting a full interval.
            self.next_keepalive_ms = now_ms;
        }
        self.keepalive_enabled = enabled;
    }

    /// Session id to heartbeat for, when a keepalive is due.
    pub fn keepalive_due(&self, now_ms: u64) -> Option<u32> {
        if !self.keepalive_enabled {
            return None;
        }
        self.session()
            .filter(|_| now_ms >= self.next_keepalive_ms)
            .map(|s| s.id)
    }

    /// A keepalive was handed to the transport. Refreshes the lease.
    pub fn record_keepalive_sent(&mut self, now_ms: u64) {
        if let SessionPhase::Active(session) = &mut self.phase {
            session.last_keepalive_ms = now_ms;
            self.next_keepalive_ms = now_ms.saturating_add(self.keepalive_interval_ms);
        }
    }

    /// The transport refused the keepalive. Try again next interval
    /// without refreshing the lease.
    pub fn defer_keepalive(&mut self, now_ms: u64) {
        self.next_keepalive_ms = now_ms.saturating_add(self.keepalive_interval_ms);
    }

    /// When the keepalive loop next needs to run.
    pub fn next_keepalive_at(&self) -> Option<u64> {
        (self.keepalive_enabled && self.is_active()).then_some(self.next_keepalive_ms)
    }
}

// ── Crypto helpers ───────────────────────────────────────────

/// `HMAC-SHA256(key, nonce)` appended to OPEN_SESSION.
pub fn compute_session_tag(key: &[u8], nonce: &[u8; NONCE_LEN]) -> [u8; SESSION_TAG_LEN] {
    hmac_sha256::HMAC::mac(*nonce, key)
}

/// Non-cryptographic entropy from `RandomState`; the nonce only needs to
/// differ between opens.
fn fill_random_nonce() -> [u8; NONCE_LEN] {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut buf = [0u8; NONCE_LEN];
    for chunk in buf.chunks_mut(8) {
        let s = RandomState::new();
        let val = s.build_hasher().finish().to_le_bytes();
        let len = chunk.len().min(val.len());
        chunk[..len].copy_from_slice(&val[..len]);
    }
    buf
}

// ── Tests ────────────────────────────────────────────────────
