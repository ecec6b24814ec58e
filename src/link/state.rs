//! Link state machine.
//!
//! ```text
//!  Disconnected ─► Connecting ─► Discovering ─► Subscribing ─► OpeningSession ─► Live
//!       ▲  │                                                        ▲            ▲ │
//!       │  ▼                                                        │ close      │ ▼
//!       │ Error ─(user connect)─► Connecting                        └────────── Degraded
//!       │
//!       └──────────────── any state on transport loss ─────────────────────────────┘
//! ```
//!
//! Transitions are applied one at a time by the owner task; an edge that
//! is not in the table is rejected with [`TransitionError`] and the state
//! is left unchanged.

use log::info;
use serde::Serialize;

use crate::error::TransitionError;

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

/// Externally observable connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum LinkState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Discovering = 2,
    Subscribing = 3,
    OpeningSession = 4,
    Live = 5,
    Degraded = 6,
    Error = 7,
}

impl LinkState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Subscribing => "subscribing",
            Self::OpeningSession => "opening-session",
            Self::Live => "live",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }

    /// Transport is up and a session is established.
    pub fn has_session(self) -> bool {
        matches!(self, Self::Live | Self::Degraded)
    }

    /// Transport is up (possibly still setting up).
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Discovering | Self::Subscribing | Self::OpeningSession | Self::Live | Self::Degraded
        )
    }

    /// Nothing is in progress; waiting for a user connect.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

/// Whether `from -> to` is a legal edge.
pub fn is_allowed(from: LinkState, to: LinkState) -> bool {
    use LinkState::{
        Connecting, Degraded, Disconnected, Discovering, Error, Live, OpeningSession, Subscribing,
    };
    match (from, to) {
        (Disconnected | Error, Connecting)
        | (Connecting, Discovering)
        | (Discovering, Subscribing)
        | (Subscribing, OpeningSession)
        | (OpeningSession, Live)
        | (Live, Degraded)
        | (Degraded, Live)
        | (Live | Degraded, OpeningSession)
        | (Disconnected, Error) => true,
        (f, Disconnected) => f != Disconnected,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// FSM
// ---------------------------------------------------------------------------

/// Holds the current state and applies checked transitions.
#[derive(Debug)]
pub struct LinkFsm {
    current: LinkState,
    /// Time (ms) the current state was entered.
    entered_at_ms: u64,
    /// Transitions applied since construction.
    transitions: u64,
}

impl Default for LinkFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkFsm {
    pub fn new() -> Self {
        Self {
            current: LinkState::Disconnected,
            entered_at_ms: 0,
            transitions: 0,
        }
    }

    pub fn current(&self) -> LinkState {
        self.current
    }

    pub fn entered_at_ms(&self) -> u64 {
        self.entered_at_ms
    }

    pub fn time_in_state_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.entered_at_ms)
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Apply `from -> to`. Returns the previous state.
    pub fn transition(&mut self, to: LinkState, now_ms: u64) -> Result<LinkState, TransitionError> {
        let from = self.current;
        if !is_allowed(from, to) {
            return Err(TransitionError { from, to });
        }
        info!("LINK: {} -> {}", from.name(), to.name());
        self.current = to;
        self.entered_at_ms = now_ms;
        self.transitions = self.transitions.wrapping_add(1);
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LinkState::*;

    #[test]
    fn starts_disconnected() {
        let fsm = LinkFsm::new();
        assert_eq!(fsm.current(), Disconnected);
        assert_eq!(fsm.transitions(), 0);
    }

    #[test]
    fn full_establish_chain() {
        let mut fsm = LinkFsm::new();
        for (i, next) in [Connecting, Discovering, Subscribing, OpeningSession, Live]
            .into_iter()
            .enumerate()
        {
            fsm.transition(next, i as u64 * 10).unwrap();
        }
        assert_eq!(fsm.current(), Live);
        assert_eq!(fsm.entered_at_ms(), 40);
        assert_eq!(fsm.time_in_state_ms(100), 60);
    }

    #[test]
    fn cannot_skip_steps() {
        let mut fsm = LinkFsm::new();
        assert_eq!(
            fsm.transition(Live, 0),
            Err(TransitionError {
                from: Disconnected,
                to: Live
            })
        );
        fsm.transition(Connecting, 0).unwrap();
        assert!(fsm.transition(OpeningSession, 0).is_err());
        assert_eq!(fsm.current(), Connecting);
    }

    #[test]
    fn any_connected_state_can_drop() {
        for from in [Connecting, Discovering, Subscribing, OpeningSession, Live, Degraded, Error] {
            assert!(is_allowed(from, Disconnected), "{from:?}");
        }
        assert!(!is_allowed(Disconnected, Disconnected));
    }

    #[test]
    fn error_only_from_disconnected() {
        assert!(is_allowed(Disconnected, Error));
        for from in [Connecting, Discovering, Subscribing, OpeningSession, Live, Degraded] {
            assert!(!is_allowed(from, Error), "{from:?}");
        }
        assert!(is_allowed(Error, Connecting));
    }

    #[test]
    fn live_degraded_toggle() {
        assert!(is_allowed(Live, Degraded));
        assert!(is_allowed(Degraded, Live));
        assert!(is_allowed(Degraded, OpeningSession));
        assert!(!is_allowed(Degraded, Connecting));
    }

    #[test]
    fn predicates() {
        assert!(Live.has_session());
        assert!(Degraded.has_session());
        assert!(!OpeningSession.has_session());
        assert!(OpeningSession.is_connected());
        assert!(!Connecting.is_connected());
        assert!(Error.is_idle());
    }
}
