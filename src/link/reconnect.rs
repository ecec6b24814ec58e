//! Bounded automatic reconnection.
//!
//! After an unexpected transport loss the engine retries up to
//! `max_attempts` times, `delay_ms` apart. A user-initiated disconnect
//! disarms the policy; the next user connect re-arms it. Reaching `Live`
//! resets the attempt counter.

use log::{info, warn};

/// What to do after an unexpected loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait this long, then redo the full connect sequence.
    RetryAfter { delay_ms: u64, attempt: u32 },
    /// Stay disconnected until the user asks again.
    GiveUp,
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    delay_ms: u64,
    attempts: u32,
    armed: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            attempts: 0,
            armed: false,
        }
    }

    /// User asked to connect: enable retries with a fresh budget.
    pub fn arm(&mut self) {
        self.armed = true;
        self.attempts = 0;
    }

    /// User asked to disconnect: no retries until the next `arm`.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Retries consumed since the link was last established.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Link reached `Live`; the next loss starts a fresh budget.
    pub fn on_established(&mut self) {
        self.attempts = 0;
    }

    /// Decide how to react to an unexpected loss (including a failed retry).
    pub fn on_unexpected_loss(&mut self) -> ReconnectDecision {
        if !self.armed {
            return ReconnectDecision::GiveUp;
        }
        if self.attempts >= self.max_attempts {
            warn!(
                "RECONNECT: giving up after {} attempt(s)",
                self.attempts
            );
            self.armed = false;
            return ReconnectDecision::GiveUp;
        }
        self.attempts += 1;
        info!(
            "RECONNECT: attempt {}/{} in {} ms",
            self.attempts, self.max_attempts, self.delay_ms
        );
        ReconnectDecision::RetryAfter {
            delay_ms: self.delay_ms,
            attempt: self.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_policy_never_retries() {
        let mut p = ReconnectPolicy::new(3, 2000);
        assert_eq!(p.on_unexpected_loss(), ReconnectDecision::GiveUp);
    }

    #[test]
    fn bounded_attempts_with_fixed_delay() {
        let mut p = ReconnectPolicy::new(3, 2000);
        p.arm();
        for attempt in 1..=3 {
            assert_eq!(
                p.on_unexpected_loss(),
                ReconnectDecision::RetryAfter {
                    delay_ms: 2000,
                    attempt
                }
            );
        }
        assert_eq!(p.on_unexpected_loss(), ReconnectDecision::GiveUp);
        assert!(!p.is_armed());
    }

    #[test]
    fn establishing_resets_budget() {
        let mut p = ReconnectPolicy::new(2, 100);
        p.arm();
        p.on_unexpected_loss();
        p.on_unexpected_loss();
        p.on_established();
        assert_eq!(p.attempts(), 0);
        assert!(matches!(
            p.on_unexpected_loss(),
            ReconnectDecision::RetryAfter { attempt: 1, .. }
        ));
    }

    #[test]
    fn user_disconnect_disarms() {
        let mut p = ReconnectPolicy::new(3, 100);
        p.arm();
        p.disarm();
        assert_eq!(p.on_unexpected_loss(), ReconnectDecision::GiveUp);
        p.arm();
        assert!(matches!(
            p.on_unexpected_loss(),
            ReconnectDecision::RetryAfter { .. }
        ));
    }

    #[test]
    fn zero_attempts_gives_up_immediately() {
        let mut p = ReconnectPolicy::new(0, 100);
        p.arm();
        assert_eq!(p.on_unexpected_loss(), ReconnectDecision::GiveUp);
    }
}
