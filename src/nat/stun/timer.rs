// src/nat/stun/timer.rs
//! STUN retransmission timer (RFC 5389 Section 7.2.1)
//!
//! Time is passed in by the caller so the timer can be driven from any
//! tick source and tested without sleeping.

use std::time::{Duration, Instant};

/// Default initial retransmission timeout in milliseconds
pub const STUN_TIMER_DEFAULT_TIMEOUT: u32 = 200;

/// Default number of retransmissions before giving up
pub const STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS: u32 = 7;

/// Default transaction timeout over reliable transports in milliseconds
pub const STUN_TIMER_DEFAULT_RELIABLE_TIMEOUT: u32 = 7900;

/// Result of [`StunTimer::refresh`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunTimerReturn {
    /// Deadline not reached
    Success,
    /// Deadline reached; the request should be sent again
    Retransmit,
    /// All retransmissions used up
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunTimer {
    deadline: Instant,
    delay: u32,
    retransmissions: u32,
    max_retransmissions: u32,
}

impl StunTimer {
    /// Arm for an unreliable transport with exponential backoff
    pub fn start(now: Instant, initial_timeout_ms: u32, max_retransmissions: u32) -> Self {
        Self {
            deadline: now + Duration::from_millis(initial_timeout_ms as u64),
            delay: initial_timeout_ms,
            retransmissions: 0,
            max_retransmissions,
        }
    }

    /// Arm for a reliable transport: one deadline, no retransmission
    pub fn start_reliable(now: Instant, timeout_ms: u32) -> Self {
        Self::start(now, timeout_ms, 0)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// Time left before the deadline
    pub fn remainder(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Advance the timer. The delay doubles on each retransmission and is
    /// halved for the last one.
    pub fn refresh(&mut self, now: Instant) -> StunTimerReturn {
        if now < self.deadline {
            return StunTimerReturn::Success;
        }
        if self.retransmissions >= self.max_retransmissions {
            return StunTimerReturn::Timeout;
        }
        if self.retransmissions + 1 == self.max_retransmissions {
            self.delay /= 2;
        } else {
            self.delay = self.delay.saturating_mul(2);
        }
        self.deadline = now + Duration::from_millis(self.delay as u64);
        self.retransmissions += 1;
        StunTimerReturn::Retransmit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_then_timeout() {
        let start = Instant::now();
        let mut timer = StunTimer::start(start, 100, 3);
        assert_eq!(timer.refresh(start), StunTimerReturn::Success);

        // 100ms, then 200ms, 400ms, and a halved final delay of 200ms
        let mut now = start + Duration::from_millis(100);
        assert_eq!(timer.refresh(now), StunTimerReturn::Retransmit);
        assert_eq!(timer.remainder(now), Duration::from_millis(200));

        now += Duration::from_millis(200);
        assert_eq!(timer.refresh(now), StunTimerReturn::Retransmit);
        assert_eq!(timer.remainder(now), Duration::from_millis(400));

        now += Duration::from_millis(400);
        assert_eq!(timer.refresh(now), StunTimerReturn::Retransmit);
        assert_eq!(timer.remainder(now), Duration::from_millis(200));
        assert_eq!(timer.retransmissions(), 3);

        now += Duration::from_millis(199);
        assert_eq!(timer.refresh(now), StunTimerReturn::Success);
        now += Duration::from_millis(1);
        assert_eq!(timer.refresh(now), StunTimerReturn::Timeout);
    }

    #[test]
    fn test_reliable_times_out_once() {
        let start = Instant::now();
        let mut timer = StunTimer::start_reliable(start, STUN_TIMER_DEFAULT_RELIABLE_TIMEOUT);
        assert_eq!(
            timer.refresh(start + Duration::from_millis(7899)),
            StunTimerReturn::Success
        );
        assert_eq!(
            timer.refresh(start + Duration::from_millis(7900)),
            StunTimerReturn::Timeout
        );
    }
}
