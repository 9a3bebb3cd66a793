use std::time::Duration;

use crate::quirks::{DEFAULT_POLL_TIMEOUT, Quirks};

const SLOW_ERASE_MAX_WAIT: Duration = Duration::from_secs(120);
const SLOW_ERASE_RETRIES: u32 = 4;

/// Bounds applied while the device reports it is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Cap on a single `bwPollTimeout` sleep
    pub max_poll_timeout: Duration,
    /// Cap on the total time spent waiting in one busy phase
    pub max_wait: Duration,
    /// Number of times an exhausted wait is restarted before giving up
    pub retries: u32,
    /// Consecutive busy responses with a zero poll timeout treated as a
    /// stuck device
    pub max_zero_polls: u32,
    /// Ignore `bwPollTimeout` and always sleep this long
    pub fixed_poll_timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            max_poll_timeout: Duration::from_secs(40),
            max_wait: Duration::from_secs(60),
            retries: 2,
            max_zero_polls: 100,
            fixed_poll_timeout: None,
        }
    }
}

impl PollPolicy {
    pub fn for_quirks(quirks: Quirks) -> Self {
        let mut policy = PollPolicy::default();
        if quirks.contains(Quirks::IGNORE_POLL_TIMEOUT) {
            policy.fixed_poll_timeout = Some(DEFAULT_POLL_TIMEOUT);
        }
        if quirks.contains(Quirks::SLOW_ERASE) {
            policy.max_wait = SLOW_ERASE_MAX_WAIT;
            policy.retries = SLOW_ERASE_RETRIES;
        }
        policy
    }
}

/// Next action of a poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Device left the busy state
    Ready,
    /// Sleep, then poll again
    Sleep(Duration),
    /// Wait budget and all restarts are used up
    Exceeded { waited: Duration },
}

/// Wait state of one busy phase, fed with each status response
#[derive(Debug, Clone)]
pub struct PollWait {
    policy: PollPolicy,
    waited: Duration,
    total: Duration,
    zero_polls: u32,
    restarts: u32,
}

impl PollWait {
    pub fn new(policy: PollPolicy) -> Self {
        PollWait {
            policy,
            waited: Duration::ZERO,
            total: Duration::ZERO,
            zero_polls: 0,
            restarts: 0,
        }
    }

    /// Time slept so far, restarts included
    pub fn waited(&self) -> Duration {
        self.total
    }

    /// Account for one status response. `reported` is `bwPollTimeout`.
    pub fn step(&mut self, busy: bool, reported: Duration) -> PollStep {
        if !busy {
            return PollStep::Ready;
        }

        if reported.is_zero() {
            self.zero_polls += 1;
        } else {
            self.zero_polls = 0;
        }

        let timeout = self
            .policy
            .fixed_poll_timeout
            .unwrap_or(reported)
            .min(self.policy.max_poll_timeout);

        let stuck = self.zero_polls >= self.policy.max_zero_polls;
        if stuck || self.waited + timeout > self.policy.max_wait {
            if self.restarts >= self.policy.retries {
                return PollStep::Exceeded {
                    waited: self.total,
                };
            }
            self.restarts += 1;
            log::warn!(
                "Device still busy after {:?}, waiting again ({}/{})",
                self.waited,
                self.restarts,
                self.policy.retries
            );
            self.restart();
        }

        self.waited += timeout;
        self.total += timeout;
        PollStep::Sleep(timeout)
    }

    /// Start a fresh budget, keeping the restart count.
    pub fn restart(&mut self) {
        self.waited = Duration::ZERO;
        self.zero_polls = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_ready_when_not_busy() {
        let mut wait = PollWait::new(PollPolicy::default());
        assert_eq!(wait.step(false, ms(500)), PollStep::Ready);
        assert_eq!(wait.waited(), Duration::ZERO);
    }

    #[test]
    fn test_sleep_is_capped() {
        let policy = PollPolicy {
            max_poll_timeout: ms(100),
            ..Default::default()
        };
        let mut wait = PollWait::new(policy);
        assert_eq!(wait.step(true, ms(30)), PollStep::Sleep(ms(30)));
        assert_eq!(wait.step(true, ms(5000)), PollStep::Sleep(ms(100)));
        assert_eq!(wait.waited(), ms(130));
    }

    #[test]
    fn test_fixed_poll_timeout() {
        let mut wait =
            PollWait::new(PollPolicy::for_quirks(Quirks::IGNORE_POLL_TIMEOUT));
        assert_eq!(wait.step(true, ms(2000)), PollStep::Sleep(ms(5)));
    }

    #[test]
    fn test_slow_erase_raises_budget() {
        let default = PollPolicy::default();
        let policy = PollPolicy::for_quirks(Quirks::SLOW_ERASE);
        assert_eq!(policy.max_wait, Duration::from_secs(120));
        assert_eq!(policy.retries, 4);
        assert_eq!(policy.max_poll_timeout, default.max_poll_timeout);
        assert_eq!(policy.fixed_poll_timeout, None);

        // 40 s sleeps: three fit in each 120 s budget, five budgets
        let mut wait = PollWait::new(policy);
        let mut sleeps = 0;
        while let PollStep::Sleep(_) = wait.step(true, Duration::from_secs(40)) {
            sleeps += 1;
        }
        assert_eq!(sleeps, 15);
        assert_eq!(wait.waited(), Duration::from_secs(600));

        let both = PollPolicy::for_quirks(
            Quirks::SLOW_ERASE | Quirks::IGNORE_POLL_TIMEOUT,
        );
        assert_eq!(both.fixed_poll_timeout, Some(DEFAULT_POLL_TIMEOUT));
        assert_eq!(both.retries, 4);
    }

    #[test]
    fn test_budget_restarts_then_fails() {
        let policy = PollPolicy {
            max_wait: ms(100),
            retries: 2,
            ..Default::default()
        };
        let mut wait = PollWait::new(policy);
        let mut sleeps = 0;
        let waited = loop {
            match wait.step(true, ms(50)) {
                PollStep::Sleep(_) => sleeps += 1,
                PollStep::Exceeded { waited } => break waited,
                PollStep::Ready => unreachable!(),
            }
        };
        // two sleeps per budget, three budgets
        assert_eq!(sleeps, 6);
        assert_eq!(waited, ms(300));
    }

    #[test]
    fn test_zero_timeouts_count_as_stuck() {
        let policy = PollPolicy {
            max_zero_polls: 3,
            retries: 0,
            ..Default::default()
        };
        let mut wait = PollWait::new(policy);
        assert_eq!(wait.step(true, ms(0)), PollStep::Sleep(ms(0)));
        assert_eq!(wait.step(true, ms(0)), PollStep::Sleep(ms(0)));
        assert!(matches!(
            wait.step(true, ms(0)),
            PollStep::Exceeded { .. }
        ));

        let mut wait = PollWait::new(policy);
        wait.step(true, ms(0));
        wait.step(true, ms(0));
        // a non-zero timeout resets the count
        assert_eq!(wait.step(true, ms(1)), PollStep::Sleep(ms(1)));
        assert_eq!(wait.step(true, ms(0)), PollStep::Sleep(ms(0)));
    }
}
