use std::time::Duration;

use crate::config::SupervisorConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_ms: Vec<u64>,
    pub sustained_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            backoff_ms: config.backoff_ms.clone(),
            sustained_delay_ms: config.sustained_delay_ms,
        }
    }

    /// Attempts are 1-based; past the end of the pattern the sustained delay applies.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let ms = self
            .backoff_ms
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry { attempt: u32, delay: Duration },
    Escalate { failures: u32 },
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: ReconnectPolicy,
    consecutive_failures: u32,
}

impl Supervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) -> Verdict {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures > self.policy.max_attempts {
            return Verdict::Escalate {
                failures: self.consecutive_failures,
            };
        }
        Verdict::Retry {
            attempt: self.consecutive_failures,
            delay: self.policy.delay_for(self.consecutive_failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            backoff_ms: vec![100, 200],
            sustained_delay_ms: 500,
        }
    }

    #[test]
    fn backoff_follows_pattern_then_sustains() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn escalates_after_budget() {
        let mut supervisor = Supervisor::new(policy());

        for attempt in 1..=3 {
            assert!(matches!(
                supervisor.record_failure(),
                Verdict::Retry { attempt: a, .. } if a == attempt
            ));
        }
        assert_eq!(
            supervisor.record_failure(),
            Verdict::Escalate { failures: 4 }
        );
    }

    #[test]
    fn success_resets_budget() {
        let mut supervisor = Supervisor::new(policy());
        supervisor.record_failure();
        supervisor.record_failure();
        supervisor.record_success();

        assert_eq!(supervisor.consecutive_failures(), 0);
        assert_eq!(
            supervisor.record_failure(),
            Verdict::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn zero_attempts_escalates_immediately() {
        let mut supervisor = Supervisor::new(ReconnectPolicy {
            max_attempts: 0,
            ..policy()
        });
        assert_eq!(
            supervisor.record_failure(),
            Verdict::Escalate { failures: 1 }
        );
    }
}
