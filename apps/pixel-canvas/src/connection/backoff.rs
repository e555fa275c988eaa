use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter between reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    /// `None` retries forever (still capped by `ceiling`).
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
            max_attempts: Some(5),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Report connection failures and stay disconnected.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    pub fn indefinite(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            max_attempts: None,
            jitter: true,
        }
    }

    /// `attempt` counts retries already made since the last successful handshake.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map(|max| attempt < max).unwrap_or(true)
    }

    /// Upper bound of the delay before retry number `attempt` (zero-based).
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }

    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling_for(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let upper = ceiling.as_nanos().min(u64::MAX as u128) as u64;
        let lower = upper / 2;
        Duration::from_nanos(rng.gen_range(lower..=upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn delays_double_until_ceiling() {
        let policy = ReconnectPolicy {
            jitter: false,
            ..ReconnectPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<_> = (0..7).map(|n| policy.delay_for(n, &mut rng)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16, 30, 30].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = ReconnectPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..10 {
            let ceiling = policy.ceiling_for(attempt);
            let delay = policy.delay_for(attempt, &mut rng);
            assert!(delay <= ceiling, "{delay:?} > {ceiling:?}");
            assert!(delay >= ceiling / 2, "{delay:?} < half of {ceiling:?}");
        }
    }

    #[test]
    fn attempt_budget() {
        assert!(!ReconnectPolicy::disabled().allows(0));
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
        let forever = ReconnectPolicy::indefinite(Duration::from_millis(10), Duration::from_secs(1));
        assert!(forever.allows(u32::MAX - 1));
        assert_eq!(forever.ceiling_for(40), Duration::from_secs(1));
    }
}
