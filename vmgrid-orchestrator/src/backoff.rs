use std::time::Duration;

use crate::config::PollPolicy;

/// Exponential poll delay: `initial`, then multiplied after every wait, capped at `max`.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl PollBackoff {
    pub fn new(policy: &PollPolicy) -> Self {
        Self {
            next: policy.initial.min(policy.max),
            max: policy.max,
            multiplier: policy.multiplier,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.mul_f64(self.multiplier).min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = PollBackoff::new(&PollPolicy::default());
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn multiplier_of_one_keeps_a_fixed_cadence() {
        let policy = PollPolicy {
            multiplier: 1.0,
            ..PollPolicy::default()
        };
        let mut backoff = PollBackoff::new(&policy);
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
