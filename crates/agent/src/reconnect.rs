//! Reconnect pacing for the policy stream.
//!
//! Delays double per failed attempt up to a configured cap, and each
//! workstation adds its own spread on top so a fleet recovering from a
//! server outage does not reconnect in lockstep. The spread is seeded
//! from the client identity: deterministic for one agent across runs,
//! different across agents. The agent never gives up — a workstation
//! must re-attach whenever the server comes back, however long the
//! outage.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    /// Per-agent spread seed, folded from the client id.
    seed: u64,
}

impl ReconnectBackoff {
    /// Build the schedule from the configured delays and this agent's
    /// identity.
    pub fn new(initial_delay: Duration, max_delay: Duration, client_id: &str) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            seed: fold_client_id(client_id),
        }
    }

    /// Delay before reconnect attempt `attempt` (0-indexed): the initial
    /// delay doubled per failure until the cap, plus up to a quarter of
    /// the capped value as per-agent spread.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self.initial_delay.saturating_mul(1u32 << attempt.min(20));
        let capped = doubled.min(self.max_delay);

        let window_ms = capped.as_millis() as u64 / 4;
        if window_ms == 0 {
            return capped;
        }
        let spread_ms = scramble(self.seed ^ u64::from(attempt)) % (window_ms + 1);
        capped + Duration::from_millis(spread_ms)
    }
}

/// Fold the client id into a spread seed (FNV-1a).
fn fold_client_id(client_id: &str) -> u64 {
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in client_id.bytes() {
        acc ^= u64::from(byte);
        acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
    }
    acc
}

/// Turn (seed, attempt) into an offset inside the spread window. Not
/// cryptographic; it only has to decorrelate neighbouring attempts and
/// neighbouring hostnames.
fn scramble(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(client_id: &str) -> ReconnectBackoff {
        ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(60), client_id)
    }

    #[test]
    fn delay_doubles_until_the_cap() {
        let schedule = backoff("ws-01");
        // Spread adds at most 25%, so consecutive attempts still order.
        let d0 = schedule.delay_for_attempt(0);
        let d1 = schedule.delay_for_attempt(1);
        let d2 = schedule.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_never_exceeds_cap_plus_spread() {
        let schedule = ReconnectBackoff::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
            "ws-01",
        );
        for attempt in 0..64 {
            assert!(schedule.delay_for_attempt(attempt) <= Duration::from_millis(37_500));
        }
    }

    #[test]
    fn different_agents_spread_apart() {
        let a = backoff("ws-01");
        let b = backoff("ws-02");
        assert!(
            (0..8).any(|attempt| a.delay_for_attempt(attempt) != b.delay_for_attempt(attempt)),
            "two agents picked identical schedules"
        );
    }

    #[test]
    fn one_agent_is_deterministic_across_runs() {
        let first = backoff("ws-01");
        let second = backoff("ws-01");
        for attempt in 0..8 {
            assert_eq!(
                first.delay_for_attempt(attempt),
                second.delay_for_attempt(attempt)
            );
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let schedule = backoff("ws-01");
        let delay = schedule.delay_for_attempt(u32::MAX);
        assert!(delay <= Duration::from_millis(75_000));
    }

    #[test]
    fn cap_below_initial_is_raised_to_it() {
        let schedule = ReconnectBackoff::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
            "ws-01",
        );
        assert!(schedule.delay_for_attempt(0) >= Duration::from_secs(5));
    }
}
