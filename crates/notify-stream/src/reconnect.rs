// Reconnection policy for the notification channel.
//
// Exponential backoff with bounded jitter, two regimes (ordinary disconnects vs
// abnormal closures that point at a struggling backend) and two give-up limits.

use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Intentional close, never retried.
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without a close frame (or rejected by the server).
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close frame without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Classification of a close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// 1000, no retry
    Normal,
    /// 1006, slower regime and a stricter consecutive cap
    Abnormal,
    /// Any other code, normal regime
    Other(u16),
}

impl CloseKind {
    pub fn from_code(code: u16) -> Self {
        match code {
            CLOSE_NORMAL => Self::Normal,
            CLOSE_ABNORMAL => Self::Abnormal,
            other => Self::Other(other),
        }
    }

    pub fn is_server_error(self) -> bool {
        matches!(self, Self::Abnormal)
    }
}

/// Outcome of consulting the policy after a failed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule the next attempt after this delay.
    Retry(Duration),
    /// Stop retrying until the lifecycle is re-evaluated.
    GiveUp,
}

/// Configuration for reconnect behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Base delay of the normal regime. Actual delay = base * 2^attempt + jitter.
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Cap of the normal regime.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Base multiplier of the server-error regime.
    pub server_error_base_multiplier: u32,
    /// Cap multiplier of the server-error regime.
    pub server_error_cap_multiplier: u32,
    /// Hard ceiling on attempts since the last successful connection.
    pub max_attempts: u32,
    /// Consecutive abnormal closures tolerated before giving up.
    pub max_consecutive_server_errors: u32,
    /// When true, adds random jitter of [0, base/2), never exceeding the cap.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            server_error_base_multiplier: 3,
            server_error_cap_multiplier: 2,
            max_attempts: 10,
            max_consecutive_server_errors: 5,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the attempt numbered `attempt` (0-indexed) in the chosen
    /// regime, or [`ReconnectDecision::GiveUp`] once the attempt ceiling is hit.
    pub fn next_delay(&self, attempt: u32, was_server_error: bool) -> ReconnectDecision {
        if attempt >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        ReconnectDecision::Retry(self.delay_for_attempt(attempt, was_server_error))
    }

    fn regime(&self, was_server_error: bool) -> (Duration, Duration) {
        if was_server_error {
            (
                self.base_delay
                    .saturating_mul(self.server_error_base_multiplier),
                self.max_delay.saturating_mul(self.server_error_cap_multiplier),
            )
        } else {
            (self.base_delay, self.max_delay)
        }
    }

    /// Deterministic part of the delay: `base * 2^attempt`, capped.
    pub fn base_delay_for_attempt(&self, attempt: u32, was_server_error: bool) -> Duration {
        let (base, cap) = self.regime(was_server_error);
        // 2^attempt is computed with a checked shift so attempts >= 32 saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        base.checked_mul(multiplier).unwrap_or(cap).min(cap)
    }

    fn delay_for_attempt(&self, attempt: u32, was_server_error: bool) -> Duration {
        let (base, cap) = self.regime(was_server_error);
        let capped = self.base_delay_for_attempt(attempt, was_server_error);

        if !self.jitter {
            return capped;
        }

        // Jitter stays below base/2, which is less than the gap to the next
        // uncapped step, and never pushes past the cap.
        let jitter_range_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms = u64::try_from(cap.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(cap)
    }
}

/// Failure history for the current connection segment.
#[derive(Debug, Clone, Default)]
pub struct ReconnectTracker {
    attempts: u32,
    consecutive_server_errors: u32,
}

impl ReconnectTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts scheduled since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_server_errors(&self) -> u32 {
        self.consecutive_server_errors
    }

    /// Record an unintentional closure and decide what to do next.
    ///
    /// Every 1006 closure is scheduled in the slow regime, including the
    /// first, so after two consecutive 1006 closures the third attempt is
    /// already slow (3s, 6s, then 12s with the default policy). The fifth
    /// consecutive 1006 closure gives up: four retries follow the initial
    /// connection and no sixth attempt is made.
    pub fn on_close(&mut self, policy: &ReconnectPolicy, kind: CloseKind) -> ReconnectDecision {
        let server_error = kind.is_server_error();
        if server_error {
            self.consecutive_server_errors += 1;
            if self.consecutive_server_errors >= policy.max_consecutive_server_errors {
                return ReconnectDecision::GiveUp;
            }
        } else {
            self.consecutive_server_errors = 0;
        }

        let decision = policy.next_delay(self.attempts, server_error);
        if matches!(decision, ReconnectDecision::Retry(_)) {
            self.attempts += 1;
        }
        decision
    }

    /// Called on every successful `Connected` transition.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.consecutive_server_errors = 0;
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_close_classification() {
        assert_eq!(CloseKind::from_code(1000), CloseKind::Normal);
        assert_eq!(CloseKind::from_code(1006), CloseKind::Abnormal);
        assert_eq!(CloseKind::from_code(1011), CloseKind::Other(1011));
        assert!(CloseKind::Abnormal.is_server_error());
        assert!(!CloseKind::Other(1001).is_server_error());
    }

    #[test]
    fn delay_without_jitter_is_deterministic() {
        let policy = no_jitter();
        assert_eq!(
            policy.next_delay(0, false),
            ReconnectDecision::Retry(Duration::from_secs(1))
        );
        assert_eq!(
            policy.next_delay(1, false),
            ReconnectDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            policy.next_delay(2, false),
            ReconnectDecision::Retry(Duration::from_secs(4))
        );
        assert_eq!(
            policy.next_delay(9, false),
            ReconnectDecision::Retry(Duration::from_secs(30))
        );
    }

    #[test]
    fn server_error_regime_is_slower() {
        let policy = no_jitter();
        assert_eq!(
            policy.next_delay(0, true),
            ReconnectDecision::Retry(Duration::from_secs(3))
        );
        assert_eq!(
            policy.next_delay(9, true),
            ReconnectDecision::Retry(Duration::from_secs(60))
        );
    }

    #[test]
    fn delay_with_jitter_stays_in_range() {
        let policy = ReconnectPolicy::default();
        for _ in 0..32 {
            let ReconnectDecision::Retry(delay) = policy.next_delay(0, false) else {
                panic!("expected retry");
            };
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay < Duration::from_millis(1500));

            let ReconnectDecision::Retry(delay) = policy.next_delay(8, true) else {
                panic!("expected retry");
            };
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn gives_up_at_attempt_ceiling() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..no_jitter()
        };
        let mut tracker = ReconnectTracker::new();
        for _ in 0..3 {
            assert!(matches!(
                tracker.on_close(&policy, CloseKind::Other(1001)),
                ReconnectDecision::Retry(_)
            ));
        }
        assert_eq!(
            tracker.on_close(&policy, CloseKind::Other(1001)),
            ReconnectDecision::GiveUp
        );
    }

    #[test]
    fn gives_up_after_consecutive_server_errors() {
        let policy = no_jitter();
        let mut tracker = ReconnectTracker::new();

        let first = tracker.on_close(&policy, CloseKind::Abnormal);
        let second = tracker.on_close(&policy, CloseKind::Abnormal);
        assert_eq!(first, ReconnectDecision::Retry(Duration::from_secs(3)));
        assert_eq!(second, ReconnectDecision::Retry(Duration::from_secs(6)));

        assert!(matches!(
            tracker.on_close(&policy, CloseKind::Abnormal),
            ReconnectDecision::Retry(_)
        ));
        assert!(matches!(
            tracker.on_close(&policy, CloseKind::Abnormal),
            ReconnectDecision::Retry(_)
        ));
        assert_eq!(
            tracker.on_close(&policy, CloseKind::Abnormal),
            ReconnectDecision::GiveUp
        );
    }

    #[test]
    fn third_attempt_after_two_abnormal_closes_is_slow() {
        let policy = no_jitter();
        let mut tracker = ReconnectTracker::new();
        tracker.on_close(&policy, CloseKind::Abnormal);
        tracker.on_close(&policy, CloseKind::Abnormal);

        // Normal regime at this attempt would be 4s.
        assert_eq!(
            tracker.on_close(&policy, CloseKind::Abnormal),
            ReconnectDecision::Retry(Duration::from_secs(12))
        );
        assert_eq!(
            policy.next_delay(2, false),
            ReconnectDecision::Retry(Duration::from_secs(4))
        );
    }

    #[test]
    fn ordinary_close_breaks_server_error_streak() {
        let policy = no_jitter();
        let mut tracker = ReconnectTracker::new();
        for _ in 0..4 {
            tracker.on_close(&policy, CloseKind::Abnormal);
        }
        tracker.on_close(&policy, CloseKind::Other(1001));
        assert_eq!(tracker.consecutive_server_errors(), 0);
        assert!(matches!(
            tracker.on_close(&policy, CloseKind::Abnormal),
            ReconnectDecision::Retry(_)
        ));
    }

    #[test]
    fn reset_returns_to_base_delay() {
        let policy = no_jitter();
        let mut tracker = ReconnectTracker::new();
        tracker.on_close(&policy, CloseKind::Other(1001));
        tracker.on_close(&policy, CloseKind::Other(1001));
        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
        assert_eq!(
            tracker.on_close(&policy, CloseKind::Other(1001)),
            ReconnectDecision::Retry(Duration::from_secs(1))
        );
    }

    proptest! {
        #[test]
        fn delay_is_non_decreasing_within_regime(attempt in 0u32..40, server in any::<bool>()) {
            let policy = ReconnectPolicy { max_attempts: 64, ..Default::default() };
            let ReconnectDecision::Retry(current) = policy.next_delay(attempt, server) else {
                unreachable!();
            };
            let ReconnectDecision::Retry(next) = policy.next_delay(attempt + 1, server) else {
                unreachable!();
            };
            prop_assert!(next >= current);
        }
    }
}
