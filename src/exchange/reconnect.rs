use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay applied between a failed feed session and the next attempt.
///
/// `Immediate` reconnects straight away, which is the historical behaviour of
/// the feed. A disconnect-heavy venue will then see reconnects in a tight loop,
/// so deployments that care should pick `Fixed` or `Exponential`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    Immediate,
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Immediate
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1 = first retry after a failure).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { base_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                let factor = 1u64 << shift;
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_immediate() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(50), Duration::ZERO);
    }

    #[test]
    fn exponential_doubles_until_capped() {
        let policy = ReconnectPolicy::Exponential { base_ms: 500, max_ms: 5_000 };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn deserialises_tagged_form() {
        let policy: ReconnectPolicy =
            serde_json::from_str(r#"{"kind":"fixed","delay_ms":250}"#).unwrap();
        assert_eq!(policy, ReconnectPolicy::Fixed { delay_ms: 250 });
        let immediate: ReconnectPolicy = serde_json::from_str(r#"{"kind":"immediate"}"#).unwrap();
        assert_eq!(immediate, ReconnectPolicy::Immediate);
    }
}
