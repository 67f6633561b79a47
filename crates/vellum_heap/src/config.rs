//! Heap collection configuration

use serde::{Deserialize, Serialize};

/// When the cycle sweep runs relative to suspect edge removals.
///
/// Local reference counting alone never reclaims a cycle, so every edge
/// removal that leaves a nonzero count marks the object as a suspect; the
/// policy decides how eagerly suspects are swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CollectPolicy {
    /// Sweep on every suspect-producing edge removal. Deterministic and
    /// leak-free at the cost of extra sweeps on large graphs.
    #[default]
    Eager,
    /// Sweep once the suspect tally reaches `suspect_threshold`.
    Threshold,
    /// Sweep only on explicit [`collect_cycles`](crate::Heap::collect_cycles)
    /// calls.
    Manual,
}

impl std::str::FromStr for CollectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eager" => Ok(CollectPolicy::Eager),
            "threshold" | "batched" => Ok(CollectPolicy::Threshold),
            "manual" | "none" => Ok(CollectPolicy::Manual),
            _ => Err(format!("Unknown collect policy: {}", s)),
        }
    }
}

/// Managed heap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapConfig {
    /// Cycle sweep scheduling policy.
    pub policy: CollectPolicy,
    /// Suspect count that triggers a sweep under [`CollectPolicy::Threshold`].
    pub suspect_threshold: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            policy: CollectPolicy::Eager,
            suspect_threshold: 64,
        }
    }
}

impl HeapConfig {
    pub fn new(policy: CollectPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(policy_str) = std::env::var("VELLUM_HEAP_POLICY")
            && let Ok(policy) = policy_str.parse()
        {
            config.policy = policy;
        }

        if let Ok(threshold) = std::env::var("VELLUM_HEAP_SUSPECT_THRESHOLD")
            && let Ok(threshold_val) = threshold.parse::<usize>()
        {
            config.suspect_threshold = threshold_val.max(1);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_known_spellings() {
        assert_eq!("eager".parse(), Ok(CollectPolicy::Eager));
        assert_eq!("Threshold".parse(), Ok(CollectPolicy::Threshold));
        assert_eq!("batched".parse(), Ok(CollectPolicy::Threshold));
        assert_eq!("manual".parse(), Ok(CollectPolicy::Manual));
        assert_eq!("none".parse(), Ok(CollectPolicy::Manual));
        assert!("generational".parse::<CollectPolicy>().is_err());
    }

    #[test]
    fn default_is_eager() {
        let config = HeapConfig::default();
        assert_eq!(config.policy, CollectPolicy::Eager);
        assert!(config.suspect_threshold > 0);
    }
}
