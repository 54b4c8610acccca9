//! Runtime-configurable tuning parameters for symra.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `SYMRA_`) or by constructing a custom `SymraConfig`.

use std::time::Duration;

use crate::types::BarrierAlgorithm;

/// Tuning parameters for the heap, barrier engine, queue pairs and bootstrap.
#[derive(Debug, Clone)]
pub struct SymraConfig {
    /// Symmetric heap size in bytes. Must be identical on every PE; the
    /// signal-slot region is carved from its head.
    pub heap_size: usize,

    /// Maximum number of live teams. Bounds the signal region size.
    pub max_teams: usize,

    /// Work/completion queue depth per queue pair. Power of two.
    pub qp_depth: u32,

    /// Posting stops and drains completions when the ring has fewer than
    /// this many free slots.
    pub backpressure_threshold: u32,

    /// Parallel workers per PE that enter collective calls together.
    pub workers: u32,

    /// Cross-device barrier algorithm.
    pub barrier_algorithm: BarrierAlgorithm,

    /// Team sizes at or below this use the centralized barrier under
    /// `BarrierAlgorithm::Auto`.
    pub centralized_max_team: u32,

    /// Connection-refused retries during bootstrap, with `retry_sleep`
    /// between attempts.
    pub refused_retries: u32,

    /// Connection-timeout retries during bootstrap.
    pub timedout_retries: u32,

    /// Sleep between bootstrap connect retries.
    pub retry_sleep: Duration,

    /// Route every peer through the queue-pair engine even when its heap
    /// is directly addressable.
    pub force_rdma: bool,
}

impl Default for SymraConfig {
    fn default() -> Self {
        Self {
            heap_size: 64 * 1024 * 1024, // 64 MiB
            max_teams: 64,
            qp_depth: 1024,
            backpressure_threshold: 10,
            workers: 1,
            barrier_algorithm: BarrierAlgorithm::Auto,
            centralized_max_team: 8,
            refused_retries: 100_000,
            timedout_retries: 50,
            retry_sleep: Duration::from_micros(1000),
            force_rdma: false,
        }
    }
}

impl SymraConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `SYMRA_HEAP_SIZE`
    /// - `SYMRA_MAX_TEAMS`
    /// - `SYMRA_QP_DEPTH`
    /// - `SYMRA_BACKPRESSURE_THRESHOLD`
    /// - `SYMRA_WORKERS`
    /// - `SYMRA_BARRIER_ALGO` (`auto`, `dissem`, `group`, `central`)
    /// - `SYMRA_CENTRALIZED_MAX_TEAM`
    /// - `SYMRA_REFUSED_RETRIES`
    /// - `SYMRA_TIMEDOUT_RETRIES`
    /// - `SYMRA_RETRY_SLEEP_US`
    /// - `SYMRA_FORCE_RDMA`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SYMRA_HEAP_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.heap_size = n;
            }
        }
        if let Ok(v) = std::env::var("SYMRA_MAX_TEAMS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_teams = n;
            }
        }
        if let Ok(v) = std::env::var("SYMRA_QP_DEPTH") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.qp_depth = n;
            }
        }
        if let Ok(v) = std::env::var("SYMRA_BACKPRESSURE_THRESHOLD") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.backpressure_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("SYMRA_WORKERS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.workers = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("SYMRA_BARRIER_ALGO") {
            cfg.barrier_algorithm = match v.as_str() {
                "dissem" => BarrierAlgorithm::Dissemination,
                "group" => BarrierAlgorithm::GroupDissemination,
                "central" => BarrierAlgorithm::Centralized,
                _ => BarrierAlgorithm::Auto,
            };
        }
        if let Ok(v) = std::env::var("SYMRA_CENTRALIZED_MAX_TEAM") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.centralized_max_team = n;
            }
        }
        if let Ok(v) = std::env::var("SYMRA_REFUSED_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.refused_retries = n;
            }
        }
        if let Ok(v) = std::env::var("SYMRA_TIMEDOUT_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.timedout_retries = n;
            }
        }
        if let Ok(v) = std::env::var("SYMRA_RETRY_SLEEP_US") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.retry_sleep = Duration::from_micros(n);
            }
        }
        if let Ok(v) = std::env::var("SYMRA_FORCE_RDMA") {
            cfg.force_rdma = v == "1" || v.eq_ignore_ascii_case("true");
        }

        cfg
    }

    /// Reject configurations the data plane cannot run with.
    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        use crate::error::SymraError;
        if !self.qp_depth.is_power_of_two() {
            return Err(SymraError::InvalidValue {
                what: "qp_depth",
                value: self.qp_depth as i64,
            });
        }
        if self.backpressure_threshold >= self.qp_depth {
            return Err(SymraError::InvalidValue {
                what: "backpressure_threshold",
                value: self.backpressure_threshold as i64,
            });
        }
        if self.workers == 0 {
            return Err(SymraError::InvalidValue {
                what: "workers",
                value: 0,
            });
        }
        let sync_bytes = self.max_teams * crate::types::TEAM_SYNC_BYTES;
        if sync_bytes >= self.heap_size {
            return Err(SymraError::InvalidParameter(format!(
                "heap_size {} too small for {} teams ({} sync bytes)",
                self.heap_size, self.max_teams, sync_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        SymraConfig::default().validate().unwrap();
    }

    #[test]
    fn test_non_power_of_two_depth_rejected() {
        let cfg = SymraConfig {
            qp_depth: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_threshold_must_leave_room() {
        let cfg = SymraConfig {
            qp_depth: 8,
            backpressure_threshold: 8,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_env_overrides() {
        // Process-global env; keep every var this test touches unique to it.
        std::env::set_var("SYMRA_QP_DEPTH", "256");
        std::env::set_var("SYMRA_BARRIER_ALGO", "group");
        std::env::set_var("SYMRA_FORCE_RDMA", "true");
        std::env::set_var("SYMRA_RETRY_SLEEP_US", "250");
        let cfg = SymraConfig::from_env();
        std::env::remove_var("SYMRA_QP_DEPTH");
        std::env::remove_var("SYMRA_BARRIER_ALGO");
        std::env::remove_var("SYMRA_FORCE_RDMA");
        std::env::remove_var("SYMRA_RETRY_SLEEP_US");
        assert_eq!(cfg.qp_depth, 256);
        assert_eq!(cfg.barrier_algorithm, BarrierAlgorithm::GroupDissemination);
        assert!(cfg.force_rdma);
        assert_eq!(cfg.retry_sleep, Duration::from_micros(250));
        // Untouched fields keep their defaults.
        assert_eq!(cfg.workers, 1);
    }

    #[test]
    fn test_tiny_heap_rejected() {
        let cfg = SymraConfig {
            heap_size: 4096,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
