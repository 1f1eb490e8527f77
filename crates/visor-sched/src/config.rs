//! Scheduler configuration
//!
//! All product tuning lives here: shot budgets, the sensor-request
//! look-back window, retry budgets for cancel and drain, and the
//! shared-task scheduling quantum. Defaults match a two-deep sensor
//! pipeline with a 30 fps preview stream.
//!
//! # Examples
//!
//! ```rust
//! use visor_sched::SchedConfig;
//!
//! let config = SchedConfig::builder()
//!     .asyn_shots(2)
//!     .sync_shots(2)
//!     .queue_capacity(8)
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use visor_hw::Slot;

/// Scheduling priority class for a stage worker
///
/// Recorded configuration rather than an OS scheduling parameter: the
/// runtime treats all workers equally, but the class is kept for
/// diagnostics and for adapters that map workers onto real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Compute stages, deadline-tolerant
    Normal,
    /// Sensor-facing stages, must keep up with the sensor clock
    High,
}

/// Scheduler tuning parameters
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Shots that may run ahead of the sensor on an asynchronous stage
    pub asyn_shots: u32,
    /// Shots budgeted for sensor-synchronized dispatch
    pub sync_shots: u32,
    /// Minimum available-shot level below which dispatch always waits for
    /// the sensor instead of running ahead
    pub min_sync_shots: u32,
    /// Initial shots to skip reporting for (sensor settle frames)
    pub skip_shots: u32,
    /// Frames per stage queue
    pub queue_capacity: u32,
    /// Sensor-request override window: how many queued-but-undispatched
    /// frames a manual-exposure change is copied back onto
    pub lookback_depth: u32,
    /// Retries per drain phase
    pub drain_retry: u32,
    /// Remaining-retry level at which the drain force-fires parked waiters
    pub drain_escalation: u32,
    /// Sleep between drain retries
    pub drain_sleep: Duration,
    /// Retries for the cancel settle loop
    pub cancel_retry: u32,
    /// Sleep between cancel settle checks
    pub cancel_sleep: Duration,
    /// How long parked reprocessing work may wait before it is dispatched
    /// regardless of preview traffic
    pub quantum: Duration,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            asyn_shots: 1,
            sync_shots: 2,
            min_sync_shots: 2,
            skip_shots: 0,
            queue_capacity: 8,
            lookback_depth: 2,
            drain_retry: 150,
            drain_escalation: 100,
            drain_sleep: Duration::from_millis(1),
            cancel_retry: 300,
            cancel_sleep: Duration::from_millis(1),
            quantum: Duration::from_millis(300),
        }
    }
}

impl SchedConfig {
    /// Start building a configuration from the defaults
    #[must_use]
    pub fn builder() -> SchedConfigBuilder {
        SchedConfigBuilder::default()
    }

    /// Priority class for a stage worker
    #[must_use]
    pub fn priority_for(&self, slot: Slot) -> TaskPriority {
        if slot.is_sensor_facing() {
            TaskPriority::High
        } else {
            TaskPriority::Normal
        }
    }

    /// Validate the configuration, returning all issues found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.queue_capacity == 0 {
            issues.push("queue_capacity must be at least 1".to_string());
        }
        if self.queue_capacity > 64 {
            issues.push(format!(
                "queue_capacity {} exceeds the maximum of 64",
                self.queue_capacity
            ));
        }
        if self.asyn_shots + self.sync_shots == 0 {
            issues.push("asyn_shots + sync_shots must be at least 1".to_string());
        }
        if self.min_sync_shots == 0 {
            issues.push("min_sync_shots must be at least 1".to_string());
        }
        if self.drain_escalation >= self.drain_retry {
            issues.push(format!(
                "drain_escalation {} must be below drain_retry {}",
                self.drain_escalation, self.drain_retry
            ));
        }
        if self.quantum.is_zero() {
            issues.push("quantum must be non-zero".to_string());
        }
        if self.lookback_depth >= self.queue_capacity {
            issues.push(format!(
                "lookback_depth {} must be below queue_capacity {}",
                self.lookback_depth, self.queue_capacity
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Builder for [`SchedConfig`]
#[derive(Debug, Clone, Default)]
pub struct SchedConfigBuilder {
    config: SchedConfig,
}

impl SchedConfigBuilder {
    /// Set the asynchronous shot budget
    #[must_use]
    pub fn asyn_shots(mut self, shots: u32) -> Self {
        self.config.asyn_shots = shots;
        self
    }

    /// Set the sensor-synchronized shot budget
    #[must_use]
    pub fn sync_shots(mut self, shots: u32) -> Self {
        self.config.sync_shots = shots;
        self
    }

    /// Set the minimum available-shot level for running ahead
    #[must_use]
    pub fn min_sync_shots(mut self, shots: u32) -> Self {
        self.config.min_sync_shots = shots;
        self
    }

    /// Set the sensor settle-frame skip count
    #[must_use]
    pub fn skip_shots(mut self, shots: u32) -> Self {
        self.config.skip_shots = shots;
        self
    }

    /// Set the per-stage queue capacity
    #[must_use]
    pub fn queue_capacity(mut self, capacity: u32) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the sensor-request override window depth
    #[must_use]
    pub fn lookback_depth(mut self, depth: u32) -> Self {
        self.config.lookback_depth = depth;
        self
    }

    /// Set the per-phase drain retry budget
    #[must_use]
    pub fn drain_retry(mut self, retry: u32) -> Self {
        self.config.drain_retry = retry;
        self
    }

    /// Set the drain escalation threshold
    #[must_use]
    pub fn drain_escalation(mut self, threshold: u32) -> Self {
        self.config.drain_escalation = threshold;
        self
    }

    /// Set the sleep between drain retries
    #[must_use]
    pub fn drain_sleep(mut self, sleep: Duration) -> Self {
        self.config.drain_sleep = sleep;
        self
    }

    /// Set the cancel settle retry budget
    #[must_use]
    pub fn cancel_retry(mut self, retry: u32) -> Self {
        self.config.cancel_retry = retry;
        self
    }

    /// Set the shared-task scheduling quantum
    #[must_use]
    pub fn quantum(mut self, quantum: Duration) -> Self {
        self.config.quantum = quantum;
        self
    }

    /// Finish building
    #[must_use]
    pub fn build(self) -> SchedConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        SchedConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn test_validate_catches_issues() {
        let config = SchedConfig::builder()
            .queue_capacity(0)
            .asyn_shots(0)
            .sync_shots(0)
            .build();
        let issues = config.validate().expect_err("invalid config");
        assert!(issues.iter().any(|i| i.contains("queue_capacity")));
        assert!(issues.iter().any(|i| i.contains("asyn_shots")));
    }

    #[test]
    fn test_escalation_must_be_below_retry() {
        let config = SchedConfig::builder().drain_retry(50).drain_escalation(50).build();
        let issues = config.validate().expect_err("invalid config");
        assert!(issues.iter().any(|i| i.contains("drain_escalation")));
    }

    #[test]
    fn test_priority_for_slot() {
        let config = SchedConfig::default();
        assert_eq!(config.priority_for(Slot::Sensor), TaskPriority::High);
        assert_eq!(config.priority_for(Slot::Isp), TaskPriority::Normal);
    }
}
