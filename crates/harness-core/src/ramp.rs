use crate::config::{RampConfig, RampStep};
use std::time::Duration;

/// Deterministic ramp planner: steps are applied strictly in order,
/// each one holding a target population of simulated users.
#[derive(Debug, Clone)]
pub struct RampPlanner {
    steps: Vec<RampStep>,
    duration_cap_ms: Option<u64>,
}

impl RampPlanner {
    pub fn new(config: RampConfig) -> Self {
        Self {
            steps: config.steps,
            duration_cap_ms: None,
        }
    }

    /// Stop the run at `cap_ms` even if steps remain.
    pub fn with_duration_cap(mut self, cap_ms: Option<u64>) -> Self {
        self.duration_cap_ms = cap_ms;
        self
    }

    pub fn steps(&self) -> &[RampStep] {
        &self.steps
    }

    /// Total run length in milliseconds, honoring the duration cap.
    pub fn total_duration_ms(&self) -> u64 {
        let planned: u64 = self.steps.iter().map(|s| s.hold_ms).sum();
        match self.duration_cap_ms {
            Some(cap) => planned.min(cap),
            None => planned,
        }
    }

    /// Target user count at a given elapsed time, or `None` once the run is over.
    pub fn target_users(&self, elapsed_ms: u64) -> Option<u32> {
        if elapsed_ms >= self.total_duration_ms() {
            return None;
        }
        let mut cumulative_ms = 0u64;
        for step in &self.steps {
            if elapsed_ms < cumulative_ms + step.hold_ms {
                return Some(step.users);
            }
            cumulative_ms += step.hold_ms;
        }
        None
    }

    /// Interval between user starts for a hatch rate in users per second.
    pub fn hatch_interval(hatch_rate: u32) -> Duration {
        if hatch_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(1_000_000 / hatch_rate as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_config() -> RampConfig {
        RampConfig {
            steps: vec![
                RampStep {
                    users: 10,
                    hold_ms: 5000,
                },
                RampStep {
                    users: 50,
                    hold_ms: 10000,
                },
            ],
        }
    }

    #[test]
    fn test_ramp_planner_total_duration() {
        let planner = RampPlanner::new(two_step_config());
        assert_eq!(planner.total_duration_ms(), 15000);

        let capped = RampPlanner::new(two_step_config()).with_duration_cap(Some(8000));
        assert_eq!(capped.total_duration_ms(), 8000);
    }

    #[test]
    fn test_target_users() {
        let planner = RampPlanner::new(two_step_config());
        assert_eq!(planner.target_users(0), Some(10));
        assert_eq!(planner.target_users(4999), Some(10));
        assert_eq!(planner.target_users(5000), Some(50));
        assert_eq!(planner.target_users(14999), Some(50));
        assert_eq!(planner.target_users(15000), None);
    }

    #[test]
    fn test_target_users_respects_cap() {
        let planner = RampPlanner::new(two_step_config()).with_duration_cap(Some(6000));
        assert_eq!(planner.target_users(5500), Some(50));
        assert_eq!(planner.target_users(6000), None);
    }

    #[test]
    fn test_hatch_interval() {
        assert_eq!(RampPlanner::hatch_interval(10), Duration::from_millis(100));
        assert_eq!(RampPlanner::hatch_interval(0), Duration::ZERO);
    }
}
