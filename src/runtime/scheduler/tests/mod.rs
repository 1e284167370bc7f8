//! Phase scheduler unit tests
//!
//! Configuration, phase ordering, drain semantics, frame deferral and timers.

mod drain;

use crate::runtime::scheduler::{Phase, PhaseScheduler, SchedulerConfig, SchedulerStats};
use std::sync::atomic::Ordering;

pub(super) fn scheduler() -> PhaseScheduler {
    PhaseScheduler::with_workers(1).unwrap()
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.timer_phase, Phase::Update);
        assert_eq!(config.default_resume_phase, Phase::Update);
        assert_eq!(config.initial_time_scale, 1.0);
        assert!(config.catch_panics);
    }

    #[test]
    fn test_initial_time_scale_is_applied() {
        let config = SchedulerConfig {
            initial_time_scale: 0.5,
            ..SchedulerConfig::default()
        };
        let sched = PhaseScheduler::new(config, scheduler().pool().clone());
        assert_eq!(sched.time_scale(), 0.5);
    }

    #[test]
    fn test_negative_time_scale_is_clamped() {
        let sched = scheduler();
        sched.set_time_scale(-2.0);
        assert_eq!(sched.time_scale(), 0.0);
    }
}

#[cfg(test)]
mod phase_tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert_eq!(
            Phase::ALL,
            [
                Phase::PreUpdate,
                Phase::Update,
                Phase::LateUpdate,
                Phase::FixedUpdate,
                Phase::EndOfFrame,
            ]
        );
        assert_eq!(Phase::ALL.len(), Phase::COUNT);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::LateUpdate.to_string(), "LateUpdate");
    }
}

#[cfg(test)]
mod stats_tests {
    use super::*;

    #[test]
    fn test_record_resumed_counts_panics() {
        let stats = SchedulerStats::default();
        stats.record_resumed(true);
        stats.record_resumed(false);
        assert_eq!(stats.items_resumed.load(Ordering::Relaxed), 2);
        assert_eq!(stats.items_panicked.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_scheduling_is_counted() {
        let sched = scheduler();
        let _ = sched.yield_now();
        let _ = sched.next_frame();
        assert_eq!(sched.stats().items_scheduled.load(Ordering::Relaxed), 2);
        sched.tick(std::time::Duration::from_millis(16));
        assert_eq!(sched.stats().items_resumed.load(Ordering::Relaxed), 1);
    }
}
