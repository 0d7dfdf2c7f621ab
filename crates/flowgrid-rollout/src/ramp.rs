//! Ramp-up — percentage-controlled rollout of container dispatch.

use std::sync::atomic::{AtomicU32, Ordering};

use flowgrid_core::config::RampMode;
use rand::Rng;

use crate::error::{RolloutError, RolloutResult};

/// Stable 31-multiplier hash over UTF-16 code units.
///
/// Must never change: buckets already handed out would move.
fn name_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Bucket of a fully-qualified flow name, in `1..=100`.
pub fn ramp_bucket(flow_name: &str) -> u32 {
    name_hash(flow_name).unsigned_abs() % 100 + 1
}

/// Share of flows routed to containers.
#[derive(Debug)]
pub struct RampUp {
    percent: AtomicU32,
    mode: RampMode,
}

impl RampUp {
    pub fn new(percent: u32, mode: RampMode) -> RolloutResult<Self> {
        if percent > 100 {
            return Err(RolloutError::InvalidPercent(percent));
        }
        Ok(Self {
            percent: AtomicU32::new(percent),
            mode,
        })
    }

    pub fn percent(&self) -> u32 {
        self.percent.load(Ordering::Relaxed)
    }

    pub fn mode(&self) -> RampMode {
        self.mode
    }

    pub fn set_percent(&self, percent: u32) -> RolloutResult<()> {
        if percent > 100 {
            return Err(RolloutError::InvalidPercent(percent));
        }
        self.percent.store(percent, Ordering::Relaxed);
        Ok(())
    }

    /// Whether this flow falls inside the ramp.
    pub fn admits(&self, flow_name: &str) -> bool {
        match self.percent() {
            0 => false,
            100 => true,
            percent => match self.mode {
                RampMode::Deterministic => ramp_bucket(flow_name) <= percent,
                RampMode::Random => rand::rng().random_range(0..100) < percent,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_stable() {
        assert_eq!(ramp_bucket("proj.flowD"), 30);
        assert_eq!(ramp_bucket("proj.flow5"), 15);
        assert_eq!(ramp_bucket("proj.flow16"), 85);
        assert_eq!(ramp_bucket("proj.flow94"), 31);
        // Negative hash.
        assert_eq!(ramp_bucket("etl.hourly"), 99);
    }

    #[test]
    fn bucket_range() {
        for i in 0..500 {
            let bucket = ramp_bucket(&format!("project.flow_{i}"));
            assert!((1..=100).contains(&bucket));
        }
    }

    #[test]
    fn zero_and_hundred_are_absolute() {
        for mode in [RampMode::Deterministic, RampMode::Random] {
            let none = RampUp::new(0, mode).unwrap();
            let all = RampUp::new(100, mode).unwrap();
            for i in 0..200 {
                let flow = format!("p.f{i}");
                assert!(!none.admits(&flow));
                assert!(all.admits(&flow));
            }
        }
    }

    #[test]
    fn deterministic_boundary_is_inclusive() {
        let ramp = RampUp::new(30, RampMode::Deterministic).unwrap();
        assert!(ramp.admits("proj.flowD"));
        assert!(!ramp.admits("proj.flow94"));
        // Same answer every time.
        for _ in 0..20 {
            assert!(ramp.admits("proj.flow5"));
            assert!(!ramp.admits("proj.flow16"));
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(matches!(
            RampUp::new(101, RampMode::Deterministic),
            Err(RolloutError::InvalidPercent(101))
        ));
        let ramp = RampUp::new(10, RampMode::Deterministic).unwrap();
        assert!(ramp.set_percent(150).is_err());
        assert_eq!(ramp.percent(), 10);
        ramp.set_percent(55).unwrap();
        assert_eq!(ramp.percent(), 55);
    }
}
