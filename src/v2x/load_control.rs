//! Keeps the V2X simulator close to a target share of the sync interval.

use crate::global_variables::V2X_LOAD_DEADZONE;
use std::time::Duration;

/// Shares of one sync interval spent in the phases of an exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseFractions {
    pub prepare: f64,
    pub exchange: f64,
    pub process: f64,
}

impl PhaseFractions {
    pub fn measure(prepare: Duration, exchange: Duration, process: Duration, interval: Duration) -> Self {
        let interval = interval.as_secs_f64();
        if interval <= 0.0 {
            return PhaseFractions {
                prepare: 0.0,
                exchange: 0.0,
                process: 0.0,
            };
        }
        PhaseFractions {
            prepare: prepare.as_secs_f64() / interval,
            exchange: exchange.as_secs_f64() / interval,
            process: process.as_secs_f64() / interval,
        }
    }

    pub fn total(&self) -> f64 {
        self.prepare + self.exchange + self.process
    }
}

/// Proportional controller for the vehicle budget.
///
/// Assumes the exchange time grows linearly with the number of reported
/// vehicles and rescales the budget so the next exchange lands on `threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadController {
    threshold: f64,
    deadzone: f64,
}

impl LoadController {
    pub fn new(threshold: f64) -> Self {
        LoadController {
            threshold,
            deadzone: V2X_LOAD_DEADZONE,
        }
    }

    pub fn with_deadzone(mut self, deadzone: f64) -> Self {
        self.deadzone = deadzone;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Budget for the next exchange, `None` to keep `current`.
    pub fn adjust(&self, current: usize, measured: f64) -> Option<usize> {
        if current == 0 || !measured.is_finite() || measured <= 0.0 {
            return None;
        }
        if (self.threshold - measured).abs() <= self.deadzone {
            return None;
        }
        let per_vehicle = measured / current as f64;
        let next = ((self.threshold / per_vehicle) as usize).max(1);
        if next == current {
            return None;
        }
        log::info!(
            "Adjusting max vehicles from {} to {} (ratio per vehicle: {:.3})",
            current,
            next,
            per_vehicle
        );
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inside_deadzone_keeps_budget() {
        let controller = LoadController::new(0.5);
        assert_eq!(controller.adjust(100, 0.51), None);
        assert_eq!(controller.adjust(100, 0.49), None);
    }

    #[test]
    fn overload_shrinks_budget_proportionally() {
        let controller = LoadController::new(0.5);
        assert_eq!(controller.adjust(100, 1.0), Some(50));
        assert_eq!(controller.adjust(40, 0.25), Some(80));
    }

    #[test]
    fn budget_never_drops_below_one() {
        let controller = LoadController::new(0.01);
        assert_eq!(controller.adjust(2, 0.9), Some(1));
        assert_eq!(controller.adjust(1, 0.9), None);
    }

    #[test]
    fn zero_or_invalid_measurement_is_ignored() {
        let controller = LoadController::new(0.5);
        assert_eq!(controller.adjust(10, 0.0), None);
        assert_eq!(controller.adjust(10, f64::NAN), None);
        assert_eq!(controller.adjust(0, 0.7), None);
    }

    #[test]
    fn fractions_relate_to_interval() {
        let fractions = PhaseFractions::measure(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(5),
            Duration::from_millis(100),
        );
        assert!((fractions.exchange - 0.5).abs() < 1e-9);
        assert!((fractions.total() - 0.65).abs() < 1e-9);
    }
}
