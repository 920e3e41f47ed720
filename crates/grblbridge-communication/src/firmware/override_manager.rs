//! Feed rate override tracking
//!
//! The device applies feed overrides itself; this tracker mirrors the
//! operator's percentage and the last planar feed rate seen on the wire so
//! clients can display the effective rate.

use grblbridge_core::{FeedRateOverride, FeedRateUnits};

/// Lowest override percentage the device accepts
pub const MINIMUM_OVERRIDE: u32 = 10;
/// Highest override percentage the device accepts
pub const MAXIMUM_OVERRIDE: u32 = 200;
/// Step applied by one increase/decrease action
pub const OVERRIDE_INCREMENT: u32 = 10;

/// Tracks base feed rate and operator override percentage
#[derive(Debug, Clone)]
pub struct FeedRateTracker {
    minimum: u32,
    maximum: u32,
    increment: u32,
    percentage: u32,
    base_rate: Option<f64>,
    unit: Option<FeedRateUnits>,
}

impl FeedRateTracker {
    /// Create a tracker with explicit limits
    pub fn new(minimum: u32, maximum: u32, increment: u32) -> Self {
        Self {
            minimum,
            maximum,
            increment,
            percentage: 100,
            base_rate: None,
            unit: None,
        }
    }

    /// Restore 100% and forget the base rate
    pub fn reset(&mut self) {
        self.percentage = 100;
        self.base_rate = None;
    }

    /// Record the commanded feed rate
    ///
    /// Returns `true` when the rate or unit differs from what was recorded.
    pub fn set_base_rate(&mut self, rate: f64, unit: FeedRateUnits) -> bool {
        if self.base_rate != Some(rate) || self.unit != Some(unit) {
            self.base_rate = Some(rate);
            self.unit = Some(unit);
            true
        } else {
            false
        }
    }

    /// Step the override up, saturating at the maximum
    pub fn increase(&mut self) {
        self.percentage = (self.percentage + self.increment).min(self.maximum);
    }

    /// Step the override down, saturating at the minimum
    pub fn decrease(&mut self) {
        self.percentage = self
            .percentage
            .saturating_sub(self.increment)
            .max(self.minimum);
    }

    /// Current override percentage
    pub fn percentage(&self) -> u32 {
        self.percentage
    }

    /// Effective rate, `None` until a base rate is known
    pub fn current_rate(&self) -> Option<f64> {
        self.base_rate.map(|rate| rate * (self.percentage as f64 / 100.0))
    }

    /// Unit of the recorded base rate
    pub fn unit(&self) -> Option<FeedRateUnits> {
        self.unit
    }

    /// Snapshot for reporting
    pub fn snapshot(&self) -> FeedRateOverride {
        FeedRateOverride {
            percentage: self.percentage,
            value: self.current_rate(),
            unit: self.unit,
        }
    }
}

impl Default for FeedRateTracker {
    fn default() -> Self {
        Self::new(MINIMUM_OVERRIDE, MAXIMUM_OVERRIDE, OVERRIDE_INCREMENT)
    }
}
