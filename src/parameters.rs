use embassy_time::Duration;

use crate::{
    DEFAULT_DEMOTION_THRESHOLD, DEFAULT_EWMA_LEVEL, DEFAULT_PROBE_INTERVAL_MS,
    DEFAULT_PROMOTION_THRESHOLD, DEFAULT_UPDATE_INTERVAL_MS, RateControlError,
};

/// The ARF counters are four bits wide.
const MAX_THRESHOLD: u8 = 15;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Tunable parameters of the rate control.
pub struct RateControlParameters {
    /// Weight of the previous success probability in percent, when blending in a new window.
    pub ewma_level: u8,
    /// Interval at which the statistics of a peer are rolled over.
    pub update_interval_ms: u16,
    /// Minimum interval between two probe frames to the same peer.
    pub probe_interval_ms: u16,
    /// Consecutive successes at the current rate, before the cursor moves to a faster rate.
    pub promotion_threshold: u8,
    /// Consecutive failures at the current rate, before the cursor falls back.
    pub demotion_threshold: u8,
}
impl RateControlParameters {
    /// The parameters configured at build time.
    pub const DEFAULT: Self = Self {
        ewma_level: DEFAULT_EWMA_LEVEL,
        update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
        probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
        promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
        demotion_threshold: DEFAULT_DEMOTION_THRESHOLD,
    };

    /// The update interval as a [Duration].
    pub const fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms as u64)
    }
    /// The probe interval as a [Duration].
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms as u64)
    }
    /// Check that all parameters are in range.
    ///
    /// An EWMA level of 100 would freeze the probability, so it has to be below that.
    pub const fn validate(&self) -> Result<(), RateControlError> {
        if self.ewma_level >= 100
            || self.update_interval_ms == 0
            || self.probe_interval_ms == 0
            || self.promotion_threshold == 0
            || self.promotion_threshold > MAX_THRESHOLD
            || self.demotion_threshold == 0
            || self.demotion_threshold > MAX_THRESHOLD
        {
            Err(RateControlError::InvalidParameter)
        } else {
            Ok(())
        }
    }
}
impl Default for RateControlParameters {
    fn default() -> Self {
        Self::DEFAULT
    }
}
