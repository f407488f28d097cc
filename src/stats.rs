//! This module implements the per peer statistics.
//!
//! Every rate of a peer has a [RateStat], which counts the attempts and successes of the current
//! statistics window. When the window is rolled over, the success ratio of that window is blended
//! into the success probability with an EWMA and the expected throughput is recomputed from it.
//! Afterwards the [PeerRateNode] ranks its rates, to find the best ones for the retry chain.

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::{
    MAX_RETRY_CHAIN_LEN, RateControlError, RateIndex,
    rate_table::{GuardInterval, MAX_RATES_PER_BANDWIDTH, RateTableProfile},
};

/// Below this success probability a rate isn't expected to carry any useful throughput.
const MIN_USEFUL_PROBABILITY: f64 = 0.1;
/// Below this success probability a rate with enough samples is considered unusable.
const UNUSABLE_PROBABILITY: f64 = 0.05;
/// The amount of attempts, before a rate can be considered unusable.
const MIN_SAMPLES_FOR_EXCLUSION: u32 = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
/// The statistics of one rate.
pub struct RateStat {
    /// Successful attempts in the current window.
    pub success: u16,
    /// Attempts in the current window.
    pub attempt: u16,
    /// Successful attempts in the last window, in which this rate was used.
    pub last_success: u16,
    /// Attempts in the last window, in which this rate was used.
    pub last_attempt: u16,
    /// The expected throughput in kbit/s.
    pub estimated_throughput: u16,
    /// The smoothed success probability.
    pub success_probability: f64,
    /// Successful attempts since the peer was created.
    pub total_success: u32,
    /// Attempts since the peer was created.
    pub total_attempt: u32,
    phy_rate_kbps: u32,
    has_probability: bool,
}
impl RateStat {
    fn new(phy_rate_kbps: u32) -> Self {
        Self {
            phy_rate_kbps,
            ..Default::default()
        }
    }
    /// The nominal PHY rate, that the throughput is estimated from.
    pub const fn phy_rate_kbps(&self) -> u32 {
        self.phy_rate_kbps
    }
    /// Add the outcome of a transmission to the window.
    ///
    /// If the window counters would overflow, the window is folded into the probability first.
    fn record(&mut self, attempts: u16, successes: u16, ewma_level: u8) {
        let successes = successes.min(attempts);
        if self.attempt.checked_add(attempts).is_none() {
            self.fold(ewma_level);
        }
        self.attempt = self.attempt.saturating_add(attempts);
        self.success = self.success.saturating_add(successes);
        self.total_attempt = self.total_attempt.saturating_add(attempts as u32);
        self.total_success = self.total_success.saturating_add(successes as u32);
    }
    /// Blend the current window into the success probability and start a new one.
    ///
    /// Without attempts in the window, everything is carried forward unchanged.
    fn fold(&mut self, ewma_level: u8) {
        if self.attempt == 0 {
            return;
        }
        let ratio = self.success as f64 / self.attempt as f64;
        self.success_probability = if self.has_probability {
            (ratio * (100 - ewma_level) as f64 + self.success_probability * ewma_level as f64)
                / 100.0
        } else {
            ratio
        };
        self.has_probability = true;
        self.update_throughput();

        self.last_attempt = self.attempt;
        self.last_success = self.success;
        self.attempt = 0;
        self.success = 0;
    }
    fn update_throughput(&mut self) {
        self.estimated_throughput = if self.success_probability < MIN_USEFUL_PROBABILITY {
            0
        } else {
            (self.success_probability * self.phy_rate_kbps as f64).min(u16::MAX as f64) as u16
        };
    }
    /// Check if the rate hasn't been shown to be unusable.
    pub fn is_usable(&self) -> bool {
        self.total_attempt < MIN_SAMPLES_FOR_EXCLUSION
            || self.success_probability >= UNUSABLE_PROBABILITY
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// The selection indices of a peer, which can be retained and restored.
pub struct RateStatusSnapshot {
    /// The rate with the highest expected throughput.
    pub max_throughput: RateIndex,
    /// The rate with the second highest expected throughput.
    pub second_throughput: RateIndex,
    /// The rate with the highest success probability.
    pub max_probability: RateIndex,
    /// The most robust usable rate.
    pub lowest: RateIndex,
    /// The rate used for the next probe.
    pub probe: RateIndex,
}

fn eligible_indices<'a>(
    num_rates: usize,
    eligible: &'a impl Fn(RateIndex) -> bool,
) -> impl Iterator<Item = RateIndex> + 'a {
    (0..num_rates as RateIndex).filter(move |index| eligible(*index))
}

#[derive(Clone, Debug)]
/// The rate statistics of one peer.
///
/// The node covers a contiguous window of a bandwidth class of the rate table. Rate index `i`
/// corresponds to the flat table entry `rate_table_start_index + i`.
pub struct PeerRateNode {
    pub(crate) max_throughput_idx: RateIndex,
    pub(crate) second_max_throughput_idx: RateIndex,
    pub(crate) max_probability_idx: RateIndex,
    pub(crate) lowest_idx: RateIndex,
    pub(crate) probe_idx: RateIndex,
    rate_table_start_index: u8,
    guard_interval: GuardInterval,
    last_update_timestamp: Instant,
    last_probe_timestamp: Instant,
    pub(crate) lookup_count: u32,
    rssi_average: Option<i8>,
    pub(crate) retry_chain: Vec<RateIndex, MAX_RETRY_CHAIN_LEN>,
    rates: Vec<RateStat, MAX_RATES_PER_BANDWIDTH>,
}
impl PeerRateNode {
    /// Create a node covering `num_rates` entries of the profile, starting at the flat index
    /// `rate_table_start_index`.
    ///
    /// The window is truncated to the table and to [MAX_RATES_PER_BANDWIDTH].
    pub fn new(
        profile: &RateTableProfile,
        rate_table_start_index: usize,
        num_rates: usize,
        guard_interval: GuardInterval,
        now: Instant,
    ) -> Self {
        Self {
            max_throughput_idx: 0,
            second_max_throughput_idx: 0,
            max_probability_idx: 0,
            lowest_idx: 0,
            probe_idx: 0,
            rate_table_start_index: rate_table_start_index as u8,
            guard_interval,
            last_update_timestamp: now,
            last_probe_timestamp: now,
            lookup_count: 0,
            rssi_average: None,
            retry_chain: Vec::new(),
            rates: Self::rates_for_window(
                profile,
                rate_table_start_index,
                num_rates,
                guard_interval,
            ),
        }
    }
    fn rates_for_window(
        profile: &RateTableProfile,
        rate_table_start_index: usize,
        num_rates: usize,
        guard_interval: GuardInterval,
    ) -> Vec<RateStat, MAX_RATES_PER_BANDWIDTH> {
        profile
            .entries()
            .iter()
            .skip(rate_table_start_index)
            .take(num_rates.min(MAX_RATES_PER_BANDWIDTH))
            .map(|entry| RateStat::new(entry.nominal_phy_rate(guard_interval)))
            .collect()
    }
    /// Move the node to a new window of the rate table.
    ///
    /// Statistics of rates with the same format and MCS in both windows are carried over, with
    /// the throughput recomputed for the new PHY rate. All other rates start from zero.
    pub fn rescope(
        &mut self,
        profile: &RateTableProfile,
        rate_table_start_index: usize,
        num_rates: usize,
        guard_interval: GuardInterval,
    ) {
        let old_start = self.rate_table_start_index as usize;
        let mut rates =
            Self::rates_for_window(profile, rate_table_start_index, num_rates, guard_interval);
        for (i, rate) in rates.iter_mut().enumerate() {
            let Some(new_entry) = profile.entry(rate_table_start_index + i) else {
                continue;
            };
            let carried = self.rates.iter().enumerate().find(|(j, _)| {
                profile.entry(old_start + j).is_some_and(|old_entry| {
                    old_entry.format == new_entry.format && old_entry.mcs == new_entry.mcs
                })
            });
            if let Some((_, old)) = carried {
                let phy_rate_kbps = rate.phy_rate_kbps;
                *rate = *old;
                rate.phy_rate_kbps = phy_rate_kbps;
                rate.update_throughput();
            }
        }
        self.rates = rates;
        self.rate_table_start_index = rate_table_start_index as u8;
        self.guard_interval = guard_interval;
        self.retry_chain.clear();
    }
    /// Reset the selection indices, before any statistics are known.
    ///
    /// The fastest eligible rate is assumed to be the best one, so the node starts optimistic.
    pub(crate) fn reset_indices(&mut self, eligible: impl Fn(RateIndex) -> bool) {
        let num_rates = self.rates.len();
        let lowest = eligible_indices(num_rates, &eligible).next().unwrap_or(0);
        let highest = eligible_indices(num_rates, &eligible).last().unwrap_or(0);
        let second = eligible_indices(num_rates, &eligible)
            .filter(|index| *index != highest)
            .last()
            .unwrap_or(highest);
        self.max_throughput_idx = highest;
        self.second_max_throughput_idx = second;
        self.max_probability_idx = lowest;
        self.lowest_idx = lowest;
        self.probe_idx = highest;
    }
    /// Reset the selection indices and rank the statistics, that are already known.
    pub(crate) fn reindex(&mut self, eligible: impl Fn(RateIndex) -> bool) {
        self.reset_indices(&eligible);
        self.rank(&eligible);
    }

    /// The amount of rates in the window.
    pub fn num_rates(&self) -> usize {
        self.rates.len()
    }
    /// The flat index of the first rate in the window.
    pub const fn rate_table_start_index(&self) -> usize {
        self.rate_table_start_index as usize
    }
    /// The guard interval, that the PHY rates were derived with.
    pub const fn guard_interval(&self) -> GuardInterval {
        self.guard_interval
    }
    /// The statistics of all rates.
    pub fn rates(&self) -> &[RateStat] {
        &self.rates
    }
    /// The statistics of one rate.
    pub fn rate(&self, index: RateIndex) -> Option<&RateStat> {
        self.rates.get(index as usize)
    }
    /// The rate with the highest expected throughput.
    pub const fn max_throughput_idx(&self) -> RateIndex {
        self.max_throughput_idx
    }
    /// The rate with the second highest expected throughput.
    pub const fn second_max_throughput_idx(&self) -> RateIndex {
        self.second_max_throughput_idx
    }
    /// The rate with the highest success probability.
    pub const fn max_probability_idx(&self) -> RateIndex {
        self.max_probability_idx
    }
    /// The most robust usable rate.
    pub const fn lowest_idx(&self) -> RateIndex {
        self.lowest_idx
    }
    /// The rate, that will be used for the next probe.
    pub const fn probe_idx(&self) -> RateIndex {
        self.probe_idx
    }
    /// How often a rate was looked up for this peer.
    pub const fn lookup_count(&self) -> u32 {
        self.lookup_count
    }
    /// The time of the last rollover.
    pub const fn last_update_timestamp(&self) -> Instant {
        self.last_update_timestamp
    }
    /// The time of the last probe.
    pub const fn last_probe_timestamp(&self) -> Instant {
        self.last_probe_timestamp
    }
    /// The averaged RSSI of the peer, if any was reported.
    pub const fn rssi_average(&self) -> Option<i8> {
        self.rssi_average
    }
    /// The retry chain, that was built for the last lookup.
    pub fn retry_chain(&self) -> &[RateIndex] {
        &self.retry_chain
    }

    /// Add the outcome of a transmission at `index` to the statistics.
    pub fn record_attempt(
        &mut self,
        index: RateIndex,
        attempts: u16,
        successes: u16,
        ewma_level: u8,
    ) -> Result<(), RateControlError> {
        let rate = self
            .rates
            .get_mut(index as usize)
            .ok_or(RateControlError::RateIndexOutOfRange)?;
        rate.record(attempts, successes, ewma_level);
        Ok(())
    }
    /// Fold the current window of all rates and rank them.
    ///
    /// Only rates for which `eligible` returns `true` are considered for the selection indices.
    pub fn rollover(
        &mut self,
        now: Instant,
        ewma_level: u8,
        eligible: impl Fn(RateIndex) -> bool,
    ) {
        self.rates
            .iter_mut()
            .for_each(|rate| rate.fold(ewma_level));
        self.rank(&eligible);
        self.last_update_timestamp = now;
    }
    fn rank(&mut self, eligible: &impl Fn(RateIndex) -> bool) {
        let rates = &self.rates;
        let num_rates = rates.len();
        let Some(first) = eligible_indices(num_rates, eligible).next() else {
            return;
        };
        // Without any samples, there's nothing to rank by and we keep the optimistic defaults.
        if !eligible_indices(num_rates, eligible)
            .any(|index| rates[index as usize].total_attempt > 0)
        {
            return;
        }
        let throughput = |index: RateIndex| rates[index as usize].estimated_throughput;
        let probability = |index: RateIndex| rates[index as usize].success_probability;

        let lowest = eligible_indices(num_rates, eligible)
            .find(|index| rates[*index as usize].is_usable())
            .unwrap_or(first);
        // Iterating from the most robust rate and only replacing on strictly better values,
        // resolves ties towards the more robust rate.
        let mut max_throughput = first;
        let mut max_probability = first;
        for index in eligible_indices(num_rates, eligible) {
            if throughput(index) > throughput(max_throughput) {
                max_throughput = index;
            }
            if probability(index) > probability(max_probability) {
                max_probability = index;
            }
        }
        if throughput(max_throughput) == 0 {
            max_throughput = lowest;
        }
        let mut second_throughput = None;
        for index in
            eligible_indices(num_rates, eligible).filter(|index| *index != max_throughput)
        {
            if second_throughput.is_none_or(|second| throughput(index) > throughput(second)) {
                second_throughput = Some(index);
            }
        }

        self.max_throughput_idx = max_throughput;
        self.second_max_throughput_idx = second_throughput.unwrap_or(max_throughput);
        self.max_probability_idx = max_probability;
        self.lowest_idx = lowest;
    }
    /// Check if the peer is due for a probe.
    pub fn probe_due(&self, now: Instant, probe_interval: Duration) -> bool {
        now.saturating_duration_since(self.last_probe_timestamp) >= probe_interval
    }
    pub(crate) fn mark_probed(&mut self, now: Instant) {
        self.last_probe_timestamp = now;
    }
    /// Feed an RSSI measurement into the average.
    pub(crate) fn update_rssi(&mut self, rssi: i8) {
        self.rssi_average = Some(match self.rssi_average {
            Some(average) => ((average as i16 * 7 + rssi as i16) / 8) as i8,
            None => rssi,
        });
    }

    /// Capture the selection indices.
    pub fn save_status(&self) -> RateStatusSnapshot {
        RateStatusSnapshot {
            max_throughput: self.max_throughput_idx,
            second_throughput: self.second_max_throughput_idx,
            max_probability: self.max_probability_idx,
            lowest: self.lowest_idx,
            probe: self.probe_idx,
        }
    }
    /// Restore previously captured selection indices.
    ///
    /// All indices have to be in range, otherwise nothing is changed.
    pub fn restore_status(
        &mut self,
        snapshot: &RateStatusSnapshot,
    ) -> Result<(), RateControlError> {
        let num_rates = self.rates.len();
        if [
            snapshot.max_throughput,
            snapshot.second_throughput,
            snapshot.max_probability,
            snapshot.lowest,
            snapshot.probe,
        ]
        .iter()
        .any(|index| *index as usize >= num_rates)
        {
            return Err(RateControlError::RateIndexOutOfRange);
        }
        self.max_throughput_idx = snapshot.max_throughput;
        self.second_max_throughput_idx = snapshot.second_throughput;
        self.max_probability_idx = snapshot.max_probability;
        self.lowest_idx = snapshot.lowest;
        self.probe_idx = snapshot.probe;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rate_table::Bandwidth;

    use super::*;

    const EWMA: u8 = 75;

    fn node_1mhz() -> PeerRateNode {
        let profile = RateTableProfile::S1G;
        let mut node = PeerRateNode::new(
            &profile,
            profile.base(Bandwidth::Mhz1),
            profile.count(Bandwidth::Mhz1),
            GuardInterval::Long,
            Instant::from_micros(0),
        );
        node.reset_indices(|_| true);
        node
    }

    #[test]
    fn optimistic_start() {
        let node = node_1mhz();
        assert_eq!(node.num_rates(), 9);
        assert_eq!(node.max_throughput_idx(), 8);
        assert_eq!(node.second_max_throughput_idx(), 7);
        assert_eq!(node.lowest_idx(), 0);
    }
    #[test]
    fn out_of_range_is_rejected() {
        let mut node = node_1mhz();
        assert_eq!(
            node.record_attempt(9, 1, 1, EWMA),
            Err(RateControlError::RateIndexOutOfRange)
        );
        assert!(node.rates().iter().all(|rate| rate.total_attempt == 0));
    }
    #[test]
    fn counters_stay_bounded() {
        let mut node = node_1mhz();
        // More successes than attempts are clamped.
        node.record_attempt(3, 2, 5, EWMA).unwrap();
        let rate = node.rate(3).unwrap();
        assert_eq!((rate.attempt, rate.success), (2, 2));
        for _ in 0..10 {
            node.record_attempt(3, u16::MAX, u16::MAX / 2, EWMA).unwrap();
            let rate = node.rate(3).unwrap();
            assert!(rate.success <= rate.attempt);
            assert!(rate.total_success <= rate.total_attempt);
        }
        // The window was folded on overflow.
        let rate = node.rate(3).unwrap();
        assert!(rate.last_attempt > 0);
        assert!(rate.success_probability > 0.0);
    }
    #[test]
    fn rollover_ranks_by_throughput() {
        let mut node = node_1mhz();
        node.record_attempt(8, 10, 10, EWMA).unwrap();
        node.rollover(Instant::from_millis(100), EWMA, |_| true);
        assert_eq!(node.max_throughput_idx(), 8);
        assert_eq!(node.max_probability_idx(), 8);
        assert_eq!(node.rate(8).unwrap().estimated_throughput, 3600);
        assert_eq!(node.rate(8).unwrap().last_attempt, 10);
        assert_eq!(node.rate(8).unwrap().attempt, 0);
        assert_eq!(node.last_update_timestamp(), Instant::from_millis(100));

        // A fast but lossy rate loses against a slower reliable one.
        node.record_attempt(8, 10, 0, EWMA).unwrap();
        node.record_attempt(5, 10, 10, EWMA).unwrap();
        node.rollover(Instant::from_millis(200), EWMA, |_| true);
        // 0.75 * 3600 = 2700 > 2400
        assert_eq!(node.max_throughput_idx(), 8);
        node.record_attempt(8, 10, 0, EWMA).unwrap();
        node.rollover(Instant::from_millis(300), EWMA, |_| true);
        assert_eq!(node.max_throughput_idx(), 5);
        assert_eq!(node.second_max_throughput_idx(), 8);
    }
    #[test]
    fn carry_forward_without_traffic() {
        let mut node = node_1mhz();
        node.record_attempt(4, 8, 6, EWMA).unwrap();
        node.rollover(Instant::from_millis(100), EWMA, |_| true);
        let before = *node.rate(4).unwrap();
        node.rollover(Instant::from_millis(200), EWMA, |_| true);
        node.rollover(Instant::from_millis(300), EWMA, |_| true);
        let after = *node.rate(4).unwrap();
        assert_eq!(before.success_probability, after.success_probability);
        assert_eq!(before.estimated_throughput, after.estimated_throughput);
    }
    #[test]
    fn ewma_smoothing() {
        let mut node = node_1mhz();
        node.record_attempt(2, 10, 10, EWMA).unwrap();
        node.rollover(Instant::from_millis(100), EWMA, |_| true);
        node.record_attempt(2, 10, 0, EWMA).unwrap();
        node.rollover(Instant::from_millis(200), EWMA, |_| true);
        let probability = node.rate(2).unwrap().success_probability;
        assert!((probability - 0.75).abs() < 1e-9);
    }
    #[test]
    fn ties_prefer_robust_rates() {
        let mut node = node_1mhz();
        // Everything failing, so all throughputs are zero.
        for index in 0..9 {
            node.record_attempt(index, 10, 0, EWMA).unwrap();
        }
        node.rollover(Instant::from_millis(100), EWMA, |_| true);
        assert_eq!(node.max_throughput_idx(), 0);
        assert_eq!(node.lowest_idx(), 0);
        assert_eq!(node.max_probability_idx(), 0);
    }
    #[test]
    fn lowest_skips_unusable_rates() {
        let mut node = node_1mhz();
        node.record_attempt(0, 10, 0, EWMA).unwrap();
        node.record_attempt(1, 10, 9, EWMA).unwrap();
        node.rollover(Instant::from_millis(100), EWMA, |_| true);
        assert_eq!(node.lowest_idx(), 1);
        assert_eq!(node.max_throughput_idx(), 1);
    }
    #[test]
    fn ineligible_rates_are_not_ranked() {
        let mut node = node_1mhz();
        node.record_attempt(8, 10, 10, EWMA).unwrap();
        node.record_attempt(3, 10, 10, EWMA).unwrap();
        node.rollover(Instant::from_millis(100), EWMA, |index| index != 8);
        assert_eq!(node.max_throughput_idx(), 3);
    }
    #[test]
    fn probe_timing() {
        let node = node_1mhz();
        let interval = Duration::from_millis(200);
        assert!(!node.probe_due(Instant::from_millis(199), interval));
        assert!(node.probe_due(Instant::from_millis(200), interval));
    }
    #[test]
    fn rescope_keeps_matching_rates() {
        let profile = RateTableProfile::S1G;
        let mut node = node_1mhz();
        node.record_attempt(3, 10, 10, EWMA).unwrap();
        node.record_attempt(8, 10, 10, EWMA).unwrap();
        node.rollover(Instant::from_millis(100), EWMA, |_| true);
        node.rescope(
            &profile,
            profile.base(Bandwidth::Mhz2),
            profile.count(Bandwidth::Mhz2),
            GuardInterval::Long,
        );
        assert_eq!(node.num_rates(), 8);
        let rate = node.rate(3).unwrap();
        assert_eq!(rate.total_attempt, 10);
        assert_eq!(rate.estimated_throughput, 2600);
        // MCS8 doesn't exist at 2 MHz.
        assert!(node.rates().iter().map(|rate| rate.total_attempt).sum::<u32>() == 10);
    }
    #[test]
    fn status_round_trip() {
        let mut node = node_1mhz();
        let snapshot = RateStatusSnapshot {
            max_throughput: 4,
            second_throughput: 3,
            max_probability: 2,
            lowest: 1,
            probe: 6,
        };
        node.restore_status(&snapshot).unwrap();
        assert_eq!(node.save_status(), snapshot);
        let invalid = RateStatusSnapshot {
            probe: 9,
            ..snapshot
        };
        assert_eq!(
            node.restore_status(&invalid),
            Err(RateControlError::RateIndexOutOfRange)
        );
        assert_eq!(node.save_status(), snapshot);
    }
    #[test]
    fn rssi_average() {
        let mut node = node_1mhz();
        node.update_rssi(-80);
        assert_eq!(node.rssi_average(), Some(-80));
        node.update_rssi(-88);
        assert_eq!(node.rssi_average(), Some(-81));
    }
}
