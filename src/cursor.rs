//! This module implements the rate cursor of a peer.
//!
//! The cursor walks the `entry_track`, which lists the rates of the peer from the fastest to the
//! most robust one. Only entries with their flag set are eligible in the current configuration.
//! `start_idx` is the position of the rate, that the statistics consider best, and `end_idx` the
//! position of the most robust eligible rate. Consecutive failures at the current rate move the
//! cursor towards `end_idx`, consecutive successes move it back towards `start_idx`, but never
//! past it. Rates faster than the anchor are only ever tried through probing.

use core::iter;

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::{
    MAX_RETRY_CHAIN_LEN, RateControlError, RateIndex, rate_table::MAX_RATES_PER_BANDWIDTH,
    stats::PeerRateNode,
};

/// The ARF counters are four bits wide.
const MAX_COUNT: u8 = 15;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// The state of rate control for a VIF or peer.
pub enum RateControlState {
    #[default]
    /// No peer is configured.
    Idle,
    /// A manually configured rate is used.
    Fixed,
    /// The rate is adapted to the link.
    Adaptive,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// An entry of the track.
pub struct TrackIndex {
    /// Whether the rate is eligible in the current configuration.
    pub flag: bool,
    /// The rate index.
    pub index: RateIndex,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// The outcome of a transmission, as seen by the cursor.
pub enum TxEvent {
    /// The transmission was acknowledged.
    AckReceived,
    /// No acknowledgement was received.
    AckMissing,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// How the cursor reacted to an event.
pub enum RateStep {
    /// The cursor didn't move.
    Hold,
    /// The cursor moved to a faster rate.
    Promoted,
    /// The cursor moved to a more robust rate.
    Demoted,
}

#[derive(Clone, Debug)]
/// The selection state of a peer.
pub struct RateCursor {
    state: RateControlState,
    fixed_index: RateIndex,
    start_idx: u8,
    end_idx: u8,
    entry_track: Vec<TrackIndex, MAX_RATES_PER_BANDWIDTH>,
    success_count: u8,
    fail_count: u8,
    cursor: u8,
    probe_flag: bool,
}
impl RateCursor {
    /// Create a new cursor for a node with `num_rates` rates.
    ///
    /// `enabled` decides, which rates are flagged as eligible.
    pub fn new(
        num_rates: usize,
        enabled: impl Fn(RateIndex) -> bool,
        state: RateControlState,
    ) -> Self {
        let mut cursor = Self {
            state,
            fixed_index: 0,
            start_idx: 0,
            end_idx: 0,
            entry_track: Vec::new(),
            success_count: 0,
            fail_count: 0,
            cursor: 0,
            probe_flag: false,
        };
        cursor.retrack(num_rates, enabled);
        cursor
    }
    /// Rebuild the track for a new set of rates and reset the start index.
    pub fn retrack(&mut self, num_rates: usize, enabled: impl Fn(RateIndex) -> bool) {
        let num_rates = num_rates.min(MAX_RATES_PER_BANDWIDTH) as RateIndex;
        self.entry_track = (0..num_rates)
            .rev()
            .map(|index| TrackIndex {
                flag: enabled(index),
                index,
            })
            .collect();
        self.reset_start_index();
    }
    /// Reset the cursor to the fastest eligible rate and clear the counters.
    pub fn reset_start_index(&mut self) {
        let mut flagged = self
            .entry_track
            .iter()
            .enumerate()
            .filter(|(_, track_index)| track_index.flag)
            .map(|(position, _)| position as u8);
        let start_idx = flagged.next().unwrap_or(0);
        let end_idx = flagged.last().unwrap_or(start_idx);
        self.start_idx = start_idx;
        self.end_idx = end_idx;
        self.cursor = self.start_idx;
        self.success_count = 0;
        self.fail_count = 0;
        self.probe_flag = false;
    }
    fn position_of(&self, index: RateIndex) -> Option<u8> {
        let len = self.entry_track.len();
        (usize::from(index) < len).then(|| (len - 1 - usize::from(index)) as u8)
    }
    /// Anchor the cursor at the rate, that the statistics consider best.
    ///
    /// Ineligible rates are ignored.
    pub fn anchor(&mut self, index: RateIndex) {
        if !self.is_eligible(index) {
            return;
        }
        let Some(position) = self.position_of(index) else {
            return;
        };
        self.start_idx = position;
        self.cursor = position;
        self.success_count = 0;
        self.fail_count = 0;
    }

    /// The current state.
    pub const fn state(&self) -> RateControlState {
        self.state
    }
    /// Set the state.
    pub fn set_state(&mut self, state: RateControlState) {
        self.state = state;
        self.probe_flag = false;
    }
    /// The manually configured rate.
    pub const fn fixed_index(&self) -> RateIndex {
        self.fixed_index
    }
    /// Set the manually configured rate, which is used in the [RateControlState::Fixed] state.
    pub fn set_fixed_index(&mut self, index: RateIndex) {
        self.fixed_index = index;
    }
    /// The track, from the fastest to the most robust rate.
    pub fn entry_track(&self) -> &[TrackIndex] {
        &self.entry_track
    }
    /// Check if a rate is eligible.
    pub fn is_eligible(&self, index: RateIndex) -> bool {
        self.position_of(index)
            .is_some_and(|position| self.entry_track[position as usize].flag)
    }
    /// The amount of eligible rates.
    pub fn eligible_count(&self) -> usize {
        self.entry_track
            .iter()
            .filter(|track_index| track_index.flag)
            .count()
    }
    /// The position of the statistics anchor in the track.
    pub const fn start_idx(&self) -> u8 {
        self.start_idx
    }
    /// The position of the most robust eligible rate in the track.
    pub const fn end_idx(&self) -> u8 {
        self.end_idx
    }
    /// The position of the cursor in the track.
    pub const fn cursor(&self) -> u8 {
        self.cursor
    }
    /// Whether the last selected rate was a probe.
    pub const fn is_probing(&self) -> bool {
        self.probe_flag
    }
    /// Consecutive successes at the current rate.
    pub const fn success_count(&self) -> u8 {
        self.success_count
    }
    /// Consecutive failures at the current rate.
    pub const fn fail_count(&self) -> u8 {
        self.fail_count
    }
    /// The rate the cursor currently points at.
    pub fn current_rate(&self) -> RateIndex {
        self.entry_track
            .get(self.cursor as usize)
            .map(|track_index| track_index.index)
            .unwrap_or(0)
    }

    /// Feed the outcome of a transmission at `index` into the cursor.
    ///
    /// Only outcomes at the current rate move the counters.
    pub fn on_tx_report(
        &mut self,
        index: RateIndex,
        event: TxEvent,
        promotion_threshold: u8,
        demotion_threshold: u8,
    ) -> RateStep {
        if self.state != RateControlState::Adaptive {
            return RateStep::Hold;
        }
        if index != self.current_rate() {
            // The report for a probe, or for a rate that was used before the cursor moved.
            self.probe_flag = false;
            return RateStep::Hold;
        }
        match event {
            TxEvent::AckReceived => {
                self.fail_count = 0;
                self.success_count = (self.success_count + 1).min(MAX_COUNT);
                if self.success_count < promotion_threshold {
                    return RateStep::Hold;
                }
                self.success_count = 0;
                match (self.start_idx..self.cursor)
                    .rev()
                    .find(|position| self.entry_track[*position as usize].flag)
                {
                    Some(position) => {
                        self.cursor = position;
                        RateStep::Promoted
                    }
                    None => RateStep::Hold,
                }
            }
            TxEvent::AckMissing => {
                self.success_count = 0;
                self.fail_count = (self.fail_count + 1).min(MAX_COUNT);
                if self.fail_count < demotion_threshold {
                    return RateStep::Hold;
                }
                self.fail_count = 0;
                match (self.cursor + 1..=self.end_idx)
                    .find(|position| self.entry_track[*position as usize].flag)
                {
                    Some(position) => {
                        self.cursor = position;
                        RateStep::Demoted
                    }
                    None => RateStep::Hold,
                }
            }
        }
    }
    /// Select the rate for the next transmission.
    ///
    /// In the adaptive state, this is the rate under the cursor, except when a probe is due. Then
    /// the probe rate of the node is returned once and the probe timestamp is updated.
    pub fn select_next_rate(
        &mut self,
        node: &mut PeerRateNode,
        now: Instant,
        probe_interval: Duration,
    ) -> RateIndex {
        node.lookup_count = node.lookup_count.wrapping_add(1);
        match self.state {
            RateControlState::Idle => node.lowest_idx,
            RateControlState::Fixed => self
                .fixed_index
                .min(node.num_rates().saturating_sub(1) as RateIndex),
            RateControlState::Adaptive => {
                let current = self.current_rate();
                let probe = node.probe_idx;
                if probe != current
                    && self.is_eligible(probe)
                    && node.probe_due(now, probe_interval)
                {
                    node.mark_probed(now);
                    self.probe_flag = true;
                    trace!("Probing rate {}.", probe);
                    probe
                } else {
                    self.probe_flag = false;
                    current
                }
            }
        }
    }
    /// Build the rates for successive retransmissions of one MPDU.
    ///
    /// The chain starts with `first` and continues with the rate under the cursor and the best
    /// rates of the node, from the fastest to the most robust. Fallbacks are never faster than
    /// `first` or the cursor. The rates are repeated, to fill `max_len` attempts, with the most
    /// robust one taking up the remainder.
    pub fn build_retry_chain(
        &self,
        node: &PeerRateNode,
        first: RateIndex,
        max_len: usize,
    ) -> Result<Vec<RateIndex, MAX_RETRY_CHAIN_LEN>, RateControlError> {
        let num_rates = node.num_rates();
        if num_rates == 0 {
            return Err(RateControlError::NoRates);
        }
        let max_len = max_len.min(MAX_RETRY_CHAIN_LEN);
        let first = first.min((num_rates - 1) as RateIndex);
        let mut chain = Vec::new();
        if self.state == RateControlState::Fixed {
            chain.extend(iter::repeat_n(first, max_len));
            return Ok(chain);
        }

        let current = self.current_rate();
        let limit = first.min(current);
        let candidates = [
            current,
            node.max_throughput_idx,
            node.second_max_throughput_idx,
            node.max_probability_idx,
            node.lowest_idx,
        ];
        let mut fallbacks: Vec<RateIndex, 5> = candidates
            .iter()
            .enumerate()
            .filter(|(i, index)| {
                **index != first
                    && **index <= limit
                    && self.is_eligible(**index)
                    && !candidates[..*i].contains(*index)
            })
            .map(|(_, index)| *index)
            .collect();
        fallbacks.sort_unstable_by(|a, b| b.cmp(a));
        let unique: Vec<RateIndex, 6> = iter::once(first).chain(fallbacks).collect();

        if max_len <= unique.len() {
            chain.extend(unique.iter().copied().take(max_len));
        } else {
            let tries = max_len / unique.len();
            let remainder = max_len % unique.len();
            let last = unique.len() - 1;
            chain.extend(unique.iter().enumerate().flat_map(|(i, index)| {
                let count = if i == last { tries + remainder } else { tries };
                iter::repeat_n(*index, count)
            }));
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use crate::rate_table::{Bandwidth, GuardInterval, RateTableProfile};

    use super::*;

    const PROMOTION: u8 = 3;
    const DEMOTION: u8 = 2;

    fn node() -> PeerRateNode {
        let profile = RateTableProfile::S1G;
        let mut node = PeerRateNode::new(
            &profile,
            0,
            profile.count(Bandwidth::Mhz1),
            GuardInterval::Long,
            Instant::from_micros(0),
        );
        node.reset_indices(|_| true);
        node
    }

    #[test]
    fn track_is_fastest_first() {
        let cursor = RateCursor::new(9, |index| index != 4, RateControlState::Adaptive);
        assert_eq!(cursor.entry_track()[0].index, 8);
        assert_eq!(cursor.entry_track()[8].index, 0);
        assert!(!cursor.is_eligible(4));
        assert!(!cursor.is_eligible(9));
        assert_eq!(cursor.eligible_count(), 8);
        assert_eq!(cursor.current_rate(), 8);
        assert_eq!((cursor.start_idx(), cursor.end_idx()), (0, 8));
    }
    #[test]
    fn demotion_and_promotion() {
        let mut cursor = RateCursor::new(9, |_| true, RateControlState::Adaptive);
        assert_eq!(
            cursor.on_tx_report(8, TxEvent::AckMissing, PROMOTION, DEMOTION),
            RateStep::Hold
        );
        assert_eq!(
            cursor.on_tx_report(8, TxEvent::AckMissing, PROMOTION, DEMOTION),
            RateStep::Demoted
        );
        assert_eq!(cursor.current_rate(), 7);
        assert_eq!(cursor.fail_count(), 0);
        // Reports for the old rate are ignored.
        assert_eq!(
            cursor.on_tx_report(8, TxEvent::AckMissing, PROMOTION, DEMOTION),
            RateStep::Hold
        );
        assert_eq!(cursor.current_rate(), 7);

        for _ in 0..PROMOTION - 1 {
            assert_eq!(
                cursor.on_tx_report(7, TxEvent::AckReceived, PROMOTION, DEMOTION),
                RateStep::Hold
            );
        }
        assert_eq!(
            cursor.on_tx_report(7, TxEvent::AckReceived, PROMOTION, DEMOTION),
            RateStep::Promoted
        );
        assert_eq!(cursor.current_rate(), 8);
        // Clamped at the start.
        for _ in 0..PROMOTION {
            cursor.on_tx_report(8, TxEvent::AckReceived, PROMOTION, DEMOTION);
        }
        assert_eq!(cursor.current_rate(), 8);
    }
    #[test]
    fn success_resets_failures() {
        let mut cursor = RateCursor::new(9, |_| true, RateControlState::Adaptive);
        cursor.on_tx_report(8, TxEvent::AckMissing, PROMOTION, DEMOTION);
        cursor.on_tx_report(8, TxEvent::AckReceived, PROMOTION, DEMOTION);
        cursor.on_tx_report(8, TxEvent::AckMissing, PROMOTION, DEMOTION);
        assert_eq!(cursor.current_rate(), 8);
        assert_eq!(cursor.fail_count(), 1);
    }
    #[test]
    fn demotion_skips_ineligible_and_clamps() {
        let mut cursor = RateCursor::new(
            9,
            |index| index == 8 || index == 2,
            RateControlState::Adaptive,
        );
        for _ in 0..DEMOTION {
            cursor.on_tx_report(8, TxEvent::AckMissing, PROMOTION, DEMOTION);
        }
        assert_eq!(cursor.current_rate(), 2);
        for _ in 0..DEMOTION * 4 {
            cursor.on_tx_report(2, TxEvent::AckMissing, PROMOTION, DEMOTION);
        }
        assert_eq!(cursor.current_rate(), 2);
        assert!(cursor.cursor() <= cursor.end_idx());
    }
    #[test]
    fn anchor_limits_promotion() {
        let mut cursor = RateCursor::new(9, |_| true, RateControlState::Adaptive);
        cursor.anchor(5);
        assert_eq!(cursor.current_rate(), 5);
        for _ in 0..PROMOTION * 3 {
            cursor.on_tx_report(5, TxEvent::AckReceived, PROMOTION, DEMOTION);
        }
        assert_eq!(cursor.current_rate(), 5);
    }
    #[test]
    fn fixed_ignores_reports() {
        let mut node = node();
        let mut cursor = RateCursor::new(9, |_| true, RateControlState::Fixed);
        cursor.set_fixed_index(3);
        for _ in 0..DEMOTION {
            assert_eq!(
                cursor.on_tx_report(3, TxEvent::AckMissing, PROMOTION, DEMOTION),
                RateStep::Hold
            );
        }
        assert_eq!(
            cursor.select_next_rate(&mut node, Instant::from_secs(10), Duration::from_millis(1)),
            3
        );
        let chain = cursor.build_retry_chain(&node, 3, 4).unwrap();
        assert_eq!(chain.as_slice(), &[3, 3, 3, 3]);
    }
    #[test]
    fn probing_once_per_interval() {
        let mut node = node();
        node.probe_idx = 2;
        let mut cursor = RateCursor::new(9, |_| true, RateControlState::Adaptive);
        let interval = Duration::from_millis(200);
        assert_eq!(cursor.select_next_rate(&mut node, Instant::from_millis(100), interval), 8);
        assert_eq!(cursor.select_next_rate(&mut node, Instant::from_millis(200), interval), 2);
        assert!(cursor.is_probing());
        assert_eq!(cursor.select_next_rate(&mut node, Instant::from_millis(300), interval), 8);
        assert!(!cursor.is_probing());
        assert_eq!(node.lookup_count(), 3);
    }
    #[test]
    fn retry_chain_falls_back() {
        let mut node = node();
        node.max_throughput_idx = 8;
        node.second_max_throughput_idx = 6;
        node.max_probability_idx = 4;
        node.lowest_idx = 0;
        let cursor = RateCursor::new(9, |_| true, RateControlState::Adaptive);

        let chain = cursor.build_retry_chain(&node, 8, MAX_RETRY_CHAIN_LEN).unwrap();
        assert_eq!(chain.as_slice(), &[8, 8, 6, 6, 4, 4, 0, 0, 0]);
        let chain = cursor.build_retry_chain(&node, 8, 3).unwrap();
        assert_eq!(chain.as_slice(), &[8, 6, 4]);
        let chain = cursor.build_retry_chain(&node, 8, 20).unwrap();
        assert_eq!(chain.len(), MAX_RETRY_CHAIN_LEN);
        assert!(cursor.build_retry_chain(&node, 8, 0).unwrap().is_empty());
    }
    #[test]
    fn retry_chain_after_probe() {
        let mut node = node();
        node.max_throughput_idx = 5;
        node.second_max_throughput_idx = 7;
        node.max_probability_idx = 5;
        node.lowest_idx = 1;
        let mut cursor = RateCursor::new(9, |_| true, RateControlState::Adaptive);
        cursor.anchor(5);
        let chain = cursor.build_retry_chain(&node, 8, 4).unwrap();
        // The second best rate is faster than the cursor and is skipped.
        assert_eq!(chain.as_slice(), &[8, 5, 1, 1]);
        assert!(chain.iter().all(|index| (*index as usize) < node.num_rates()));
    }
    #[test]
    fn retry_chain_after_slow_probe() {
        let mut node = node();
        node.max_throughput_idx = 8;
        node.second_max_throughput_idx = 7;
        node.max_probability_idx = 1;
        node.lowest_idx = 0;
        let cursor = RateCursor::new(9, |_| true, RateControlState::Adaptive);
        let chain = cursor.build_retry_chain(&node, 2, MAX_RETRY_CHAIN_LEN).unwrap();
        assert_eq!(chain.as_slice(), &[2, 2, 2, 1, 1, 1, 0, 0, 0]);
        assert!(chain.windows(2).all(|pair| pair[1] <= pair[0]));
    }
    #[test]
    fn retry_chain_is_ordered() {
        let mut node = node();
        node.max_throughput_idx = 6;
        node.second_max_throughput_idx = 3;
        node.max_probability_idx = 5;
        node.lowest_idx = 0;
        let mut cursor = RateCursor::new(9, |_| true, RateControlState::Adaptive);
        cursor.anchor(6);
        let chain = cursor.build_retry_chain(&node, 6, 4).unwrap();
        assert_eq!(chain.as_slice(), &[6, 5, 3, 0]);
    }
    #[test]
    fn retry_chain_without_rates() {
        let profile = RateTableProfile::S1G;
        let node = PeerRateNode::new(&profile, 0, 0, GuardInterval::Long, Instant::from_micros(0));
        let cursor = RateCursor::new(0, |_| true, RateControlState::Adaptive);
        assert_eq!(
            cursor.build_retry_chain(&node, 0, 4),
            Err(RateControlError::NoRates)
        );
    }
}
