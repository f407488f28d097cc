//! This module contains the [RateControl] engine.
//!
//! The engine holds the rate control state of all peers, grouped by VIF, behind a single blocking
//! mutex. This allows feeding TX reports from an interrupt or callback context, while the
//! statistics are rolled over from a periodic task. No entry point blocks or allocates.

use core::{cell::RefCell, fmt::Write};

use embassy_sync::blocking_mutex::{Mutex, raw::RawMutex};
use embassy_time::Instant;
use heapless::Vec;
use rand_core::RngCore;

use crate::{
    MAX_RETRY_CHAIN_LEN, MAX_VIFS, PeerRateNode, RateControlError, RateControlParameters,
    RateControlState, RateCursor, RateIndex, RateStatusSnapshot, RateStep, TxEvent,
    rate_table::{
        Bandwidth, Format, GuardInterval, MAX_RATES_PER_BANDWIDTH, MCS_COUNT, RateAttributes,
        RateTableEntry, RateTableProfile,
    },
};

mod peer_registry;
mod show;

pub use peer_registry::PeerKey;
use peer_registry::{PeerContext, PeerRegistry, StaticPeerRegistry};

/// Below this averaged RSSI in dBm, probing is restricted to rates expected to work at that RSSI.
const WEAK_RSSI_THRESHOLD: i8 = -80;
/// Rates with fewer attempts than this are preferred for probing.
const LOW_SAMPLE_THRESHOLD: u32 = 10;
/// All MCS known to the modulation tables.
const ALL_MCS: u16 = (1 << MCS_COUNT) - 1;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// The outcome of transmitting one MPDU.
pub struct TxReport {
    /// The rate, at which the MPDU was transmitted.
    pub rate_index: RateIndex,
    /// The amount of transmission attempts.
    pub attempts: u16,
    /// The amount of acknowledged attempts.
    pub successes: u16,
    /// The RSSI of the acknowledgement in dBm, if one was received.
    pub rssi: Option<i8>,
}
impl TxReport {
    /// The event, that this report causes for the rate cursor.
    pub const fn event(&self) -> TxEvent {
        if self.successes > 0 {
            TxEvent::AckReceived
        } else {
            TxEvent::AckMissing
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// A rate selected for a transmission attempt.
pub struct RateSelection {
    /// The selected rate.
    pub rate_index: RateIndex,
    /// The maximum amount of payload bytes in one PPDU at that rate.
    pub max_payload_bytes: u32,
}

/// The capabilities negotiated for a VIF.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Capability {
    format: Format,
    attributes: RateAttributes,
    mcs_bitmap: u16,
}
impl Default for Capability {
    fn default() -> Self {
        Self {
            format: Format::S1g,
            attributes: RateAttributes::MHZ_20 | RateAttributes::MHZ_40,
            mcs_bitmap: ALL_MCS,
        }
    }
}

/// The window of the rate table, that the peers of a VIF use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RateWindow {
    start: usize,
    num_rates: usize,
    /// Bit `i` is set, if rate index `i` is enabled.
    enabled: u16,
    guard_interval: GuardInterval,
}
impl RateWindow {
    /// Intersect the capabilities with a bandwidth class of the profile.
    ///
    /// The window spans from the most robust to the fastest enabled entry.
    fn select(
        profile: &RateTableProfile,
        bandwidth: Bandwidth,
        capability: &Capability,
    ) -> Option<Self> {
        if !capability.attributes.allows(bandwidth) {
            return None;
        }
        let slice = profile.slice(bandwidth);
        let is_enabled = |entry: &RateTableEntry| {
            entry.format == capability.format
                && capability
                    .mcs_bitmap
                    .checked_shr(entry.mcs as u32)
                    .is_some_and(|bits| bits & 1 != 0)
        };
        let first = slice.iter().position(|entry| is_enabled(entry))?;
        let last = slice.iter().rposition(|entry| is_enabled(entry))?;
        let enabled = slice[first..=last]
            .iter()
            .enumerate()
            .filter(|(_, entry)| is_enabled(*entry))
            .fold(0u16, |enabled, (i, _)| enabled | (1 << i));
        Some(Self {
            start: profile.base(bandwidth) + first,
            num_rates: last - first + 1,
            enabled,
            guard_interval: capability.attributes.guard_interval(),
        })
    }
    /// Only the most robust entry of the profile.
    fn fallback(profile: &RateTableProfile) -> Self {
        match profile.most_robust() {
            Some(entry) => Self {
                start: entry.order as usize,
                num_rates: 1,
                enabled: 1,
                guard_interval: GuardInterval::Long,
            },
            None => Self {
                start: 0,
                num_rates: 0,
                enabled: 0,
                guard_interval: GuardInterval::Long,
            },
        }
    }
    fn is_enabled(&self, index: RateIndex) -> bool {
        (index as usize) < self.num_rates
            && self
                .enabled
                .checked_shr(index as u32)
                .is_some_and(|bits| bits & 1 != 0)
    }
}

/// Per VIF state.
#[derive(Clone, Copy, Debug)]
struct VifContext {
    bandwidth: Bandwidth,
    capability: Capability,
    window: RateWindow,
    /// Either [RateControlState::Adaptive] or [RateControlState::Fixed].
    state: RateControlState,
    fixed_index: Option<RateIndex>,
    beacon_mcs: u8,
}
impl VifContext {
    fn new(profile: &RateTableProfile) -> Self {
        let capability = Capability::default();
        let bandwidth = Bandwidth::Mhz1;
        Self {
            bandwidth,
            capability,
            window: RateWindow::select(profile, bandwidth, &capability)
                .unwrap_or_else(|| RateWindow::fallback(profile)),
            state: RateControlState::Adaptive,
            fixed_index: None,
            beacon_mcs: 0,
        }
    }
}

/// Create the rate control state for a new peer on a VIF.
fn new_peer(profile: &RateTableProfile, vif: &VifContext, now: Instant) -> PeerContext {
    let window = vif.window;
    let mut node = PeerRateNode::new(
        profile,
        window.start,
        window.num_rates,
        window.guard_interval,
        now,
    );
    node.reset_indices(|index| window.is_enabled(index));
    let mut cursor = RateCursor::new(
        window.num_rates,
        |index| window.is_enabled(index),
        vif.state,
    );
    let fixed_index = vif.fixed_index.unwrap_or(cursor.current_rate());
    cursor.set_fixed_index(fixed_index);
    PeerContext { node, cursor }
}

/// Move a peer to a new window, keeping the statistics of rates present in both.
fn apply_window(profile: &RateTableProfile, peer: &mut PeerContext, window: &RateWindow) {
    peer.node.rescope(
        profile,
        window.start,
        window.num_rates,
        window.guard_interval,
    );
    peer.node.reindex(|index| window.is_enabled(index));
    peer.cursor
        .retrack(window.num_rates, |index| window.is_enabled(index));
    if peer.cursor.state() == RateControlState::Adaptive {
        peer.cursor.anchor(peer.node.max_throughput_idx);
    }
}

/// Pick the rate for the next probe.
///
/// Rates with few samples are preferred. While the signal is weak, rates above the best one are
/// skipped, if they need a higher RSSI than we're seeing.
fn pick_probe_rate(
    profile: &RateTableProfile,
    peer: &PeerContext,
    rng: &mut impl RngCore,
) -> RateIndex {
    let node = &peer.node;
    let max_throughput = node.max_throughput_idx;
    let weak_rssi = node
        .rssi_average()
        .filter(|rssi| *rssi < WEAK_RSSI_THRESHOLD);
    let allowed = |index: RateIndex| {
        peer.cursor.is_eligible(index)
            && index != max_throughput
            && match weak_rssi {
                Some(rssi) if index > max_throughput => profile
                    .entry(node.rate_table_start_index() + index as usize)
                    .is_some_and(|entry| entry.min_rssi <= rssi),
                _ => true,
            }
    };
    let all = 0..node.num_rates() as RateIndex;
    let mut candidates: Vec<RateIndex, MAX_RATES_PER_BANDWIDTH> = all
        .clone()
        .filter(|index| allowed(*index))
        .filter(|index| {
            node.rate(*index)
                .is_some_and(|rate| rate.total_attempt < LOW_SAMPLE_THRESHOLD)
        })
        .collect();
    if candidates.is_empty() {
        candidates = all.filter(|index| allowed(*index)).collect();
    }
    if candidates.is_empty() {
        return max_throughput;
    }
    candidates[rng.next_u32() as usize % candidates.len()]
}

struct RateControlInner<Rng: RngCore> {
    parameters: RateControlParameters,
    saved_parameters: Option<RateControlParameters>,
    /// The time of the last tick.
    now: Instant,
    vifs: [VifContext; MAX_VIFS],
    peers: StaticPeerRegistry,
    rng: Rng,
}
impl<Rng: RngCore> RateControlInner<Rng> {
    fn vif(&self, vif: usize) -> Result<&VifContext, RateControlError> {
        self.vifs.get(vif).ok_or_else(|| {
            warn!("Unknown VIF {}.", vif);
            RateControlError::UnknownVif
        })
    }
    fn vif_mut(&mut self, vif: usize) -> Result<&mut VifContext, RateControlError> {
        self.vifs.get_mut(vif).ok_or_else(|| {
            warn!("Unknown VIF {}.", vif);
            RateControlError::UnknownVif
        })
    }
    fn peer(&self, key: PeerKey) -> Result<&PeerContext, RateControlError> {
        self.vif(key.vif)?;
        self.peers.get(&key).ok_or_else(|| {
            warn!("Unknown peer with AID {} on VIF {}.", key.aid, key.vif);
            RateControlError::UnknownPeer
        })
    }
    fn peer_mut(&mut self, key: PeerKey) -> Result<&mut PeerContext, RateControlError> {
        self.vif(key.vif)?;
        self.peers.get_mut(&key).ok_or_else(|| {
            warn!("Unknown peer with AID {} on VIF {}.", key.aid, key.vif);
            RateControlError::UnknownPeer
        })
    }
    /// Apply the window of a VIF to all of its peers.
    fn apply_vif_window(&mut self, profile: &RateTableProfile, vif: usize) {
        let window = self.vifs[vif].window;
        self.peers
            .peers_of_vif_mut(vif)
            .for_each(|(_, peer)| apply_window(profile, peer, &window));
    }
    /// Move a VIF to a new bandwidth.
    fn change_bandwidth(
        &mut self,
        profile: &RateTableProfile,
        vif: usize,
        bandwidth: Bandwidth,
    ) -> Result<(), RateControlError> {
        let vif_context = self.vif_mut(vif)?;
        if vif_context.bandwidth == bandwidth {
            return Ok(());
        }
        vif_context.bandwidth = bandwidth;
        let result = match RateWindow::select(profile, bandwidth, &vif_context.capability) {
            Some(window) => {
                vif_context.window = window;
                Ok(())
            }
            None => {
                info!(
                    "No rates for VIF {} at {} MHz, falling back to the most robust rate.",
                    vif,
                    bandwidth.as_mhz()
                );
                vif_context.window = RateWindow::fallback(profile);
                Err(RateControlError::NoCapabilityOverlap)
            }
        };
        info!("VIF {} switched to {} MHz.", vif, bandwidth.as_mhz());
        self.apply_vif_window(profile, vif);
        result
    }
}

/// The rate control engine.
///
/// All peers of all VIFs are managed by one instance. The raw mutex `M` decides from which
/// contexts the engine can be accessed. Use
/// [CriticalSectionRawMutex](embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex), if TX
/// reports are fed in from an interrupt, and
/// [NoopRawMutex](embassy_sync::blocking_mutex::raw::NoopRawMutex) otherwise.
pub struct RateControl<M: RawMutex, Rng: RngCore> {
    profile: RateTableProfile,
    inner: Mutex<M, RefCell<RateControlInner<Rng>>>,
}
impl<M: RawMutex, Rng: RngCore> RateControl<M, Rng> {
    /// Create a new engine for a PHY, with the parameters configured at build time.
    ///
    /// All VIFs start out at 1 MHz with all rates enabled.
    pub fn new(profile: RateTableProfile, rng: Rng) -> Self {
        let vif = VifContext::new(&profile);
        Self {
            profile,
            inner: Mutex::new(RefCell::new(RateControlInner {
                parameters: RateControlParameters::DEFAULT,
                saved_parameters: None,
                now: Instant::from_ticks(0),
                vifs: [vif; MAX_VIFS],
                peers: StaticPeerRegistry::UNINIT,
                rng,
            })),
        }
    }
    fn with_inner<O>(&self, f: impl FnOnce(&mut RateControlInner<Rng>) -> O) -> O {
        self.inner.lock(|inner| (f)(&mut inner.borrow_mut()))
    }
    /// The rate table profile.
    pub const fn profile(&self) -> &RateTableProfile {
        &self.profile
    }

    /// Add a peer to a VIF.
    ///
    /// The peer starts at the fastest enabled rate of the VIF.
    pub fn add_peer(&self, vif: usize, aid: u16) -> Result<(), RateControlError> {
        let profile = &self.profile;
        self.with_inner(|inner| {
            let vif_context = *inner.vif(vif)?;
            let now = inner.now;
            inner
                .peers
                .add_peer(PeerKey::new(vif, aid), || new_peer(profile, &vif_context, now))
                .inspect_err(|err| warn!("Failed to add peer with AID {}: {:?}", aid, err))?;
            info!("Added peer with AID {} to VIF {}.", aid, vif);
            Ok(())
        })
    }
    /// Remove a peer from a VIF.
    ///
    /// Nothing will touch the state of the peer afterwards.
    pub fn remove_peer(&self, vif: usize, aid: u16) -> Result<(), RateControlError> {
        self.with_inner(|inner| {
            inner.vif(vif)?;
            match inner.peers.remove(&PeerKey::new(vif, aid)) {
                Some(_) => {
                    info!("Removed peer with AID {} from VIF {}.", aid, vif);
                    Ok(())
                }
                None => {
                    warn!("Unknown peer with AID {} on VIF {}.", aid, vif);
                    Err(RateControlError::UnknownPeer)
                }
            }
        })
    }
    /// The amount of peers associated with a VIF.
    pub fn peer_count(&self, vif: usize) -> Result<usize, RateControlError> {
        self.with_inner(|inner| {
            inner.vif(vif)?;
            Ok(inner.peers.peer_count(vif))
        })
    }

    /// Configure the rates of a VIF.
    ///
    /// The rate table is intersected with the format, capability attributes and MCS bitmap at the
    /// current bandwidth of the VIF. If nothing overlaps, the most robust rate of the profile is
    /// installed and [RateControlError::NoCapabilityOverlap] is returned.
    pub fn configure(
        &self,
        vif: usize,
        format: Format,
        attributes: RateAttributes,
        mcs_bitmap: u16,
    ) -> Result<(), RateControlError> {
        let profile = &self.profile;
        self.with_inner(|inner| {
            let vif_context = inner.vif_mut(vif)?;
            vif_context.capability = Capability {
                format,
                attributes,
                mcs_bitmap,
            };
            let result =
                match RateWindow::select(profile, vif_context.bandwidth, &vif_context.capability)
                {
                    Some(window) => {
                        vif_context.window = window;
                        debug!(
                            "Configured VIF {} with {} rates, starting at {}.",
                            vif, window.num_rates, window.start
                        );
                        Ok(())
                    }
                    None => {
                        info!(
                            "Capabilities of VIF {} don't overlap with the rate table, falling back to the most robust rate.",
                            vif
                        );
                        vif_context.window = RateWindow::fallback(profile);
                        Err(RateControlError::NoCapabilityOverlap)
                    }
                };
            inner.apply_vif_window(profile, vif);
            result
        })
    }
    /// Move the peers of a VIF to a different bandwidth.
    ///
    /// Statistics of rates, that exist at both bandwidths, are retained.
    pub fn reconfigure_on_bandwidth_change(
        &self,
        old: Bandwidth,
        new: Bandwidth,
        vif: usize,
    ) -> Result<(), RateControlError> {
        let profile = &self.profile;
        self.with_inner(|inner| {
            let current = inner.vif(vif)?.bandwidth;
            if current != old {
                warn!(
                    "VIF {} is at {} MHz, not at {} MHz.",
                    vif,
                    current.as_mhz(),
                    old.as_mhz()
                );
            }
            inner.change_bandwidth(profile, vif, new)
        })
    }
    /// Apply a bandwidth change of the channel to all VIFs.
    pub fn channel_updated(&self, bandwidth: Bandwidth) -> Result<(), RateControlError> {
        let profile = &self.profile;
        self.with_inner(|inner| {
            (0..MAX_VIFS).fold(Ok(()), |result, vif| {
                let changed = inner.change_bandwidth(profile, vif, bandwidth);
                result.and(changed)
            })
        })
    }
    /// The bandwidth of a VIF.
    pub fn bandwidth(&self, vif: usize) -> Result<Bandwidth, RateControlError> {
        self.with_inner(|inner| Ok(inner.vif(vif)?.bandwidth))
    }

    /// Drive the statistics.
    ///
    /// Every peer, whose statistics haven't been rolled over for the update interval, is rolled
    /// over and a new probe rate is picked for it.
    pub fn tick(&self, now: Instant) {
        let profile = &self.profile;
        self.with_inner(|inner| {
            inner.now = now;
            let update_interval = inner.parameters.update_interval();
            let ewma_level = inner.parameters.ewma_level;
            let rng = &mut inner.rng;
            for (key, peer) in inner.peers.iter_mut() {
                if now.saturating_duration_since(peer.node.last_update_timestamp())
                    < update_interval
                {
                    continue;
                }
                let cursor = &peer.cursor;
                peer.node
                    .rollover(now, ewma_level, |index| cursor.is_eligible(index));
                if peer.cursor.state() == RateControlState::Adaptive {
                    peer.cursor.anchor(peer.node.max_throughput_idx);
                }
                peer.node.probe_idx = pick_probe_rate(profile, peer, &mut *rng);
                debug!(
                    "Rolled over AID {} on VIF {}: max tp {} tp2 {} max prob {} lowest {} probe {}.",
                    key.aid,
                    key.vif,
                    peer.node.max_throughput_idx,
                    peer.node.second_max_throughput_idx,
                    peer.node.max_probability_idx,
                    peer.node.lowest_idx,
                    peer.node.probe_idx
                );
            }
        })
    }
    /// Feed the outcome of a transmission into rate control.
    pub fn on_tx_report(
        &self,
        vif: usize,
        aid: u16,
        report: TxReport,
    ) -> Result<(), RateControlError> {
        self.with_inner(|inner| {
            let parameters = inner.parameters;
            let peer = inner.peer_mut(PeerKey::new(vif, aid))?;
            if !peer.cursor.is_eligible(report.rate_index) {
                warn!(
                    "TX report for AID {} with rate index {}, which isn't enabled.",
                    aid, report.rate_index
                );
                return Err(RateControlError::RateIndexOutOfRange);
            }
            peer.node.record_attempt(
                report.rate_index,
                report.attempts,
                report.successes,
                parameters.ewma_level,
            )?;
            if let Some(rssi) = report.rssi {
                peer.node.update_rssi(rssi);
            }
            let step = peer.cursor.on_tx_report(
                report.rate_index,
                report.event(),
                parameters.promotion_threshold,
                parameters.demotion_threshold,
            );
            if step != RateStep::Hold {
                debug!(
                    "AID {} on VIF {}: {:?} to rate {}.",
                    aid,
                    vif,
                    step,
                    peer.cursor.current_rate()
                );
            }
            Ok(())
        })
    }
    /// Feed the outcome of a transmission into rate control.
    ///
    /// This is equivalent to [RateControl::on_tx_report] without an RSSI.
    pub fn update_stats(
        &self,
        vif: usize,
        aid: u16,
        rate_index: RateIndex,
        attempts: u16,
        successes: u16,
    ) -> Result<(), RateControlError> {
        self.on_tx_report(
            vif,
            aid,
            TxReport {
                rate_index,
                attempts,
                successes,
                rssi: None,
            },
        )
    }
    /// Get the rate for a transmission attempt.
    ///
    /// For the first attempt (`retry == 0`) a new rate is selected, which may be a probe, and the
    /// retry chain is rebuilt. Retransmissions walk the retry chain, repeating its last entry.
    pub fn get_rate_index(
        &self,
        vif: usize,
        aid: u16,
        retry: u8,
    ) -> Result<RateIndex, RateControlError> {
        self.get_rate(vif, aid, retry)
            .map(|selection| selection.rate_index)
    }
    /// Get the rate for a transmission attempt, together with the payload budget of one PPDU at
    /// that rate.
    ///
    /// The rate is chosen like in [RateControl::get_rate_index]. The budget limits how many MPDUs
    /// can be aggregated.
    pub fn get_rate(
        &self,
        vif: usize,
        aid: u16,
        retry: u8,
    ) -> Result<RateSelection, RateControlError> {
        let profile = &self.profile;
        self.with_inner(|inner| {
            let now = inner.now;
            let probe_interval = inner.parameters.probe_interval();
            let peer = inner.peer_mut(PeerKey::new(vif, aid))?;
            if peer.node.num_rates() == 0 {
                warn!("AID {} on VIF {} has no rates.", aid, vif);
                return Err(RateControlError::NoRates);
            }
            if retry == 0 || peer.node.retry_chain.is_empty() {
                let rate = peer
                    .cursor
                    .select_next_rate(&mut peer.node, now, probe_interval);
                peer.node.retry_chain =
                    peer.cursor
                        .build_retry_chain(&peer.node, rate, MAX_RETRY_CHAIN_LEN)?;
            }
            let chain = peer.node.retry_chain();
            let rate_index = chain[(retry as usize).min(chain.len() - 1)];
            let max_payload_bytes = profile
                .entry(peer.node.rate_table_start_index() + rate_index as usize)
                .map(|entry| entry.max_payload_bytes(peer.node.guard_interval()))
                .unwrap_or_default();
            Ok(RateSelection {
                rate_index,
                max_payload_bytes,
            })
        })
    }
    /// Build a retry chain of up to `max_len` rates, starting with the last selected rate.
    pub fn retry_chain(
        &self,
        vif: usize,
        aid: u16,
        max_len: usize,
    ) -> Result<Vec<RateIndex, MAX_RETRY_CHAIN_LEN>, RateControlError> {
        self.with_inner(|inner| {
            let peer = inner.peer(PeerKey::new(vif, aid))?;
            let first = peer
                .node
                .retry_chain()
                .first()
                .copied()
                .unwrap_or(peer.cursor.current_rate());
            peer.cursor.build_retry_chain(&peer.node, first, max_len)
        })
    }
    /// The rate with the highest expected throughput for a peer.
    pub fn max_throughput_index(&self, vif: usize, aid: u16) -> Result<RateIndex, RateControlError> {
        self.with_inner(|inner| Ok(inner.peer(PeerKey::new(vif, aid))?.node.max_throughput_idx))
    }
    /// The rate, that the cursor of a peer currently points at.
    pub fn current_rate(&self, vif: usize, aid: u16) -> Result<RateIndex, RateControlError> {
        self.with_inner(|inner| Ok(inner.peer(PeerKey::new(vif, aid))?.cursor.current_rate()))
    }
    /// Inspect the statistics and cursor of a peer.
    pub fn inspect_peer<O>(
        &self,
        vif: usize,
        aid: u16,
        f: impl FnOnce(&PeerRateNode, &RateCursor) -> O,
    ) -> Result<O, RateControlError> {
        self.with_inner(|inner| {
            let peer = inner.peer(PeerKey::new(vif, aid))?;
            Ok((f)(&peer.node, &peer.cursor))
        })
    }

    /// The state of a VIF.
    ///
    /// A VIF without peers is [RateControlState::Idle].
    pub fn get_state(&self, vif: usize) -> Result<RateControlState, RateControlError> {
        self.with_inner(|inner| {
            let state = inner.vif(vif)?.state;
            Ok(if inner.peers.peer_count(vif) == 0 {
                RateControlState::Idle
            } else {
                state
            })
        })
    }
    /// Switch a VIF between fixed and adaptive rate selection.
    ///
    /// If no fixed rate was configured, switching to [RateControlState::Fixed] freezes the
    /// current rate of every peer. [RateControlState::Idle] can't be entered manually.
    pub fn set_state(&self, vif: usize, state: RateControlState) -> Result<(), RateControlError> {
        if state == RateControlState::Idle {
            warn!("VIF {} can't be set to idle.", vif);
            return Err(RateControlError::InvalidStateTransition);
        }
        self.with_inner(|inner| {
            let vif_context = inner.vif_mut(vif)?;
            vif_context.state = state;
            let fixed_index = vif_context.fixed_index;
            for (_, peer) in inner.peers.peers_of_vif_mut(vif) {
                match state {
                    RateControlState::Fixed => {
                        peer.cursor
                            .set_fixed_index(fixed_index.unwrap_or(peer.cursor.current_rate()));
                    }
                    _ => peer.cursor.anchor(peer.node.max_throughput_idx),
                }
                peer.cursor.set_state(state);
                peer.node.retry_chain.clear();
            }
            info!("VIF {} is now {:?}.", vif, state);
            Ok(())
        })
    }
    /// Use a fixed rate for all peers of a VIF.
    ///
    /// This also switches the VIF to [RateControlState::Fixed].
    pub fn set_fixed_rate(&self, vif: usize, index: RateIndex) -> Result<(), RateControlError> {
        self.with_inner(|inner| {
            let vif_context = inner.vif_mut(vif)?;
            if !vif_context.window.is_enabled(index) {
                warn!("Fixed rate {} isn't enabled on VIF {}.", index, vif);
                return Err(RateControlError::RateIndexOutOfRange);
            }
            vif_context.fixed_index = Some(index);
            vif_context.state = RateControlState::Fixed;
            for (_, peer) in inner.peers.peers_of_vif_mut(vif) {
                peer.cursor.set_fixed_index(index);
                peer.cursor.set_state(RateControlState::Fixed);
                peer.node.retry_chain.clear();
            }
            info!("VIF {} fixed to rate {}.", vif, index);
            Ok(())
        })
    }

    /// Set the MCS used for beacons on a VIF.
    pub fn set_beacon_mcs(&self, vif: usize, mcs: u8) -> Result<(), RateControlError> {
        if mcs as usize >= MCS_COUNT {
            warn!("Beacon MCS {} is out of range.", mcs);
            return Err(RateControlError::InvalidParameter);
        }
        self.with_inner(|inner| {
            inner.vif_mut(vif)?.beacon_mcs = mcs;
            Ok(())
        })
    }
    /// The MCS used for beacons on a VIF.
    pub fn beacon_mcs(&self, vif: usize) -> Result<u8, RateControlError> {
        self.with_inner(|inner| Ok(inner.vif(vif)?.beacon_mcs))
    }

    /// Capture the selection indices of a peer.
    pub fn save_status(&self, vif: usize, aid: u16) -> Result<RateStatusSnapshot, RateControlError> {
        self.with_inner(|inner| Ok(inner.peer(PeerKey::new(vif, aid))?.node.save_status()))
    }
    /// Restore the selection indices of a peer.
    pub fn restore_status(
        &self,
        vif: usize,
        aid: u16,
        snapshot: &RateStatusSnapshot,
    ) -> Result<(), RateControlError> {
        self.with_inner(|inner| {
            let peer = inner.peer_mut(PeerKey::new(vif, aid))?;
            peer.node.restore_status(snapshot).inspect_err(|_| {
                warn!("Status snapshot for AID {} is out of range.", aid)
            })?;
            if peer.cursor.state() == RateControlState::Adaptive {
                peer.cursor.anchor(peer.node.max_throughput_idx);
            }
            peer.node.retry_chain.clear();
            Ok(())
        })
    }

    /// The current parameters.
    pub fn parameters(&self) -> RateControlParameters {
        self.with_inner(|inner| inner.parameters)
    }
    /// Replace the parameters.
    pub fn set_parameters(
        &self,
        parameters: RateControlParameters,
    ) -> Result<(), RateControlError> {
        parameters.validate().inspect_err(|_| {
            warn!("Rejected invalid rate control parameters.");
        })?;
        self.with_inner(|inner| inner.parameters = parameters);
        info!("Updated rate control parameters.");
        Ok(())
    }
    /// Set the interval, at which the statistics are rolled over.
    pub fn set_update_interval(&self, update_interval_ms: u16) -> Result<(), RateControlError> {
        self.with_inner(|inner| {
            let parameters = RateControlParameters {
                update_interval_ms,
                ..inner.parameters
            };
            parameters.validate().inspect_err(|_| {
                warn!("Rejected update interval of {} ms.", update_interval_ms);
            })?;
            inner.parameters = parameters;
            Ok(())
        })?;
        info!("Update interval set to {} ms.", update_interval_ms);
        Ok(())
    }
    /// Stash the current parameters, so they can be brought back with
    /// [RateControl::restore_parameters].
    pub fn save_parameters(&self) {
        self.with_inner(|inner| inner.saved_parameters = Some(inner.parameters));
    }
    /// Bring back the parameters stashed with [RateControl::save_parameters].
    ///
    /// Returns `false` if nothing was stashed.
    pub fn restore_parameters(&self) -> bool {
        self.with_inner(|inner| match inner.saved_parameters.take() {
            Some(parameters) => {
                inner.parameters = parameters;
                true
            }
            None => false,
        })
    }

    /// Write a table of the statistics of all peers of a VIF.
    pub fn show(&self, vif: usize, writer: &mut impl Write) -> Result<(), RateControlError> {
        let profile = &self.profile;
        self.with_inner(|inner| {
            let vif_context = inner.vif(vif)?;
            show::write_vif(profile, vif, vif_context, &inner.peers, writer)
                .map_err(|_| RateControlError::Format)
        })
    }
    /// Write the current parameters.
    pub fn show_parameters(&self, writer: &mut impl Write) -> Result<(), RateControlError> {
        show::write_parameters(&self.parameters(), writer).map_err(|_| RateControlError::Format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_selection() {
        let profile = RateTableProfile::S1G;
        let capability = Capability {
            format: Format::S1g,
            attributes: RateAttributes::empty(),
            mcs_bitmap: 0b0000_0101_0100,
        };
        let window = RateWindow::select(&profile, Bandwidth::Mhz1, &capability).unwrap();
        assert_eq!(window.start, 2);
        assert_eq!(window.num_rates, 5);
        assert!(window.is_enabled(0));
        assert!(!window.is_enabled(1));
        assert!(window.is_enabled(2));
        assert!(window.is_enabled(4));
        assert!(!window.is_enabled(5));
        assert!(RateWindow::select(&profile, Bandwidth::Mhz2, &capability).is_none());

        let capability = Capability {
            attributes: RateAttributes::MHZ_40 | RateAttributes::SHORT_GI,
            ..capability
        };
        let window = RateWindow::select(&profile, Bandwidth::Mhz4, &capability).unwrap();
        assert_eq!(window.start, 19);
        assert_eq!(window.guard_interval, GuardInterval::Short);
    }
    #[test]
    fn fallback_is_most_robust() {
        let window = RateWindow::fallback(&RateTableProfile::S1G);
        assert_eq!((window.start, window.num_rates), (0, 1));
        assert!(window.is_enabled(0));
    }
}
