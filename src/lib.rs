#![no_std]
#![deny(missing_docs)]
//! # foa_rc
//! This crate implements link adaptation (rate control) for Ferris-on-Air. It's a Minstrel style
//! algorithm, which keeps success and throughput statistics for every rate of a peer, combined
//! with an ARF (Automatic Rate Fallback) cursor, that reacts to individual TX reports between two
//! statistics updates.
//!
//! ## Structure
//! | type | purpose |
//! | -- | -- |
//! | [RateTableProfile](rate_table::RateTableProfile) | The static rate table of a PHY. |
//! | [PeerRateNode] | Per rate statistics of one peer. |
//! | [RateCursor] | The ARF cursor and selection state of one peer. |
//! | [RateControl] | Orchestrates all peers and is the API used by the LMAC. |
//!
//! The LMAC feeds the outcome of every transmission into [RateControl::on_tx_report] (or
//! [RateControl::update_stats]), periodically calls [RateControl::tick] and asks
//! [RateControl::get_rate_index] for the rate of the next transmission attempt.
//!
//! ## Configuration
//! The following options can be set through `esp-config` at build time.
//!
//! Option | Default | Description
//! -- | -- | --
//! `FOA_RC_CONFIG_MAX_PEERS` | 8 | Peers, for which state can be held. Must be a power of two.
//! `FOA_RC_CONFIG_MAX_VIFS` | 2 | Virtual interfaces, that rate control is run for.
//! `FOA_RC_CONFIG_EWMA_LEVEL` | 75 | Weight of the old success probability in percent.
//! `FOA_RC_CONFIG_UPDATE_INTERVAL_MS` | 100 | Statistics rollover interval.
//! `FOA_RC_CONFIG_PROBE_INTERVAL_MS` | 200 | Minimum interval between two probes.
//! `FOA_RC_CONFIG_PROMOTION_THRESHOLD` | 3 | Successes before the cursor moves up.
//! `FOA_RC_CONFIG_DEMOTION_THRESHOLD` | 2 | Failures before the cursor falls back.

use esp_config::esp_config_int;

#[macro_use]
extern crate defmt_or_log;

mod cursor;
mod engine;
mod parameters;
pub mod rate_table;
mod stats;

pub use cursor::{RateControlState, RateCursor, RateStep, TrackIndex, TxEvent};
pub use engine::{PeerKey, RateControl, RateSelection, TxReport};
pub use parameters::RateControlParameters;
pub use stats::{PeerRateNode, RateStat, RateStatusSnapshot};

pub(crate) const MAX_PEERS: usize = esp_config_int!(usize, "FOA_RC_CONFIG_MAX_PEERS");
/// The amount of virtual interfaces, that rate control is run for.
pub const MAX_VIFS: usize = esp_config_int!(usize, "FOA_RC_CONFIG_MAX_VIFS");
pub(crate) const DEFAULT_EWMA_LEVEL: u8 = esp_config_int!(u8, "FOA_RC_CONFIG_EWMA_LEVEL");
pub(crate) const DEFAULT_UPDATE_INTERVAL_MS: u16 =
    esp_config_int!(u16, "FOA_RC_CONFIG_UPDATE_INTERVAL_MS");
pub(crate) const DEFAULT_PROBE_INTERVAL_MS: u16 =
    esp_config_int!(u16, "FOA_RC_CONFIG_PROBE_INTERVAL_MS");
pub(crate) const DEFAULT_PROMOTION_THRESHOLD: u8 =
    esp_config_int!(u8, "FOA_RC_CONFIG_PROMOTION_THRESHOLD");
pub(crate) const DEFAULT_DEMOTION_THRESHOLD: u8 =
    esp_config_int!(u8, "FOA_RC_CONFIG_DEMOTION_THRESHOLD");

const _: () = assert!(
    MAX_PEERS.is_power_of_two(),
    "FOA_RC_CONFIG_MAX_PEERS must be a power of two."
);

/// The maximum length of a retry chain.
pub const MAX_RETRY_CHAIN_LEN: usize = 9;

/// An index into the rates of a [PeerRateNode].
///
/// Index zero is the most robust rate of the node.
pub type RateIndex = u8;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// An error returned by rate control.
pub enum RateControlError {
    /// The VIF ID is out of range.
    UnknownVif,
    /// No peer with that AID is known on the VIF.
    UnknownPeer,
    /// The peer table is full.
    PeerTableFull,
    /// A peer with that AID already exists on the VIF.
    PeerExists,
    /// The rate index is out of range for the peer.
    RateIndexOutOfRange,
    /// The peer has no valid rates.
    NoRates,
    /// The requested capabilities don't overlap with the rate table.
    ///
    /// The most robust rate was installed as a fallback.
    NoCapabilityOverlap,
    /// The requested state transition isn't allowed.
    InvalidStateTransition,
    /// A parameter is out of range.
    InvalidParameter,
    /// Writing diagnostic output failed.
    Format,
}
