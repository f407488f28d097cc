//! This module contains the static rate tables.
//!
//! A [RateTableProfile] describes all rates, that a PHY supports. The entries are grouped by
//! [Bandwidth] and within one bandwidth class they're ordered by ascending nominal PHY rate. This
//! means, that index zero of a class is always the most robust rate and the last index the fastest
//! one. The `order` of an entry is its dense index into the flattened table.
//!
//! The PHY rates themselves aren't stored, but derived from the modulation tables, so a profile
//! only has to name the format and MCS of its entries.

use core::ops::BitOr;

/// The amount of MCS indices known to the modulation tables (MCS0-MCS10).
pub const MCS_COUNT: usize = 11;
/// The maximum amount of rates, that a single bandwidth class of a profile may contain.
pub const MAX_RATES_PER_BANDWIDTH: usize = MCS_COUNT;

/// Bits of the SERVICE field, that precede the PSDU in the data field.
const SERVICE_BITS: u32 = 8;
/// Tail bits appended to the PSDU for BCC.
const TAIL_BITS: u32 = 6;
/// Upper bound on the duration of the data field of a single PPDU.
const MAX_PPDU_DATA_DURATION_US: u32 = 27_840;

/// Data bits per OFDM symbol (N_DBPS) for one spatial stream, indexed by bandwidth and MCS.
///
/// A zero marks an MCS, that isn't valid for that bandwidth.
const DATA_BITS_PER_SYMBOL: [[u16; MCS_COUNT]; 3] = [
    // 1 MHz, MCS10 is BPSK 1/2 with 2x repetition.
    [12, 24, 36, 48, 72, 96, 108, 120, 144, 160, 6],
    // 2 MHz
    [26, 52, 78, 104, 156, 208, 234, 260, 312, 0, 0],
    // 4 MHz
    [54, 108, 162, 216, 324, 432, 486, 540, 648, 720, 0],
];

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// The width of the channel, that a rate is transmitted with.
pub enum Bandwidth {
    #[default]
    /// 1 MHz
    Mhz1,
    /// 2 MHz
    Mhz2,
    /// 4 MHz
    Mhz4,
}
impl Bandwidth {
    /// All bandwidths, from narrowest to widest.
    pub const ALL: [Self; 3] = [Self::Mhz1, Self::Mhz2, Self::Mhz4];

    /// The index of the bandwidth into per bandwidth tables.
    pub const fn index(self) -> usize {
        self as usize
    }
    /// The width in MHz.
    pub const fn as_mhz(self) -> u8 {
        match self {
            Self::Mhz1 => 1,
            Self::Mhz2 => 2,
            Self::Mhz4 => 4,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// The PHY format of a rate.
pub enum Format {
    #[default]
    /// Sub 1 GHz (IEEE 802.11ah).
    S1g,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// The guard interval used for the OFDM symbols.
pub enum GuardInterval {
    #[default]
    /// 8 µs guard interval.
    Long,
    /// 4 µs guard interval.
    Short,
}
impl GuardInterval {
    /// The duration of one OFDM symbol including the guard interval.
    pub const fn symbol_duration_us(self) -> u32 {
        match self {
            Self::Long => 40,
            Self::Short => 36,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// Attributes of a rate.
///
/// The 20 MHz and 40 MHz flags are the down-clocked equivalents of the 2 MHz and 4 MHz S1G widths.
/// When used as a capability, they enable the respective bandwidth class.
pub struct RateAttributes(u8);
impl RateAttributes {
    /// 20 MHz, or 2 MHz for S1G.
    pub const MHZ_20: Self = Self(1 << 0);
    /// 40 MHz, or 4 MHz for S1G.
    pub const MHZ_40: Self = Self(1 << 1);
    /// Reserved.
    pub const RESERVED: Self = Self(1 << 2);
    /// Short guard interval.
    pub const SHORT_GI: Self = Self(1 << 3);

    /// No attributes set.
    pub const fn empty() -> Self {
        Self(0)
    }
    /// Create the attributes from their raw representation.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
    /// The raw representation.
    pub const fn bits(self) -> u8 {
        self.0
    }
    /// Combine two sets of attributes.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
    /// Check if all attributes in `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
    /// Check whether these capability attributes enable the bandwidth class.
    ///
    /// 1 MHz is always enabled.
    pub const fn allows(self, bandwidth: Bandwidth) -> bool {
        match bandwidth {
            Bandwidth::Mhz1 => true,
            Bandwidth::Mhz2 => self.contains(Self::MHZ_20),
            Bandwidth::Mhz4 => self.contains(Self::MHZ_40),
        }
    }
    /// The guard interval requested by these attributes.
    pub const fn guard_interval(self) -> GuardInterval {
        if self.contains(Self::SHORT_GI) {
            GuardInterval::Short
        } else {
            GuardInterval::Long
        }
    }
}
impl BitOr for RateAttributes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// Calculate the nominal PHY rate of an MCS in kbit/s.
///
/// Returns [None] if the MCS isn't valid for the bandwidth.
pub const fn mcs_to_rate(
    bandwidth: Bandwidth,
    mcs: u8,
    guard_interval: GuardInterval,
) -> Option<u32> {
    if mcs as usize >= MCS_COUNT {
        return None;
    }
    let data_bits_per_symbol = DATA_BITS_PER_SYMBOL[bandwidth.index()][mcs as usize];
    if data_bits_per_symbol == 0 {
        return None;
    }
    // bits/µs is Mbit/s, so scaling the bits by 1000 yields kbit/s.
    Some(data_bits_per_symbol as u32 * 1000 / guard_interval.symbol_duration_us())
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// An entry of a rate table.
pub struct RateTableEntry {
    /// Dense index of this entry into the flattened table.
    pub order: u8,
    /// The PHY format.
    pub format: Format,
    /// The MCS index.
    pub mcs: u8,
    /// The bandwidth class this entry belongs to.
    pub bandwidth: Bandwidth,
    /// Attributes supported by this entry.
    pub attributes: RateAttributes,
    /// The lowest RSSI in dBm, at which this rate is still expected to work.
    pub min_rssi: i8,
}
impl RateTableEntry {
    /// The nominal PHY rate in kbit/s.
    ///
    /// Entries in a valid profile always have a valid MCS, so this returns zero otherwise.
    pub const fn nominal_phy_rate(&self, guard_interval: GuardInterval) -> u32 {
        match mcs_to_rate(self.bandwidth, self.mcs, guard_interval) {
            Some(rate) => rate,
            None => 0,
        }
    }
    /// The maximum amount of payload bytes, that fit into the data field of one PPDU.
    pub const fn max_payload_bytes(&self, guard_interval: GuardInterval) -> u32 {
        if self.mcs as usize >= MCS_COUNT {
            return 0;
        }
        let data_bits_per_symbol =
            DATA_BITS_PER_SYMBOL[self.bandwidth.index()][self.mcs as usize] as u32;
        let symbols = MAX_PPDU_DATA_DURATION_US / guard_interval.symbol_duration_us();
        (symbols * data_bits_per_symbol).saturating_sub(SERVICE_BITS + TAIL_BITS) / 8
    }
}

const fn s1g_entry(order: u8, bandwidth: Bandwidth, mcs: u8, min_rssi: i8) -> RateTableEntry {
    let attributes = match bandwidth {
        Bandwidth::Mhz1 => RateAttributes::SHORT_GI,
        Bandwidth::Mhz2 => RateAttributes::MHZ_20.union(RateAttributes::SHORT_GI),
        Bandwidth::Mhz4 => RateAttributes::MHZ_40.union(RateAttributes::SHORT_GI),
    };
    RateTableEntry {
        order,
        format: Format::S1g,
        mcs,
        bandwidth,
        attributes,
        min_rssi,
    }
}

static S1G_ENTRIES: [RateTableEntry; 25] = [
    s1g_entry(0, Bandwidth::Mhz1, 0, -98),
    s1g_entry(1, Bandwidth::Mhz1, 1, -95),
    s1g_entry(2, Bandwidth::Mhz1, 2, -93),
    s1g_entry(3, Bandwidth::Mhz1, 3, -90),
    s1g_entry(4, Bandwidth::Mhz1, 4, -86),
    s1g_entry(5, Bandwidth::Mhz1, 5, -82),
    s1g_entry(6, Bandwidth::Mhz1, 6, -81),
    s1g_entry(7, Bandwidth::Mhz1, 7, -79),
    s1g_entry(8, Bandwidth::Mhz1, 8, -74),
    s1g_entry(9, Bandwidth::Mhz2, 0, -95),
    s1g_entry(10, Bandwidth::Mhz2, 1, -92),
    s1g_entry(11, Bandwidth::Mhz2, 2, -90),
    s1g_entry(12, Bandwidth::Mhz2, 3, -87),
    s1g_entry(13, Bandwidth::Mhz2, 4, -83),
    s1g_entry(14, Bandwidth::Mhz2, 5, -79),
    s1g_entry(15, Bandwidth::Mhz2, 6, -78),
    s1g_entry(16, Bandwidth::Mhz2, 7, -76),
    s1g_entry(17, Bandwidth::Mhz4, 0, -92),
    s1g_entry(18, Bandwidth::Mhz4, 1, -89),
    s1g_entry(19, Bandwidth::Mhz4, 2, -87),
    s1g_entry(20, Bandwidth::Mhz4, 3, -84),
    s1g_entry(21, Bandwidth::Mhz4, 4, -80),
    s1g_entry(22, Bandwidth::Mhz4, 5, -76),
    s1g_entry(23, Bandwidth::Mhz4, 6, -75),
    s1g_entry(24, Bandwidth::Mhz4, 7, -73),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The rate table of one PHY.
///
/// This is chosen when constructing the [RateControl](crate::RateControl) and can't change
/// afterwards.
pub struct RateTableProfile {
    name: &'static str,
    entries: &'static [RateTableEntry],
}
impl RateTableProfile {
    /// The IEEE 802.11ah (HaLow) profile with 1, 2 and 4 MHz channels.
    pub const S1G: Self = Self::new("S1G", &S1G_ENTRIES);

    /// Create a new profile from a table.
    ///
    /// Use [RateTableProfile::is_valid] to check, that the table upholds the ordering invariants.
    pub const fn new(name: &'static str, entries: &'static [RateTableEntry]) -> Self {
        Self { name, entries }
    }
    /// The name of the profile.
    pub const fn name(&self) -> &'static str {
        self.name
    }
    /// The flattened table.
    pub const fn entries(&self) -> &'static [RateTableEntry] {
        self.entries
    }
    /// The flat index of the first entry of a bandwidth class.
    ///
    /// If the class is empty, this is the length of the table.
    pub fn base(&self, bandwidth: Bandwidth) -> usize {
        self.entries
            .iter()
            .position(|entry| entry.bandwidth == bandwidth)
            .unwrap_or(self.entries.len())
    }
    /// The amount of entries in a bandwidth class.
    pub fn count(&self, bandwidth: Bandwidth) -> usize {
        self.slice(bandwidth).len()
    }
    /// All entries of a bandwidth class, from most robust to fastest.
    pub fn slice(&self, bandwidth: Bandwidth) -> &'static [RateTableEntry] {
        let entries = self.entries;
        let base = self.base(bandwidth);
        let count = entries[base..]
            .iter()
            .take_while(|entry| entry.bandwidth == bandwidth)
            .count();
        &entries[base..base + count]
    }
    /// Get the entry at `index` of a bandwidth class.
    ///
    /// Returns [None] if `index` is out of range.
    pub fn get_entry(
        &self,
        bandwidth: Bandwidth,
        index: usize,
    ) -> Option<&'static RateTableEntry> {
        self.slice(bandwidth).get(index)
    }
    /// Get an entry by its flat index.
    pub fn entry(&self, order: usize) -> Option<&'static RateTableEntry> {
        self.entries.get(order)
    }
    /// Find the index of a format and MCS within a bandwidth class.
    pub fn find(&self, bandwidth: Bandwidth, format: Format, mcs: u8) -> Option<usize> {
        self.slice(bandwidth)
            .iter()
            .position(|entry| entry.format == format && entry.mcs == mcs)
    }
    /// The most robust entry of the narrowest populated bandwidth class.
    pub fn most_robust(&self) -> Option<&'static RateTableEntry> {
        Bandwidth::ALL
            .iter()
            .find_map(|bandwidth| self.get_entry(*bandwidth, 0))
    }
    /// Check that the table is grouped by bandwidth, ordered by ascending PHY rate within each
    /// class, densely numbered and that no class exceeds [MAX_RATES_PER_BANDWIDTH].
    pub fn is_valid(&self) -> bool {
        let dense = self
            .entries
            .iter()
            .enumerate()
            .all(|(i, entry)| entry.order as usize == i);
        let grouped = self
            .entries
            .windows(2)
            .all(|pair| pair[0].bandwidth <= pair[1].bandwidth);
        let ascending = Bandwidth::ALL.iter().all(|bandwidth| {
            let slice = self.slice(*bandwidth);
            slice.len() <= MAX_RATES_PER_BANDWIDTH
                && slice.iter().all(|entry| entry.nominal_phy_rate(GuardInterval::Long) != 0)
                && slice.windows(2).all(|pair| {
                    pair[0].nominal_phy_rate(GuardInterval::Long)
                        < pair[1].nominal_phy_rate(GuardInterval::Long)
                })
        });
        dense && grouped && ascending && !self.entries.is_empty()
    }
}
impl Default for RateTableProfile {
    fn default() -> Self {
        Self::S1G
    }
}
