use heapless::FnvIndexMap;

use crate::{MAX_PEERS, PeerRateNode, RateCursor, RateControlError};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identifies a peer.
pub struct PeerKey {
    /// The VIF the peer is associated with.
    pub vif: usize,
    /// The association ID of the peer.
    pub aid: u16,
}
impl PeerKey {
    /// Create a new key.
    pub const fn new(vif: usize, aid: u16) -> Self {
        Self { vif, aid }
    }
}

/// Everything rate control knows about one peer.
#[derive(Clone, Debug)]
pub(crate) struct PeerContext {
    pub(crate) node: PeerRateNode,
    pub(crate) cursor: RateCursor,
}

pub(crate) trait PeerRegistry {
    const UNINIT: Self;

    fn iter_mut(&mut self) -> impl Iterator<Item = (&PeerKey, &mut PeerContext)> + '_;
    fn iter(&self) -> impl Iterator<Item = (&PeerKey, &PeerContext)> + '_;
    fn is_full(&self) -> bool;
    fn contains_key(&self, key: &PeerKey) -> bool;
    fn insert(&mut self, key: PeerKey, peer: PeerContext) -> Result<(), RateControlError>;

    /// Add a peer, that isn't known yet.
    fn add_peer(
        &mut self,
        key: PeerKey,
        create: impl FnOnce() -> PeerContext,
    ) -> Result<(), RateControlError> {
        if self.contains_key(&key) {
            Err(RateControlError::PeerExists)
        } else if self.is_full() {
            Err(RateControlError::PeerTableFull)
        } else {
            self.insert(key, (create)())
        }
    }
    /// Iterate over all peers associated with a VIF.
    fn peers_of_vif_mut(
        &mut self,
        vif: usize,
    ) -> impl Iterator<Item = (&PeerKey, &mut PeerContext)> + '_ {
        self.iter_mut().filter(move |(key, _)| key.vif == vif)
    }
    /// The amount of peers associated with a VIF.
    fn peer_count(&self, vif: usize) -> usize {
        self.iter().filter(|(key, _)| key.vif == vif).count()
    }
}

pub(crate) type StaticPeerRegistry = FnvIndexMap<PeerKey, PeerContext, MAX_PEERS>;
impl PeerRegistry for StaticPeerRegistry {
    const UNINIT: Self = Self::new();

    fn iter_mut(&mut self) -> impl Iterator<Item = (&PeerKey, &mut PeerContext)> + '_ {
        self.iter_mut()
    }
    fn iter(&self) -> impl Iterator<Item = (&PeerKey, &PeerContext)> + '_ {
        self.iter()
    }
    fn is_full(&self) -> bool {
        self.capacity() == self.len()
    }
    fn contains_key(&self, key: &PeerKey) -> bool {
        self.contains_key(key)
    }
    fn insert(&mut self, key: PeerKey, peer: PeerContext) -> Result<(), RateControlError> {
        self.insert(key, peer)
            .map(|_| ())
            .map_err(|_| RateControlError::PeerTableFull)
    }
}
