//! # Identifiers and Versions
//!
//! Every operation is identified by the replica that authored it plus a
//! per-replica counter. Node ids are the ids of their create operations, so
//! they stay unique across replicas and survive reconnects unchanged.
//!
//! Both types mirror their Loro counterparts (`TreeID`, `VersionVector`)
//! but are serde-friendly and ordered, so they can travel in sync frames.

use loro::TreeID;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::CrdtError;

/// Replica identifier
pub type PeerId = u64;

/// Globally unique operation id (`counter@peer`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub peer: PeerId,
    pub counter: u32,
}

/// Node ids are the ids of the op that created the node
pub type TreeId = OpId;

impl OpId {
    pub fn new(peer: PeerId, counter: u32) -> Self {
        Self { peer, counter }
    }

    pub(crate) fn to_loro(self) -> TreeID {
        TreeID::new(self.peer, self.counter as i32)
    }

    pub(crate) fn from_loro(id: TreeID) -> Self {
        Self::new(id.peer, id.counter.max(0) as u32)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.peer)
    }
}

impl FromStr for OpId {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (counter, peer) = s
            .split_once('@')
            .ok_or_else(|| CrdtError::InvalidId(s.to_string()))?;
        let counter = counter
            .parse()
            .map_err(|_| CrdtError::InvalidId(s.to_string()))?;
        let peer = peer
            .parse()
            .map_err(|_| CrdtError::InvalidId(s.to_string()))?;
        Ok(Self { peer, counter })
    }
}

/// Causal frontier: for every peer, the next counter not yet seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<PeerId, u32>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unseen counter for `peer`
    pub fn get(&self, peer: PeerId) -> u32 {
        self.0.get(&peer).copied().unwrap_or(0)
    }

    pub fn set_end(&mut self, peer: PeerId, end: u32) {
        if end == 0 {
            self.0.remove(&peer);
        } else {
            self.0.insert(peer, end);
        }
    }

    /// Raise the frontier for `peer` to at least `end`
    pub fn extend_to(&mut self, peer: PeerId, end: u32) {
        if end == 0 {
            return;
        }
        let entry = self.0.entry(peer).or_insert(0);
        if *entry < end {
            *entry = end;
        }
    }

    pub fn includes(&self, id: OpId) -> bool {
        id.counter < self.get(id.peer)
    }

    /// True when every op seen by `other` is also seen by `self`
    pub fn covers(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(peer, end)| self.get(*peer) >= *end)
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &VersionVector) {
        for (peer, end) in &other.0 {
            self.extend_to(*peer, *end);
        }
    }

    pub fn union(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, u32)> + '_ {
        self.0.iter().map(|(peer, end)| (*peer, *end))
    }

    /// Number of ops seen, over all peers
    pub fn op_count(&self) -> u64 {
        self.0.values().map(|end| u64::from(*end)).sum()
    }

    pub(crate) fn to_loro(&self) -> loro::VersionVector {
        let mut vv = loro::VersionVector::new();
        for (peer, end) in self.iter() {
            vv.insert(peer, end as i32);
        }
        vv
    }

    pub(crate) fn from_loro(vv: &loro::VersionVector) -> Self {
        let mut version = Self::new();
        for (peer, end) in vv.iter() {
            version.extend_to(*peer, (*end).max(0) as u32);
        }
        version
    }
}

impl PartialOrd for VersionVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.covers(other), other.covers(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_display_round_trip() {
        let id = OpId::new(42, 7);
        assert_eq!(id.to_string(), "7@42");
        assert_eq!("7@42".parse::<OpId>().unwrap(), id);
    }

    #[test]
    fn test_op_id_rejects_garbage() {
        assert!("w-7@42".parse::<OpId>().is_err());
        assert!("742".parse::<OpId>().is_err());
    }

    #[test]
    fn test_version_vector_comparison() {
        let mut a = VersionVector::new();
        a.extend_to(1, 3);
        let mut b = a.clone();
        b.extend_to(2, 1);

        assert!(b > a);
        assert!(b.covers(&a));
        assert!(!a.covers(&b));
        assert!(b.includes(OpId::new(2, 0)));
        assert!(!a.includes(OpId::new(2, 0)));

        let mut c = VersionVector::new();
        c.extend_to(3, 1);
        assert_eq!(a.partial_cmp(&c), None);
        assert!(a.union(&c).covers(&c));
        assert_eq!(a.union(&c).op_count(), 4);
    }

    #[test]
    fn test_loro_conversions_keep_ids_and_frontiers() {
        let id = OpId::new(7, 12);
        assert_eq!(OpId::from_loro(id.to_loro()), id);

        let mut version = VersionVector::new();
        version.extend_to(1, 3);
        version.extend_to(9, 40);
        assert_eq!(VersionVector::from_loro(&version.to_loro()), version);
    }
}
