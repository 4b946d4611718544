//! Cluster-unique actor identities.
//!
//! An [`Id`] names an actor by the rank it lives on and a `gid` unique
//! across the whole cluster. Each rank mints gids from its own arithmetic
//! progression (`rank, rank + size, rank + 2 * size, …`), so
//! `gid % size == rank` for every minted id and two ranks can never
//! collide without any coordination.

use crate::{
    record::{Record, SizedRecord},
    Error,
};
use bytes::{Buf, BufMut};
use std::fmt;

/// Identity of one actor: the rank that owns it and its cluster-wide gid.
///
/// Ids are plain values: cheaply copied, never owned by the actor they
/// name, and valid to hold after that actor dies (messages addressed to a
/// dead id are buffered and never delivered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id {
    rank: i32,
    gid: i32,
}

impl Id {
    /// The "no actor" sentinel.
    pub const NONE: Self = Self { rank: -1, gid: -1 };

    /// Creates an id from its parts.
    pub const fn new(rank: i32, gid: i32) -> Self {
        Self { rank, gid }
    }

    /// Rank of the owning process.
    pub const fn rank(&self) -> i32 {
        self.rank
    }

    /// Cluster-unique identifier component.
    pub const fn gid(&self) -> i32 {
        self.gid
    }

    /// Whether this is the [`Id::NONE`] sentinel.
    pub const fn is_none(&self) -> bool {
        self.rank < 0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rank, self.gid)
    }
}

impl Record for Id {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.rank.write(buf);
        self.gid.write(buf);
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let rank = i32::read(buf)?;
        let gid = i32::read(buf)?;
        Ok(Self { rank, gid })
    }

    fn len_encoded(&self) -> usize {
        Self::LEN
    }
}

impl SizedRecord for Id {
    const LEN: usize = 8;
}

/// Mints gids for one rank.
///
/// Seeded with the local rank and stepping by the cluster size; the first
/// mint returns the rank itself. One minter exists per rank, owned by the
/// distributed factory.
#[derive(Debug)]
pub struct Minter {
    next: i32,
    step: i32,
}

impl Minter {
    /// Creates a minter for `rank` in a cluster of `size` ranks.
    pub const fn new(rank: i32, size: i32) -> Self {
        Self {
            next: rank,
            step: size,
        }
    }

    /// Returns the next gid in this rank's progression.
    pub fn next_gid(&mut self) -> i32 {
        let gid = self.next;
        self.next += self.step;
        gid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minting_stays_in_rank_residue_class() {
        let mut minter = Minter::new(2, 4);
        assert_eq!(minter.next_gid(), 2);
        assert_eq!(minter.next_gid(), 6);
        assert_eq!(minter.next_gid(), 10);

        let mut minter = Minter::new(0, 1);
        assert_eq!(minter.next_gid(), 0);
        assert_eq!(minter.next_gid(), 1);
    }

    #[test]
    fn none_sentinel() {
        assert!(Id::NONE.is_none());
        assert!(Id::default().is_none());
        assert!(!Id::new(0, 0).is_none());
        assert_eq!(Id::NONE.rank(), -1);
        assert_eq!(Id::NONE.gid(), -1);
    }

    #[test]
    fn wire_round_trip() {
        let id = Id::new(3, 19);
        let encoded = id.encode();
        assert_eq!(encoded.len(), Id::LEN);
        assert_eq!(Id::decode(encoded).unwrap(), id);
    }

    #[test]
    fn display_shows_rank_and_gid() {
        assert_eq!(Id::new(1, 9).to_string(), "1/9");
    }
}
