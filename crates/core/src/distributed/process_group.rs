//! Rank bookkeeping for the devices sharing a reduction.

use super::error::{DistributedError, Result};

/// A set of ranks taking part in collective operations.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this participant (0..world_size).
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether collectives reduce to identities.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// In-process group: every rank is a thread of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Single-rank group.
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn with_rank(rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_pg_is_single_coordinator() {
        let pg = LocalProcessGroup::new();
        assert!(pg.is_coordinator());
        assert!(pg.is_single());
    }

    #[test]
    fn local_pg_with_rank() {
        let pg = LocalProcessGroup::with_rank(2, 4).unwrap();
        assert_eq!(pg.rank(), 2);
        assert_eq!(pg.world_size(), 4);
        assert!(!pg.is_coordinator());
        assert!(!pg.is_single());
    }

    #[test]
    fn local_pg_invalid_rank() {
        assert!(matches!(
            LocalProcessGroup::with_rank(5, 4),
            Err(DistributedError::InvalidRank {
                rank: 5,
                world_size: 4
            })
        ));
    }
}
