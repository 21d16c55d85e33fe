use anyhow::{ensure, Result};

/// Position of this process inside its data-parallel group.
///
/// Peers in the same group hold identical model replicas and consume
/// different data shards, so the pair `(rank, world_size)` is what turns a
/// per-process batch counter into a batch id that is unique across the group.
pub trait DataParallelGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;
}

/// A data-parallel group whose layout is fixed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticDataParallelGroup {
    rank: usize,
    world_size: usize,
}

impl StaticDataParallelGroup {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        ensure!(world_size > 0, "world_size must be positive, but got 0");
        ensure!(
            rank < world_size,
            "rank {} out of range for a data-parallel group of size {}",
            rank,
            world_size
        );
        Ok(Self { rank, world_size })
    }

    /// The trivial group of a non-distributed run.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl Default for StaticDataParallelGroup {
    fn default() -> Self {
        Self::single()
    }
}

impl DataParallelGroup for StaticDataParallelGroup {
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
    fn test_static_group_validation() {
        assert!(StaticDataParallelGroup::new(0, 0).is_err());
        assert!(StaticDataParallelGroup::new(2, 2).is_err());

        let group = StaticDataParallelGroup::new(1, 2).unwrap();
        assert_eq!(group.rank(), 1);
        assert_eq!(group.world_size(), 2);
        assert_eq!(StaticDataParallelGroup::default(), StaticDataParallelGroup::single());
    }
}
