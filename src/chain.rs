//! Guard for walking record chains.
//!
//! Chains live in an ordinary file that other processes rewrite without telling us, so a
//! walk must defend against links that loop back on themselves.  Every walk runs through
//! a [`ChainGuard`] which remembers the offsets it has visited and errors on a revisit.
//! The guard also enforces the optional chain-length cap: records past the cap are
//! simply invisible, the walk stops without error.

use crate::error::WalkError;
use std::collections::HashSet;

/// Tracks visited offsets for one chain walk.
pub struct ChainGuard {
    visited: HashSet<u32>,
    limit: Option<u32>,
}

impl ChainGuard {
    /// New guard, optionally capping the walk at limit records.
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            visited: HashSet::new(),
            limit,
        }
    }

    /// Record a step to offset.  Returns Ok(false) when the cap is reached (stop the
    /// walk, no error) and Err on a revisited offset.
    pub fn visit(&mut self, offset: u32) -> Result<bool, WalkError> {
        if let Some(limit) = self.limit {
            if self.visited.len() >= limit as usize {
                return Ok(false);
            }
        }
        if !self.visited.insert(offset) {
            return Err(WalkError::Cycle);
        }
        Ok(true)
    }

    /// Forget all visited offsets, ready for a new chain.
    pub fn reset(&mut self) {
        self.visited.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle() {
        let mut guard = ChainGuard::new(None);
        assert!(guard.visit(100).unwrap());
        assert!(guard.visit(200).unwrap());
        assert!(matches!(guard.visit(100), Err(WalkError::Cycle)));
        guard.reset();
        assert!(guard.visit(100).unwrap());
    }

    #[test]
    fn test_limit() {
        let mut guard = ChainGuard::new(Some(2));
        assert!(guard.visit(1).unwrap());
        assert!(guard.visit(2).unwrap());
        // Cap reached, further records are invisible rather than an error.
        assert!(!guard.visit(3).unwrap());
    }
}
