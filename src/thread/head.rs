//! Thread HEAD as a set of tips.
//!
//! HEAD is normally a single block id whose ancestry covers every indexed
//! block, but between receiving concurrent branches and committing the next
//! MERGE it is a set of tips. Tips are kept sorted and deduplicated so the
//! comma-joined string form is stable.

use crate::block::BlockId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The current frontier of a thread's DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head(Vec<BlockId>);

impl Head {
    /// An empty HEAD (no blocks yet).
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// A single-tip HEAD.
    pub fn single(tip: BlockId) -> Self {
        Self(vec![tip])
    }

    /// Builds a HEAD from tips, sorting and deduplicating.
    pub fn from_tips(tips: impl IntoIterator<Item = BlockId>) -> Self {
        let mut tips: Vec<BlockId> = tips.into_iter().collect();
        tips.sort();
        tips.dedup();
        Self(tips)
    }

    /// Parses the comma-joined string form.
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        if s.is_empty() {
            return Ok(Self::empty());
        }
        let tips = s
            .split(',')
            .map(BlockId::from_base58)
            .collect::<crate::error::Result<Vec<_>>>()?;
        Ok(Self::from_tips(tips))
    }

    pub fn tips(&self) -> &[BlockId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.0.binary_search(id).is_ok()
    }

    /// Attempts a fast-forward onto `inbound` given its parents.
    ///
    /// Possible when HEAD is empty or any current tip is among the inbound
    /// parents (set membership, never string equality). Covered tips are
    /// replaced by the inbound id; uncovered tips stay, so a multi-tip HEAD
    /// can fast-forward one branch without losing the others.
    ///
    /// Returns `None` when the inbound block is concurrent and a MERGE is
    /// required instead.
    pub fn fast_forward(&self, inbound: BlockId, inbound_parents: &[BlockId]) -> Option<Head> {
        if self.is_empty() {
            return Some(Head::single(inbound));
        }
        if !self.0.iter().any(|tip| inbound_parents.contains(tip)) {
            return None;
        }
        let kept = self
            .0
            .iter()
            .copied()
            .filter(|tip| !inbound_parents.contains(tip));
        Some(Head::from_tips(kept.chain(std::iter::once(inbound))))
    }

    /// The deduplicated, sorted parent set for a MERGE of this HEAD with an
    /// inbound tip. Deterministic: every peer merging the same tips builds
    /// the same list.
    pub fn merge_parents(&self, inbound: BlockId) -> Vec<BlockId> {
        let mut parents = self.0.clone();
        parents.push(inbound);
        parents.sort();
        parents.dedup();
        parents
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|id| id.to_base58())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}", joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_id(tag: u8) -> BlockId {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        BlockId::from_bytes(bytes)
    }

    #[test]
    fn test_from_tips_sorts_and_dedups() {
        let head = Head::from_tips(vec![make_id(3), make_id(1), make_id(3)]);
        assert_eq!(head.tips(), &[make_id(1), make_id(3)]);
    }

    #[test]
    fn test_string_roundtrip() {
        let head = Head::from_tips(vec![make_id(2), make_id(1)]);
        let parsed = Head::parse(&head.to_string()).unwrap();
        assert_eq!(head, parsed);

        assert_eq!(Head::parse("").unwrap(), Head::empty());
    }

    #[test]
    fn test_fast_forward_from_empty() {
        let head = Head::empty();
        let next = head.fast_forward(make_id(1), &[]).unwrap();
        assert_eq!(next.tips(), &[make_id(1)]);
    }

    #[test]
    fn test_fast_forward_linear() {
        let head = Head::single(make_id(1));
        let next = head.fast_forward(make_id(2), &[make_id(1)]).unwrap();
        assert_eq!(next.tips(), &[make_id(2)]);
    }

    #[test]
    fn test_fast_forward_concurrent_is_none() {
        let head = Head::single(make_id(2));
        // Inbound's parents do not cover the current tip.
        assert!(head.fast_forward(make_id(3), &[make_id(1)]).is_none());
    }

    #[test]
    fn test_fast_forward_multi_tip_keeps_uncovered() {
        let head = Head::from_tips(vec![make_id(1), make_id(2)]);
        let next = head.fast_forward(make_id(3), &[make_id(1)]).unwrap();
        assert_eq!(next.tips(), &[make_id(2), make_id(3)]);
    }

    #[test]
    fn test_merge_parents_deterministic() {
        let head_a = Head::from_tips(vec![make_id(2), make_id(1)]);
        let head_b = Head::from_tips(vec![make_id(1), make_id(2)]);
        assert_eq!(head_a.merge_parents(make_id(3)), head_b.merge_parents(make_id(3)));
        assert_eq!(
            head_a.merge_parents(make_id(3)),
            vec![make_id(1), make_id(2), make_id(3)]
        );
    }
}
