//! Implicit binary tree over a flat rank space
//!
//! Rank `r` has children `2r+1` and `2r+2` (when they exist) and parent
//! `(r-1)/2`. The root is rank 0 and is its own parent: there is no sentinel
//! value, so callers that must not self-address check [`is_root`] first.
//!
//! Everything here is pure and safe to call from any thread.

/// Identity of one participant, unique in `[0, world_size)`
pub type Rank = usize;

/// Rank of the tree root
pub const ROOT: Rank = 0;

/// Parent of `rank`. The root returns itself.
pub fn parent(rank: Rank) -> Rank {
    if rank == ROOT {
        ROOT
    } else {
        (rank - 1) / 2
    }
}

/// Children of `rank` in a tree of `world_size` participants, in rank order
pub fn children(rank: Rank, world_size: usize) -> Vec<Rank> {
    if world_size < 2 {
        return Vec::new();
    }

    [2 * rank + 1, 2 * rank + 2]
        .into_iter()
        .filter(|&child| child < world_size)
        .collect()
}

/// Whether `rank` is the root
pub fn is_root(rank: Rank) -> bool {
    rank == ROOT
}

/// Whether `rank` has no children
pub fn is_leaf(rank: Rank, world_size: usize) -> bool {
    2 * rank + 1 >= world_size
}

/// Number of edges between `rank` and the root
pub fn depth(rank: Rank) -> u32 {
    // floor(log2(rank + 1))
    usize::BITS - 1 - (rank + 1).leading_zeros()
}

/// Number of ranks in the subtree rooted at `rank`, including itself
pub fn subtree_size(rank: Rank, world_size: usize) -> usize {
    if rank >= world_size {
        return 0;
    }

    let mut size = 0;
    let mut first = rank;
    let mut width = 1usize;
    // Each level of the subtree is a contiguous run of ranks.
    while first < world_size {
        let last = first.saturating_add(width).min(world_size);
        size += last - first;
        first = first.saturating_mul(2).saturating_add(1);
        width = width.saturating_mul(2);
    }
    size
}

/// A participant's view of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    rank: Rank,
    world_size: usize,
}

impl Topology {
    /// Create a view for `rank` in a tree of `world_size` participants.
    ///
    /// Returns `None` when `rank` is out of range.
    pub fn new(rank: Rank, world_size: usize) -> Option<Self> {
        (rank < world_size).then_some(Self { rank, world_size })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn parent(&self) -> Rank {
        parent(self.rank)
    }

    pub fn children(&self) -> Vec<Rank> {
        children(self.rank, self.world_size)
    }

    pub fn is_root(&self) -> bool {
        is_root(self.rank)
    }

    pub fn is_leaf(&self) -> bool {
        is_leaf(self.rank, self.world_size)
    }

    pub fn depth(&self) -> u32 {
        depth(self.rank)
    }
}

/// Render the tree as an indented outline, one rank per line
pub fn render(world_size: usize) -> String {
    fn walk(rank: Rank, world_size: usize, out: &mut String) {
        let indent = "  ".repeat(depth(rank) as usize);
        out.push_str(&format!("{}{}\n", indent, rank));
        for child in children(rank, world_size) {
            walk(child, world_size, out);
        }
    }

    let mut out = String::new();
    if world_size > 0 {
        walk(ROOT, world_size, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_seven_node_tree() {
        assert_eq!(children(0, 7), vec![1, 2]);
        assert_eq!(children(1, 7), vec![3, 4]);
        assert_eq!(children(2, 7), vec![5, 6]);
        for rank in 3..7 {
            assert!(children(rank, 7).is_empty(), "rank {} should be a leaf", rank);
        }
    }

    #[test]
    fn test_root_is_its_own_parent() {
        assert_eq!(parent(0), 0);
        assert!(is_root(0));
        assert!(!is_root(1));
    }

    #[test]
    fn test_parents() {
        assert_eq!(parent(1), 0);
        assert_eq!(parent(2), 0);
        assert_eq!(parent(5), 2);
        assert_eq!(parent(6), 2);
    }

    #[test]
    fn test_single_participant_has_no_children() {
        assert!(children(0, 1).is_empty());
        assert!(children(0, 0).is_empty());
    }

    #[test]
    fn test_partial_last_level() {
        assert_eq!(children(0, 2), vec![1]);
        assert_eq!(children(1, 4), vec![3]);
        assert!(children(2, 4).is_empty());
    }

    #[test]
    fn test_depth() {
        assert_eq!(depth(0), 0);
        assert_eq!(depth(1), 1);
        assert_eq!(depth(2), 1);
        assert_eq!(depth(3), 2);
        assert_eq!(depth(6), 2);
        assert_eq!(depth(7), 3);
    }

    #[test]
    fn test_subtree_size() {
        assert_eq!(subtree_size(0, 7), 7);
        assert_eq!(subtree_size(1, 7), 3);
        assert_eq!(subtree_size(1, 5), 3);
        assert_eq!(subtree_size(2, 5), 1);
        assert_eq!(subtree_size(3, 5), 1);
        assert_eq!(subtree_size(7, 5), 0);
    }

    #[test]
    fn test_topology_view() {
        assert!(Topology::new(7, 7).is_none());

        let view = Topology::new(2, 7).unwrap();
        assert_eq!(view.parent(), 0);
        assert_eq!(view.children(), vec![5, 6]);
        assert!(!view.is_root());
        assert!(!view.is_leaf());
        assert_eq!(view.depth(), 1);
    }

    #[test]
    fn test_render() {
        assert_eq!(render(4), "0\n  1\n    3\n  2\n");
        assert_eq!(render(0), "");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn children_point_back_to_parent(world_size in 1usize..512) {
            for rank in 0..world_size {
                let kids = children(rank, world_size);
                prop_assert!(kids.len() <= 2);
                for child in kids {
                    prop_assert!(child == 2 * rank + 1 || child == 2 * rank + 2);
                    prop_assert!(child < world_size);
                    prop_assert_eq!(parent(child), rank);
                }
            }
        }

        #[test]
        fn every_rank_reaches_root_without_cycles(world_size in 1usize..512) {
            for rank in 0..world_size {
                let mut current = rank;
                let mut steps = 0u32;
                while current != ROOT {
                    let next = parent(current);
                    prop_assert!(next < current);
                    current = next;
                    steps += 1;
                }
                prop_assert_eq!(steps, depth(rank));
            }
        }

        #[test]
        fn every_non_root_is_some_parents_child(world_size in 1usize..512) {
            let mut seen = vec![false; world_size];
            for rank in 0..world_size {
                for child in children(rank, world_size) {
                    prop_assert!(!seen[child], "rank {} has two parents", child);
                    seen[child] = true;
                }
            }
            prop_assert!(!seen[ROOT]);
            prop_assert!(seen.iter().skip(1).all(|s| *s));
            prop_assert_eq!(subtree_size(ROOT, world_size), world_size);
        }
    }
}
