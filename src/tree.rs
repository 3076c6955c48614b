//! Tree-geometry cache (C1, §4.1).
//!
//! Computes and memoizes, per `(kind, root)`, the local view (parent / child_id / children) of a
//! distributed tree rooted at `root`. Shared by every tree-based algorithm variant in
//! [`crate::algo`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{fatal, FatalError};

/// The four required tree shapes (§4.1). Pipelined variants (`TreePutPipe`/`TreeGetPipe`) are
/// explicitly out of the required set per §9 and are not modeled here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TreeKind {
    Chain,
    Binary,
    Binomial,
    Sequential,
}

/// A local view of a tree rooted at `root`, computed relative to `my_rank`.
pub struct TreeGeometry {
    pub kind: TreeKind,
    pub root: u32,
    pub my_rank: u32,
    pub nranks: u32,
    /// Actual (not relative) parent rank, or `None` at the root.
    pub parent: Option<u32>,
    /// This rank's index within its parent's child list, or `None` at the root.
    pub child_id: Option<u32>,
    /// Actual (not relative) child ranks, in order.
    pub children: Vec<u32>,
    refcount: Mutex<u32>,
}

impl TreeGeometry {
    /// Current reference count: the number of tree-data records pointing at this geometry (I4).
    pub fn refcount(&self) -> u32 {
        *self.refcount.lock()
    }
}

/// Map a relative rank back to an absolute rank, wrapping modulo `n`.
fn rel_to_abs(root: u32, rel: i64, n: u32) -> u32 {
    (((root as i64 + rel) % n as i64 + n as i64) % n as i64) as u32
}

fn compute(kind: TreeKind, root: u32, my_rank: u32, n: u32) -> TreeGeometry {
    let r = (((my_rank as i64 - root as i64) % n as i64) + n as i64) % n as i64;
    let (parent, child_id, children) = match kind {
        TreeKind::Chain => {
            let parent = if r == 0 {
                None
            } else {
                Some(rel_to_abs(root, r - 1, n))
            };
            let children = if r < n as i64 - 1 {
                vec![rel_to_abs(root, r + 1, n)]
            } else {
                vec![]
            };
            let child_id = if parent.is_some() { Some(0) } else { None };
            (parent, child_id, children)
        }
        TreeKind::Binary => {
            // level L such that 2^L - 1 <= r < 2^(L+1) - 1
            let mut level = 0i64;
            while (1i64 << (level + 1)) - 1 <= r {
                level += 1;
            }
            let parent = if r == 0 {
                None
            } else {
                let p = (r - ((1 << level) - 1)) / 2 + (1 << (level - 1)) - 1;
                Some(rel_to_abs(root, p, n))
            };
            let left = (r - ((1 << level) - 1)) * 2 + (1 << (level + 1)) - 1;
            let mut children = Vec::new();
            if left < n as i64 {
                children.push(rel_to_abs(root, left, n));
            }
            if left + 1 < n as i64 {
                children.push(rel_to_abs(root, left + 1, n));
            }
            let child_id = if parent.is_some() {
                Some(((r + 1) % 2) as u32)
            } else {
                None
            };
            (parent, child_id, children)
        }
        TreeKind::Binomial => {
            if r == 0 {
                // Root: children are every power-of-two distance, largest first, each
                // doubling covering the remaining half of the relative range.
                let mut children = Vec::new();
                let mut d = 1i64;
                while d < n as i64 {
                    d <<= 1;
                }
                d >>= 1;
                while d >= 1 {
                    if d < n as i64 {
                        children.push(rel_to_abs(root, d, n));
                    }
                    d /= 2;
                }
                children.sort_unstable();
                children.dedup();
                (None, None, children)
            } else {
                let d = r & (-r); // lowest set bit of r
                let parent_rel = r - d;
                let parent = Some(rel_to_abs(root, parent_rel, n));
                let mut children = Vec::new();
                let mut dd = d / 2;
                while dd >= 1 {
                    children.push(rel_to_abs(root, r + dd, n));
                    dd /= 2;
                }
                let child_id = Some(((d as f64).log2()) as u32);
                (parent, child_id, children)
            }
        }
        TreeKind::Sequential => {
            if r == 0 {
                let children = (1..n as i64).map(|x| rel_to_abs(root, x, n)).collect();
                (None, None, children)
            } else {
                (Some(root), Some((r - 1) as u32), vec![])
            }
        }
    };
    TreeGeometry {
        kind,
        root,
        my_rank,
        nranks: n,
        parent,
        child_id,
        children,
        refcount: Mutex::new(0),
    }
}

/// The process-wide tree-geometry cache.
///
/// Keyed by `(kind, root)`. This implementation keeps every live geometry in an unbounded map
/// rather than the single-slot MRU cache §4.1 describes as the *minimum* compliant
/// implementation — identical subsequent requests with no intervening `tree_free` still return
/// the same `Arc` with its refcount incremented, which is the only externally observable
/// requirement (I4); a richer cache is a strict superset of that contract.
pub struct TreeCache {
    my_rank: u32,
    nranks: u32,
    entries: Mutex<HashMap<(TreeKind, u32), Arc<TreeGeometry>>>,
}

impl TreeCache {
    pub fn new(my_rank: u32, nranks: u32) -> TreeCache {
        TreeCache {
            my_rank,
            nranks,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up or compute the geometry for `(kind, root)`, incrementing its refcount.
    ///
    /// Fatal for an unknown root (out of `[0, nranks)`); `kind` is a closed enum so "unknown
    /// kind" can't arise through this API, unlike the original C enum (§4.1's stated failure
    /// mode is preserved for callers that plumb a raw kind tag through [`crate::dispatch`]).
    pub fn tree_init(&self, kind: TreeKind, root: u32) -> Arc<TreeGeometry> {
        if root >= self.nranks {
            fatal(FatalError::UnknownTreeKind);
        }
        let mut entries = self.entries.lock();
        let geom = entries
            .entry((kind, root))
            .or_insert_with(|| Arc::new(compute(kind, root, self.my_rank, self.nranks)))
            .clone();
        *geom.refcount.lock() += 1;
        geom
    }

    /// Release a reference obtained from [`TreeCache::tree_init`]. Drops the cache entry once the
    /// refcount reaches zero (I4).
    pub fn tree_free(&self, geom: &Arc<TreeGeometry>) {
        let mut count = geom.refcount.lock();
        debug_assert!(*count > 0, "tree_free called more often than tree_init");
        *count -= 1;
        let reached_zero = *count == 0;
        drop(count);
        if reached_zero {
            let mut entries = self.entries.lock();
            if let Some(cached) = entries.get(&(geom.kind, geom.root)) {
                if Arc::ptr_eq(cached, geom) {
                    entries.remove(&(geom.kind, geom.root));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_geometry() {
        let g = compute(TreeKind::Chain, 0, 2, 5);
        assert_eq!(g.parent, Some(1));
        assert_eq!(g.children, vec![3]);
    }

    #[test]
    fn binary_geometry_root_has_two_children() {
        let g = compute(TreeKind::Binary, 0, 0, 7);
        assert_eq!(g.parent, None);
        assert_eq!(g.children, vec![1, 2]);
    }

    #[test]
    fn binary_geometry_leaf_has_no_children() {
        let g = compute(TreeKind::Binary, 0, 6, 7);
        assert!(g.children.is_empty());
        assert_eq!(g.parent, Some(2));
    }

    #[test]
    fn binomial_root_reaches_every_other_rank() {
        let g = compute(TreeKind::Binomial, 0, 0, 8);
        let mut seen: Vec<u32> = g.children.clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 4]);
    }

    #[test]
    fn sequential_root_has_all_others_as_children() {
        let g = compute(TreeKind::Sequential, 0, 0, 4);
        assert_eq!(g.children, vec![1, 2, 3]);
        let leaf = compute(TreeKind::Sequential, 0, 2, 4);
        assert_eq!(leaf.parent, Some(0));
    }

    #[test]
    fn refcount_closure_after_n_inits_and_m_frees() {
        let cache = TreeCache::new(0, 4);
        let a = cache.tree_init(TreeKind::Chain, 0);
        let b = cache.tree_init(TreeKind::Chain, 0);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
        cache.tree_free(&a);
        assert_eq!(b.refcount(), 1);
        cache.tree_free(&b);
        // Now freed down to zero: a fresh init recomputes a brand new geometry.
        let c = cache.tree_init(TreeKind::Chain, 0);
        assert_eq!(c.refcount(), 1);
    }

    #[test]
    #[should_panic]
    fn unknown_root_is_fatal() {
        let cache = TreeCache::new(0, 4);
        cache.tree_init(TreeKind::Chain, 99);
    }
}
