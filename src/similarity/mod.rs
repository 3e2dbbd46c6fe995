//! In-memory perceptual similarity index.
//!
//! A BK-tree keyed on Hamming distance over the 256-bit gradient hash.
//! Lookup prunes subtrees outside the triangle-inequality window, so a
//! threshold query touches a small fraction of the archive instead of
//! scanning every fingerprint.

use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::info;

use crate::error::Result;
use crate::identity::{hamming_bits, ApproxFingerprint};
use crate::store::Database;

#[derive(Debug)]
struct Node {
    bits: Vec<u8>,
    record_id: i64,
    group_id: Option<i64>,
    children: BTreeMap<u32, Node>,
}

#[derive(Debug, Default)]
struct BkTree {
    root: Option<Node>,
    len: usize,
}

/// A record within the query threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub record_id: i64,
    pub group_id: Option<i64>,
    pub distance: u32,
}

impl BkTree {
    fn insert(&mut self, bits: Vec<u8>, record_id: i64, group_id: Option<i64>) {
        self.len += 1;
        let mut current = match self.root.as_mut() {
            None => {
                self.root = Some(Node { bits, record_id, group_id, children: BTreeMap::new() });
                return;
            }
            Some(root) => root,
        };

        loop {
            let distance = hamming_bits(&current.bits, &bits);
            match current.children.entry(distance) {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(Node { bits, record_id, group_id, children: BTreeMap::new() });
                    return;
                }
                std::collections::btree_map::Entry::Occupied(slot) => {
                    current = slot.into_mut();
                }
            }
        }
    }

    fn find_within(&self, bits: &[u8], threshold: u32) -> Vec<Neighbor> {
        let mut matches = Vec::new();
        let mut stack: Vec<&Node> = self.root.iter().collect();

        while let Some(node) = stack.pop() {
            let distance = hamming_bits(&node.bits, bits);
            if distance <= threshold {
                matches.push(Neighbor {
                    record_id: node.record_id,
                    group_id: node.group_id,
                    distance,
                });
            }
            let low = distance.saturating_sub(threshold);
            let high = distance.saturating_add(threshold);
            for (_, child) in node.children.range(low..=high) {
                stack.push(child);
            }
        }
        matches
    }

    fn retarget_group(&mut self, from: i64, to: i64) {
        let mut stack: Vec<&mut Node> = self.root.iter_mut().collect();
        while let Some(node) = stack.pop() {
            if node.group_id == Some(from) {
                node.group_id = Some(to);
            }
            stack.extend(node.children.values_mut());
        }
    }
}

pub struct SimilarityIndex {
    tree: RwLock<BkTree>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self { tree: RwLock::new(BkTree::default()) }
    }

    /// Rebuilds the index from every live fingerprint in the store. Run at
    /// startup; afterwards the index is maintained incrementally.
    pub fn rebuild_from(db: &Database) -> Result<Self> {
        let index = Self::new();
        let fingerprints = db.approx_fingerprints()?;
        {
            let mut tree = index.write();
            for (record_id, base64, group_id) in &fingerprints {
                let fp = ApproxFingerprint::from_base64(base64)?;
                tree.insert(fp.bits()?, *record_id, *group_id);
            }
        }
        info!(count = fingerprints.len(), "similarity index rebuilt");
        Ok(index)
    }

    pub fn insert(
        &self,
        fingerprint: &ApproxFingerprint,
        record_id: i64,
        group_id: Option<i64>,
    ) -> Result<()> {
        let bits = fingerprint.bits()?;
        self.write().insert(bits, record_id, group_id);
        Ok(())
    }

    /// All records within `threshold` of the fingerprint, nearest first.
    pub fn find_neighbors(
        &self,
        fingerprint: &ApproxFingerprint,
        threshold: u32,
    ) -> Result<Vec<Neighbor>> {
        let bits = fingerprint.bits()?;
        let mut neighbors = self.read().find_within(&bits, threshold);
        neighbors.sort_by_key(|n| (n.distance, n.record_id));
        Ok(neighbors)
    }

    /// The distinct groups among neighbors, each with its closest distance.
    pub fn find_groups(
        &self,
        fingerprint: &ApproxFingerprint,
        threshold: u32,
    ) -> Result<Vec<(i64, u32)>> {
        let neighbors = self.find_neighbors(fingerprint, threshold)?;
        let mut groups: BTreeMap<i64, u32> = BTreeMap::new();
        for neighbor in neighbors {
            if let Some(group_id) = neighbor.group_id {
                let entry = groups.entry(group_id).or_insert(neighbor.distance);
                if neighbor.distance < *entry {
                    *entry = neighbor.distance;
                }
            }
        }
        Ok(groups.into_iter().collect())
    }

    /// Points every entry of an absorbed group at the surviving group after
    /// a union.
    pub fn retarget_group(&self, from: i64, to: i64) {
        self.write().retarget_group(from, to);
    }

    pub fn len(&self) -> usize {
        self.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BkTree> {
        self.tree
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BkTree> {
        self.tree
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}
