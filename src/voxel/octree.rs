//! Arena-backed chunk octree.
//!
//! Roots live at level `max_depth` and are created explicitly (by the LOD
//! planner or by tools). Below a root, nodes exist only on the path to a
//! chunk slot; removing a slot prunes branches that became empty.

use std::collections::HashMap;
use std::sync::Arc;

use glam::IVec3;

use crate::voxel::chunk::ChunkKey;
use crate::voxel::chunk_handle::ChunkHandle;

/// Index into the node arena
pub type NodeId = u32;

#[derive(Debug)]
struct Node {
    key: ChunkKey,
    children: [Option<NodeId>; 8],
    chunk: Option<Arc<ChunkHandle>>,
}

impl Node {
    fn new(key: ChunkKey) -> Self {
        Self { key, children: [None; 8], chunk: None }
    }

    fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }
}

/// Sparse octree of chunk slots.
pub struct ChunkOctree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    roots: HashMap<IVec3, NodeId>,
    max_depth: u8,
    chunk_count: usize,
}

impl std::fmt::Debug for ChunkOctree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkOctree")
            .field("roots", &self.roots.len())
            .field("nodes", &self.node_count())
            .field("chunks", &self.chunk_count)
            .finish()
    }
}

impl ChunkOctree {
    pub fn new(max_depth: u8) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            roots: HashMap::new(),
            max_depth,
            chunk_count: 0,
        }
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    /// Live nodes in the arena
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of chunk slots
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    fn alloc(&mut self, key: ChunkKey) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = Some(Node::new(key));
                id
            }
            None => {
                self.nodes.push(Some(Node::new(key)));
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id as usize] = None;
        self.free.push(id);
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Create the root covering root coordinate `coord`. Returns true if new.
    pub fn ensure_root(&mut self, coord: IVec3) -> bool {
        if self.roots.contains_key(&coord) {
            return false;
        }
        let id = self.alloc(ChunkKey::new(coord, self.max_depth));
        self.roots.insert(coord, id);
        true
    }

    pub fn has_root(&self, coord: IVec3) -> bool {
        self.roots.contains_key(&coord)
    }

    /// Root coordinate above `key`
    pub fn root_of(&self, key: ChunkKey) -> IVec3 {
        key.ancestor(self.max_depth).coord
    }

    /// Check if `key` lies under an existing root
    pub fn covers(&self, key: ChunkKey) -> bool {
        key.lod <= self.max_depth && self.has_root(self.root_of(key))
    }

    pub fn roots(&self) -> impl Iterator<Item = IVec3> + '_ {
        self.roots.keys().copied()
    }

    /// Drop a root and every slot below it. Returns the removed handles.
    pub fn remove_root(&mut self, coord: IVec3) -> Vec<Arc<ChunkHandle>> {
        let mut removed = Vec::new();
        let Some(root) = self.roots.remove(&coord) else {
            return removed;
        };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(id as usize).and_then(Option::take) {
                stack.extend(node.children.iter().flatten());
                if let Some(handle) = node.chunk {
                    removed.push(handle);
                }
                self.free.push(id);
            }
        }
        self.chunk_count -= removed.len();
        removed
    }

    /// Path of node ids from the root to `key`, stopping where it ends.
    fn descend(&self, key: ChunkKey) -> Option<NodeId> {
        if key.lod > self.max_depth {
            return None;
        }
        let mut id = *self.roots.get(&self.root_of(key))?;
        for lod in (key.lod..self.max_depth).rev() {
            let child = key.ancestor(lod).child_index();
            id = self.node(id)?.children[child]?;
        }
        Some(id)
    }

    /// Slot at `key`, if one exists.
    pub fn get(&self, key: ChunkKey) -> Option<Arc<ChunkHandle>> {
        let id = self.descend(key)?;
        self.node(id)?.chunk.clone()
    }

    pub fn contains(&self, key: ChunkKey) -> bool {
        self.get(key).is_some()
    }

    /// Slot at `key`, creating nodes and the slot as needed.
    ///
    /// Returns `None` if `key` is not under an existing root. The flag is
    /// true when the slot was created by this call.
    pub fn get_or_insert(&mut self, key: ChunkKey) -> Option<(Arc<ChunkHandle>, bool)> {
        if !self.covers(key) {
            return None;
        }
        let mut id = *self.roots.get(&self.root_of(key))?;
        for lod in (key.lod..self.max_depth).rev() {
            let child_key = key.ancestor(lod);
            let slot = child_key.child_index();
            let existing = self.node(id)?.children[slot];
            id = match existing {
                Some(child) => child,
                None => {
                    let child = self.alloc(child_key);
                    self.node_mut(id)?.children[slot] = Some(child);
                    child
                }
            };
        }
        let node = self.node_mut(id)?;
        if let Some(handle) = &node.chunk {
            return Some((Arc::clone(handle), false));
        }
        let handle = Arc::new(ChunkHandle::new(key));
        node.chunk = Some(Arc::clone(&handle));
        self.chunk_count += 1;
        Some((handle, true))
    }

    /// Replace the slot at `key` with `handle` (used by resync installs).
    pub fn insert_handle(&mut self, handle: Arc<ChunkHandle>) -> Option<Arc<ChunkHandle>> {
        let key = handle.key;
        self.get_or_insert(key)?;
        let id = self.descend(key)?;
        let node = self.node_mut(id)?;
        node.chunk.replace(handle)
    }

    /// Remove the slot at `key` and prune empty branches (roots stay).
    pub fn remove(&mut self, key: ChunkKey) -> Option<Arc<ChunkHandle>> {
        if !self.covers(key) {
            return None;
        }
        let mut path = vec![*self.roots.get(&self.root_of(key))?];
        for lod in (key.lod..self.max_depth).rev() {
            let child = key.ancestor(lod).child_index();
            let last = *path.last()?;
            path.push(self.node(last)?.children[child]?);
        }
        let target = *path.last()?;
        let handle = self.node_mut(target)?.chunk.take()?;
        self.chunk_count -= 1;

        // Walk back up, freeing nodes that hold nothing.
        while path.len() > 1 {
            let id = *path.last()?;
            let node = self.node(id)?;
            if node.chunk.is_some() || !node.is_leaf() {
                break;
            }
            let slot = node.key.child_index();
            path.pop();
            self.release(id);
            let parent = *path.last()?;
            self.node_mut(parent)?.children[slot] = None;
        }
        Some(handle)
    }

    /// Keys of the existing child slots of `key`.
    pub fn children(&self, key: ChunkKey) -> Vec<ChunkKey> {
        let Some(node) = self.descend(key).and_then(|id| self.node(id)) else {
            return Vec::new();
        };
        node.children
            .iter()
            .flatten()
            .filter_map(|&c| self.node(c))
            .map(|n| n.key)
            .collect()
    }

    /// Every chunk slot, in no particular order.
    pub fn handles(&self) -> Vec<Arc<ChunkHandle>> {
        self.nodes
            .iter()
            .flatten()
            .filter_map(|n| n.chunk.clone())
            .collect()
    }

    /// Slots whose key intersects the half-open voxel box `[min, max)`, at LOD
    /// `lod` only.
    pub fn handles_in_box(&self, min: IVec3, max: IVec3, lod: u8, chunk_size: u32) -> Vec<Arc<ChunkHandle>> {
        let lo = ChunkKey::containing(min, lod, chunk_size).coord;
        let hi = ChunkKey::containing(max - IVec3::ONE, lod, chunk_size).coord;
        let mut out = Vec::new();
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    if let Some(h) = self.get(ChunkKey::new(IVec3::new(x, y, z), lod)) {
                        out.push(h);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_requires_root() {
        let mut tree = ChunkOctree::new(2);
        assert!(tree.get_or_insert(ChunkKey::at(0, 0, 0, 0)).is_none());
        assert!(tree.ensure_root(IVec3::ZERO));
        assert!(!tree.ensure_root(IVec3::ZERO));
        let (_, created) = tree.get_or_insert(ChunkKey::at(3, 1, 2, 0)).unwrap();
        assert!(created);
        let (_, created) = tree.get_or_insert(ChunkKey::at(3, 1, 2, 0)).unwrap();
        assert!(!created);
        assert_eq!(tree.chunk_count(), 1);
        // Key beyond the root's reach
        assert!(tree.get_or_insert(ChunkKey::at(4, 0, 0, 0)).is_none());
    }

    #[test]
    fn test_negative_root() {
        let mut tree = ChunkOctree::new(1);
        tree.ensure_root(IVec3::new(-1, 0, 0));
        assert!(tree.covers(ChunkKey::at(-1, 0, 0, 0)));
        assert!(tree.covers(ChunkKey::at(-2, 1, 1, 0)));
        assert!(!tree.covers(ChunkKey::at(0, 0, 0, 0)));
    }

    #[test]
    fn test_remove_prunes_branch() {
        let mut tree = ChunkOctree::new(3);
        tree.ensure_root(IVec3::ZERO);
        let nodes_before = tree.node_count();
        tree.get_or_insert(ChunkKey::at(5, 5, 5, 0));
        assert_eq!(tree.node_count(), nodes_before + 3);
        assert!(tree.remove(ChunkKey::at(5, 5, 5, 0)).is_some());
        assert_eq!(tree.node_count(), nodes_before);
        assert_eq!(tree.chunk_count(), 0);
        assert!(tree.remove(ChunkKey::at(5, 5, 5, 0)).is_none());
    }

    #[test]
    fn test_remove_keeps_shared_path() {
        let mut tree = ChunkOctree::new(2);
        tree.ensure_root(IVec3::ZERO);
        tree.get_or_insert(ChunkKey::at(0, 0, 0, 1));
        tree.get_or_insert(ChunkKey::at(0, 0, 0, 0));
        tree.get_or_insert(ChunkKey::at(1, 0, 0, 0));
        tree.remove(ChunkKey::at(0, 0, 0, 0));
        assert!(tree.contains(ChunkKey::at(1, 0, 0, 0)));
        assert!(tree.contains(ChunkKey::at(0, 0, 0, 1)));
        assert_eq!(tree.children(ChunkKey::at(0, 0, 0, 1)), vec![ChunkKey::at(1, 0, 0, 0)]);
    }

    #[test]
    fn test_free_list_reuse() {
        let mut tree = ChunkOctree::new(1);
        tree.ensure_root(IVec3::ZERO);
        tree.get_or_insert(ChunkKey::at(1, 1, 1, 0));
        tree.remove(ChunkKey::at(1, 1, 1, 0));
        let arena = tree.nodes.len();
        tree.get_or_insert(ChunkKey::at(0, 1, 0, 0));
        assert_eq!(tree.nodes.len(), arena);
    }

    #[test]
    fn test_remove_root_returns_handles() {
        let mut tree = ChunkOctree::new(1);
        tree.ensure_root(IVec3::ZERO);
        tree.get_or_insert(ChunkKey::at(0, 0, 0, 1));
        tree.get_or_insert(ChunkKey::at(1, 0, 0, 0));
        assert_eq!(tree.remove_root(IVec3::ZERO).len(), 2);
        assert_eq!(tree.node_count(), 0);
        assert_eq!(tree.chunk_count(), 0);
    }

    #[test]
    fn test_handles_in_box() {
        let mut tree = ChunkOctree::new(1);
        tree.ensure_root(IVec3::ZERO);
        tree.get_or_insert(ChunkKey::at(0, 0, 0, 0));
        tree.get_or_insert(ChunkKey::at(1, 0, 0, 0));
        let found = tree.handles_in_box(IVec3::new(10, 0, 0), IVec3::new(20, 4, 4), 0, 16);
        assert_eq!(found.len(), 2);
        let found = tree.handles_in_box(IVec3::ZERO, IVec3::splat(4), 0, 16);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_nodes_with_slots_format() {
        let mut tree = ChunkOctree::new(1);
        tree.ensure_root(IVec3::ZERO);
        tree.get_or_insert(ChunkKey::at(0, 0, 0, 1));
        let root = tree.roots[&IVec3::ZERO];
        let text = format!("{:?}", tree.node(root).unwrap());
        assert!(text.contains("ChunkHandle"));
        assert!(format!("{:?}", tree).contains("chunks: 1"));
    }
}
