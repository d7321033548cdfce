//! Octree index over the bricks of a partition
//!
//! Exported with the brick metadata; the apportioner never consults it.

use crate::partition::PartitionResult;
use crate::types::Brick;
use crate::utils::next_pow2;
use serde::{Deserialize, Serialize};

/// One cubic node of the brick octree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OctNode {
    /// Minimum corner, in voxels
    pub origin: [u32; 3],
    /// Edge length, in voxels
    pub width: u32,
    /// Either empty (leaf) or exactly 8 children
    pub children: Vec<OctNode>,
    /// Brick ids routed to this leaf
    pub bricks: Vec<usize>,
}

/// JSON form of a node: `{"Children": [...]}` or `{"Value": id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OctreeJson {
    Children(Vec<OctreeJson>),
    Value(i64),
}

impl OctNode {
    fn new(origin: [u32; 3], width: u32) -> Self {
        Self {
            origin,
            width,
            children: Vec::new(),
            bricks: Vec::new(),
        }
    }

    /// Build the index over a partition
    ///
    /// The root spans the padded volume rounded up to a power of two. Nodes
    /// holding bricks split until they reach the smallest brick size produced.
    pub fn build(partition: &PartitionResult) -> Self {
        let padded = partition.padded_dims();
        let mut root = Self::new([0, 0, 0], next_pow2(padded.max_extent()));
        let ids: Vec<usize> = (0..partition.bricks.len()).collect();
        root.route(&partition.bricks, ids, partition.smallest_brick_size());
        root
    }

    fn route(&mut self, bricks: &[Brick], ids: Vec<usize>, leaf_width: u32) {
        if self.width <= leaf_width || ids.is_empty() {
            self.bricks = ids;
            return;
        }

        let half = self.width / 2;
        let mut buckets: [Vec<usize>; 8] = Default::default();
        for id in ids {
            buckets[self.child_index(bricks[id].position)].push(id);
        }

        self.children = buckets
            .into_iter()
            .enumerate()
            .map(|(octant, ids)| {
                let mut child = Self::new(self.child_origin(octant, half), half);
                child.route(bricks, ids, leaf_width);
                child
            })
            .collect();
    }

    fn child_origin(&self, octant: usize, half: u32) -> [u32; 3] {
        [
            self.origin[0] + (octant & 1) as u32 * half,
            self.origin[1] + ((octant >> 1) & 1) as u32 * half,
            self.origin[2] + ((octant >> 2) & 1) as u32 * half,
        ]
    }

    /// Octant of `position`: bit 0 = +X, bit 1 = +Y, bit 2 = +Z
    pub fn child_index(&self, position: [u32; 3]) -> usize {
        let half = self.width / 2;
        let mid = [
            self.origin[0] + half,
            self.origin[1] + half,
            self.origin[2] + half,
        ];
        (position[0] >= mid[0]) as usize
            | ((position[1] >= mid[1]) as usize) << 1
            | ((position[2] >= mid[2]) as usize) << 2
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn contains(&self, position: [u32; 3]) -> bool {
        (0..3).all(|i| position[i] >= self.origin[i] && position[i] - self.origin[i] < self.width)
    }

    /// Leaf whose bounds contain `position`
    pub fn leaf_for(&self, position: [u32; 3]) -> Option<&OctNode> {
        if !self.contains(position) {
            return None;
        }
        let mut node = self;
        while !node.is_leaf() {
            node = &node.children[node.child_index(position)];
        }
        Some(node)
    }

    /// Every node in the tree, this one included
    pub fn total_nodes(&self) -> usize {
        1 + self.children.iter().map(OctNode::total_nodes).sum::<usize>()
    }

    pub fn leaf_count(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            self.children.iter().map(OctNode::leaf_count).sum()
        }
    }

    /// Levels below this node (0 for a leaf)
    pub fn depth(&self) -> usize {
        self.children
            .iter()
            .map(|c| c.depth() + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn to_json(&self) -> OctreeJson {
        if self.is_leaf() {
            OctreeJson::Value(self.bricks.first().map_or(-1, |&id| id as i64))
        } else {
            OctreeJson::Children(self.children.iter().map(OctNode::to_json).collect())
        }
    }

    fn collect_leaf_bricks(&self, out: &mut Vec<usize>) {
        if self.is_leaf() {
            out.extend_from_slice(&self.bricks);
        } else {
            for child in &self.children {
                child.collect_leaf_bricks(out);
            }
        }
    }

    /// Brick ids in leaf order
    pub fn leaf_bricks(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_leaf_bricks(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ComputeContext;
    use crate::partition::partition_volume;
    use crate::types::Dims3;

    fn build(dims: Dims3, min: u32, max: u32) -> (PartitionResult, OctNode) {
        let ctx = ComputeContext::new(2).unwrap();
        let partition = partition_volume(&ctx, dims, min, max).unwrap();
        let tree = OctNode::build(&partition);
        (partition, tree)
    }

    fn assert_children_tile(node: &OctNode) {
        if node.is_leaf() {
            return;
        }
        assert_eq!(node.children.len(), 8);
        let half = node.width / 2;
        let mut origins: Vec<[u32; 3]> = node.children.iter().map(|c| c.origin).collect();
        origins.sort();
        origins.dedup();
        assert_eq!(origins.len(), 8);
        for child in &node.children {
            assert_eq!(child.width, half);
            assert!(node.contains(child.origin));
            assert_children_tile(child);
        }
    }

    #[test]
    fn test_single_brick_is_root_leaf() {
        let (_, tree) = build(Dims3::new(512, 512, 512), 512, 512);
        assert!(tree.is_leaf());
        assert_eq!(tree.width, 512);
        assert_eq!(tree.total_nodes(), 1);
        assert_eq!(tree.to_json(), OctreeJson::Value(0));
    }

    #[test]
    fn test_wide_volume() {
        let (_, tree) = build(Dims3::new(1024, 512, 512), 64, 512);
        assert_eq!(tree.width, 1024);
        assert_eq!(tree.total_nodes(), 9);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.children[0].bricks, vec![0]);
        assert_eq!(tree.children[1].bricks, vec![1]);
        assert!(tree.children[2..].iter().all(|c| c.bricks.is_empty()));
    }

    #[test]
    fn test_every_brick_in_one_leaf() {
        let (partition, tree) = build(Dims3::new(300, 200, 100), 16, 128);
        assert_children_tile(&tree);

        let mut seen = tree.leaf_bricks();
        seen.sort();
        assert_eq!(seen, (0..partition.brick_count()).collect::<Vec<_>>());

        for (id, brick) in partition.bricks.iter().enumerate() {
            let leaf = tree.leaf_for(brick.position).unwrap();
            assert_eq!(leaf.bricks, vec![id]);
            assert_eq!(leaf.origin, brick.position);
        }
    }

    #[test]
    fn test_json_shape() {
        let (_, tree) = build(Dims3::new(32, 32, 48), 16, 32);
        let json = serde_json::to_value(tree.to_json()).unwrap();
        let children = json["Children"].as_array().unwrap();
        assert_eq!(children.len(), 8);
        // Octant 0 holds the 32-brick split down to 16-wide leaves
        assert_eq!(children[0]["Children"][0]["Value"], 0);
        assert_eq!(children[0]["Children"][1]["Value"], -1);
        assert_eq!(children[4]["Children"][0]["Value"], 1);
        assert_eq!(children[1]["Value"], -1);
    }

    #[test]
    fn test_leaf_for_outside() {
        let (_, tree) = build(Dims3::new(64, 64, 64), 32, 64);
        assert!(tree.leaf_for([64, 0, 0]).is_none());
        assert!(tree.leaf_for([63, 63, 63]).is_some());
        assert_eq!(tree.leaf_count(), 1);
    }
}
