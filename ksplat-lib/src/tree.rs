use crate::buffer::SplatBuffer;
use glam::Vec3;
use log::{debug, info};
use std::time::Instant;

pub const DEFAULT_MAX_TREE_DEPTH: u32 = 8;
pub const DEFAULT_MAX_POSITIONS_PER_NODE: usize = 5000;

/// Octant sign per axis, upper half (`y >= center.y`) first, each half walked
/// -x-z, +x-z, +x+z, -x+z.
const OCTANT_SIGNS: [[f32; 3]; 8] = [
    [-1.0, 1.0, -1.0],
    [1.0, 1.0, -1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, -1.0, 1.0],
    [-1.0, -1.0, 1.0],
];

#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    pub max_depth: u32,
    pub max_positions_per_node: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            max_depth: DEFAULT_MAX_TREE_DEPTH,
            max_positions_per_node: DEFAULT_MAX_POSITIONS_PER_NODE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SplatTreeNode {
    pub min: Vec3,
    pub max: Vec3,
    pub center: Vec3,
    pub depth: u32,
    /// Arena ids of the 8 children, empty for leaves.
    pub children: Vec<usize>,
    /// Splat indices owned by this leaf. Always empty for interior nodes.
    pub indexes: Vec<u32>,
}

impl SplatTreeNode {
    fn new(min: Vec3, max: Vec3, depth: u32) -> Self {
        SplatTreeNode {
            min,
            max,
            center: (max - min) * 0.5 + min,
            depth,
            children: Vec::new(),
            indexes: Vec::new(),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[inline]
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Length of the box diagonal.
    #[inline]
    pub fn size(&self) -> f32 {
        (self.max - self.min).length()
    }

    /// Child boxes reuse the parent's corners so their union covers it exactly.
    fn child_bounds(&self, octant: usize) -> (Vec3, Vec3) {
        let lower = Vec3::from_array(OCTANT_SIGNS[octant]).cmplt(Vec3::ZERO);
        (
            Vec3::select(lower, self.min, self.center),
            Vec3::select(lower, self.center, self.max),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TreeStats {
    pub node_count: usize,
    pub leaf_count: usize,
    pub populated_leaf_count: usize,
    pub max_splats_per_leaf: usize,
    pub average_splats_per_leaf: f32,
    pub max_leaf_depth: u32,
}

/// Octree over splat centers. Leaf index lists partition the kept splats.
#[derive(Debug, Clone)]
pub struct SplatTree {
    config: TreeConfig,
    nodes: Vec<SplatTreeNode>,
    /// Leaf ids in depth-first child order.
    leaf_ids: Vec<usize>,
    scene_min: Vec3,
    scene_max: Vec3,
}

struct TreeBuilder<'a> {
    config: TreeConfig,
    positions: &'a [Vec3],
    claimed: Vec<bool>,
    nodes: Vec<SplatTreeNode>,
    leaf_ids: Vec<usize>,
}

impl TreeBuilder<'_> {
    fn process_node(&mut self, id: usize, indexes: Vec<u32>) {
        let node = &self.nodes[id];
        let degenerate = node.min == node.max;
        if indexes.len() <= self.config.max_positions_per_node
            || node.depth >= self.config.max_depth
            || degenerate
        {
            let owned: Vec<u32> = indexes
                .into_iter()
                .filter(|&i| !std::mem::replace(&mut self.claimed[i as usize], true))
                .collect();
            self.nodes[id].indexes = owned;
            self.leaf_ids.push(id);
            return;
        }

        let mut child_indexes: [Vec<u32>; 8] = Default::default();
        let mut child_ids = Vec::with_capacity(8);
        for (octant, bucket) in child_indexes.iter_mut().enumerate() {
            let (min, max) = self.nodes[id].child_bounds(octant);
            let child = SplatTreeNode::new(min, max, self.nodes[id].depth + 1);
            // Inclusive containment, a point on a shared face lands in every such child.
            bucket.extend(
                indexes
                    .iter()
                    .copied()
                    .filter(|&i| child.contains_point(self.positions[i as usize])),
            );
            child_ids.push(self.nodes.len());
            self.nodes.push(child);
        }
        drop(indexes);
        self.nodes[id].children = child_ids.clone();

        for (child_id, bucket) in child_ids.into_iter().zip(child_indexes) {
            self.process_node(child_id, bucket);
        }
    }
}

impl SplatTree {
    /// Builds a tree over the splats for which `keep` returns true. Splats
    /// with a non-finite position are never kept.
    pub fn build(config: &TreeConfig, buffer: &SplatBuffer, keep: impl Fn(usize) -> bool) -> Self {
        let start = Instant::now();

        let mut flat = Vec::new();
        buffer.fill_positions(&mut flat);
        let positions: Vec<Vec3> = flat.chunks_exact(3).map(Vec3::from_slice).collect();

        let kept: Vec<u32> = (0..positions.len())
            .filter(|&i| positions[i].is_finite() && keep(i))
            .map(|i| i as u32)
            .collect();

        let (scene_min, scene_max) = if kept.is_empty() {
            (Vec3::ZERO, Vec3::ZERO)
        } else {
            kept.iter().fold(
                (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
                |(lo, hi), &i| (lo.min(positions[i as usize]), hi.max(positions[i as usize])),
            )
        };

        let mut builder = TreeBuilder {
            config: *config,
            positions: &positions,
            claimed: vec![false; positions.len()],
            nodes: vec![SplatTreeNode::new(scene_min, scene_max, 0)],
            leaf_ids: Vec::new(),
        };
        builder.process_node(0, kept);

        let tree = SplatTree {
            config: *config,
            nodes: builder.nodes,
            leaf_ids: builder.leaf_ids,
            scene_min,
            scene_max,
        };

        let stats = tree.stats();
        info!(
            "Splat tree built in {:.2} ms: {} leaves, {} with splats",
            start.elapsed().as_secs_f64() * 1000.0,
            stats.leaf_count,
            stats.populated_leaf_count
        );
        debug!(
            "Splat tree: avg {:.1} / max {} splats per populated leaf, {} nodes, depth {}",
            stats.average_splats_per_leaf,
            stats.max_splats_per_leaf,
            stats.node_count,
            stats.max_leaf_depth
        );
        tree
    }

    /// Keeps splats whose alpha is above `min_alpha`.
    pub fn build_visible(config: &TreeConfig, buffer: &SplatBuffer, min_alpha: u8) -> Self {
        let mut colors = Vec::new();
        buffer.fill_colors(&mut colors);
        Self::build(config, buffer, |i| colors[i * 4 + 3] > min_alpha)
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn root(&self) -> &SplatTreeNode {
        &self.nodes[0]
    }

    #[inline]
    pub fn node(&self, id: usize) -> &SplatTreeNode {
        &self.nodes[id]
    }

    pub fn scene_bounds(&self) -> (Vec3, Vec3) {
        (self.scene_min, self.scene_max)
    }

    #[inline]
    pub fn leaf_ids(&self) -> &[usize] {
        &self.leaf_ids
    }

    pub fn leaves(&self) -> impl Iterator<Item = &SplatTreeNode> + '_ {
        self.leaf_ids.iter().map(|&id| &self.nodes[id])
    }

    /// Calls `f` for each leaf in depth-first child order.
    pub fn visit_leaves(&self, mut f: impl FnMut(&SplatTreeNode)) {
        fn visit(nodes: &[SplatTreeNode], id: usize, f: &mut impl FnMut(&SplatTreeNode)) {
            let node = &nodes[id];
            if node.is_leaf() {
                f(node);
            }
            for &child in &node.children {
                visit(nodes, child, f);
            }
        }
        visit(&self.nodes, 0, &mut f);
    }

    pub fn count_leaves(&self) -> usize {
        let mut count = 0;
        self.visit_leaves(|_| count += 1);
        count
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            node_count: self.nodes.len(),
            ..Default::default()
        };
        let mut total = 0;
        for leaf in self.leaves() {
            stats.leaf_count += 1;
            stats.max_leaf_depth = stats.max_leaf_depth.max(leaf.depth);
            if !leaf.indexes.is_empty() {
                stats.populated_leaf_count += 1;
                stats.max_splats_per_leaf = stats.max_splats_per_leaf.max(leaf.indexes.len());
                total += leaf.indexes.len();
            }
        }
        if stats.populated_leaf_count > 0 {
            stats.average_splats_per_leaf = total as f32 / stats.populated_leaf_count as f32;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BucketTable;
    use crate::layout::CompressionLevel;

    fn buffer_with(positions: &[Vec3], alphas: &[u8]) -> SplatBuffer {
        let mut buffer =
            SplatBuffer::new(CompressionLevel::Full, positions.len(), BucketTable::default())
                .unwrap();
        for (i, (p, a)) in positions.iter().zip(alphas).enumerate() {
            buffer.set_position(i, *p).unwrap();
            buffer.set_color(i, [255, 255, 255, *a]).unwrap();
        }
        buffer
    }

    fn grid(n: usize) -> Vec<Vec3> {
        let mut out = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    out.push(Vec3::new(x as f32, y as f32 * 0.5, z as f32 * 2.0));
                }
            }
        }
        out
    }

    fn collect_owned(tree: &SplatTree) -> Vec<u32> {
        let mut all = Vec::new();
        tree.visit_leaves(|leaf| all.extend_from_slice(&leaf.indexes));
        all.sort_unstable();
        all
    }

    #[test]
    fn leaves_partition_the_kept_splats() {
        let positions = grid(9);
        let mut alphas = vec![255u8; positions.len()];
        for a in alphas.iter_mut().step_by(7) {
            *a = 0;
        }
        let buffer = buffer_with(&positions, &alphas);
        let config = TreeConfig {
            max_depth: 8,
            max_positions_per_node: 16,
        };
        let tree = SplatTree::build_visible(&config, &buffer, 0);

        let expected: Vec<u32> = (0..positions.len() as u32)
            .filter(|&i| alphas[i as usize] > 0)
            .collect();
        // Grid points sit on octant faces, yet each one is owned exactly once.
        assert_eq!(collect_owned(&tree), expected);

        for leaf in tree.leaves() {
            for &i in &leaf.indexes {
                assert!(leaf.contains_point(positions[i as usize]));
            }
        }
        for id in 0..tree.nodes.len() {
            let node = tree.node(id);
            assert!(node.children.is_empty() || node.children.len() == 8);
            if !node.is_leaf() {
                assert!(node.indexes.is_empty());
            }
        }
    }

    #[test]
    fn small_inputs_stay_in_a_single_leaf() {
        let positions = grid(3);
        let buffer = buffer_with(&positions, &vec![255; positions.len()]);
        let tree = SplatTree::build(&TreeConfig::default(), &buffer, |_| true);
        assert_eq!(tree.count_leaves(), 1);
        assert!(tree.root().is_leaf());
        assert_eq!(tree.root().indexes.len(), 27);
        assert_eq!(tree.scene_bounds(), (Vec3::ZERO, Vec3::new(2.0, 1.0, 4.0)));
    }

    #[test]
    fn split_requires_count_above_threshold_and_depth_below_limit() {
        let positions = grid(2);
        let buffer = buffer_with(&positions, &vec![255; positions.len()]);

        let at_threshold = TreeConfig {
            max_depth: 8,
            max_positions_per_node: 8,
        };
        assert_eq!(SplatTree::build(&at_threshold, &buffer, |_| true).count_leaves(), 1);

        let no_depth = TreeConfig {
            max_depth: 0,
            max_positions_per_node: 1,
        };
        assert_eq!(SplatTree::build(&no_depth, &buffer, |_| true).count_leaves(), 1);

        let one_level = TreeConfig {
            max_depth: 1,
            max_positions_per_node: 1,
        };
        let tree = SplatTree::build(&one_level, &buffer, |_| true);
        assert_eq!(tree.count_leaves(), 8);
        assert_eq!(tree.stats().max_leaf_depth, 1);
    }

    #[test]
    fn children_follow_the_upper_half_first_order() {
        // One corner point per octant of the unit cube.
        let positions = vec![
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(0.0, 1.0, 1.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
        ];
        let buffer = buffer_with(&positions, &[255; 8]);
        let config = TreeConfig {
            max_depth: 1,
            max_positions_per_node: 1,
        };
        let tree = SplatTree::build(&config, &buffer, |_| true);
        let owned: Vec<Vec<u32>> = tree.leaves().map(|l| l.indexes.clone()).collect();
        assert_eq!(
            owned,
            (0..8u32).map(|i| vec![i]).collect::<Vec<_>>()
        );
    }

    #[test]
    fn boundary_point_is_claimed_by_the_first_leaf_reached() {
        // The center point lies in all eight children.
        let mut positions = vec![Vec3::splat(0.5)];
        positions.extend([Vec3::ZERO, Vec3::ONE]);
        let buffer = buffer_with(&positions, &[255; 3]);
        let config = TreeConfig {
            max_depth: 1,
            max_positions_per_node: 2,
        };
        let tree = SplatTree::build(&config, &buffer, |_| true);
        let first_leaf = tree.leaves().next().unwrap();
        assert_eq!(first_leaf.indexes, vec![0]);
        assert_eq!(collect_owned(&tree), vec![0, 1, 2]);
    }

    #[test]
    fn corners_of_inexact_bounds_are_kept() {
        let lo = Vec3::splat(-0.3);
        let hi = Vec3::splat(0.1);
        let mut positions = vec![lo, hi];
        for i in 0..10 {
            let t = (i as f32 + 0.5) / 10.0;
            positions.push(lo.lerp(hi, t) + Vec3::new(0.0, 0.013 * i as f32, -0.007 * i as f32));
        }
        let positions: Vec<Vec3> = positions.into_iter().map(|p| p.clamp(lo, hi)).collect();
        let buffer = buffer_with(&positions, &[255; 12]);
        let config = TreeConfig {
            max_depth: 8,
            max_positions_per_node: 4,
        };
        let tree = SplatTree::build(&config, &buffer, |_| true);
        assert!(tree.count_leaves() > 1);
        assert_eq!(collect_owned(&tree), (0..12).collect::<Vec<u32>>());

        for id in 0..tree.nodes.len() {
            let node = tree.node(id);
            if node.is_leaf() {
                continue;
            }
            let (lo, hi) = (node.min, node.max);
            for &child in &node.children {
                let child = tree.node(child);
                assert!(child.min.cmpge(lo).all() && child.max.cmple(hi).all());
                for axis in 0..3 {
                    assert!(child.min[axis] == lo[axis] || child.max[axis] == hi[axis]);
                }
            }
        }
    }

    #[test]
    fn coincident_points_do_not_split_forever() {
        let positions = vec![Vec3::new(3.0, 3.0, 3.0); 20];
        let buffer = buffer_with(&positions, &[255; 20]);
        let config = TreeConfig {
            max_depth: 8,
            max_positions_per_node: 4,
        };
        let tree = SplatTree::build(&config, &buffer, |_| true);
        assert_eq!(tree.count_leaves(), 1);
        assert_eq!(tree.root().indexes.len(), 20);
    }

    #[test]
    fn non_finite_positions_are_dropped() {
        let positions = vec![Vec3::ZERO, Vec3::new(f32::NAN, 0.0, 0.0), Vec3::ONE];
        let buffer = buffer_with(&positions, &[255; 3]);
        let tree = SplatTree::build(&TreeConfig::default(), &buffer, |_| true);
        assert_eq!(collect_owned(&tree), vec![0, 2]);
        assert_eq!(tree.scene_bounds(), (Vec3::ZERO, Vec3::ONE));
    }

    #[test]
    fn stats_report_leaf_occupancy() {
        let positions = grid(6);
        let buffer = buffer_with(&positions, &vec![255; positions.len()]);
        let config = TreeConfig {
            max_depth: 8,
            max_positions_per_node: 10,
        };
        let tree = SplatTree::build(&config, &buffer, |_| true);
        let stats = tree.stats();
        assert_eq!(stats.leaf_count, tree.count_leaves());
        assert_eq!(stats.leaf_count, tree.leaf_ids().len());
        assert!(stats.populated_leaf_count <= stats.leaf_count);
        assert!(stats.max_splats_per_leaf <= 10);
        let avg = positions.len() as f32 / stats.populated_leaf_count as f32;
        assert!((stats.average_splats_per_leaf - avg).abs() < 1e-4);
    }

    #[test]
    fn empty_selection_builds_an_empty_root() {
        let buffer = buffer_with(&[Vec3::ONE], &[0]);
        let tree = SplatTree::build_visible(&TreeConfig::default(), &buffer, 0);
        assert_eq!(tree.count_leaves(), 1);
        assert!(tree.root().indexes.is_empty());
    }
}
