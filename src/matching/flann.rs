//! Approximate nearest neighbour indices.
//!
//! Binary descriptors are hashed into multi-probe LSH tables, float
//! descriptors go into a forest of randomized k-d trees.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use space::Metric;

use super::{Hamming, L2};
use crate::features::descriptor::{bit, BinaryDescriptor, FloatDescriptor, BINARY_DESCRIPTOR_BYTES};

const INDEX_SEED: u64 = 0x5EED_F1A2;

/// Sorted list of the best `k` `(index, unit)` candidates seen so far
struct Candidates {
    k: usize,
    best: Vec<(usize, u32)>,
}

impl Candidates {
    fn new(k: usize) -> Self {
        Self {
            k,
            best: Vec::with_capacity(k + 1),
        }
    }

    fn is_full(&self) -> bool {
        self.best.len() >= self.k
    }

    fn worst(&self) -> u32 {
        if self.is_full() {
            self.best.last().map_or(u32::MAX, |c| c.1)
        } else {
            u32::MAX
        }
    }

    fn offer(&mut self, index: usize, distance: u32) {
        if self.k == 0 || distance >= self.worst() {
            return;
        }
        let position = self
            .best
            .iter()
            .position(|c| c.1 > distance)
            .unwrap_or(self.best.len());
        self.best.insert(position, (index, distance));
        self.best.truncate(self.k);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LshParams {
    pub tables: usize,
    pub key_size: usize,
    /// Buckets within this Hamming distance of the query key are probed too
    pub multi_probe_level: usize,
}

impl Default for LshParams {
    fn default() -> Self {
        Self {
            tables: 12,
            key_size: 20,
            multi_probe_level: 2,
        }
    }
}

struct LshTable {
    bits: Vec<usize>,
    buckets: HashMap<u32, Vec<usize>>,
}

impl LshTable {
    fn key(&self, descriptor: &BinaryDescriptor) -> u32 {
        self.bits
            .iter()
            .fold(0u32, |key, &index| (key << 1) | bit(descriptor, index) as u32)
    }
}

/// Locality sensitive hashing on sampled descriptor bits
pub struct LshIndex<'a> {
    train: &'a [BinaryDescriptor],
    tables: Vec<LshTable>,
    probes: Vec<u32>,
}

impl<'a> LshIndex<'a> {
    pub fn new(train: &'a [BinaryDescriptor], params: LshParams) -> Self {
        let mut rng = StdRng::seed_from_u64(INDEX_SEED);

        // sample among bits set in some descriptor, shorter descriptors are zero padded
        let mut used = (0..BINARY_DESCRIPTOR_BYTES * 8)
            .filter(|&index| train.iter().any(|d| bit(d, index)))
            .collect::<Vec<_>>();
        if used.len() < params.key_size {
            used = (0..BINARY_DESCRIPTOR_BYTES * 8).collect();
        }
        let key_size = params.key_size.min(32);

        let tables = (0..params.tables)
            .map(|_| {
                let bits = used
                    .choose_multiple(&mut rng, key_size)
                    .copied()
                    .collect::<Vec<_>>();
                let mut table = LshTable {
                    bits,
                    buckets: HashMap::new(),
                };
                for (index, descriptor) in train.iter().enumerate() {
                    let key = table.key(descriptor);
                    table.buckets.entry(key).or_default().push(index);
                }
                table
            })
            .collect();

        Self {
            train,
            tables,
            probes: probe_masks(key_size, params.multi_probe_level),
        }
    }
}

/// XOR masks of every key within `level` flipped bits
fn probe_masks(key_size: usize, level: usize) -> Vec<u32> {
    let mut masks = vec![0u32];
    let mut frontier = vec![(0u32, 0usize)];
    for _ in 0..level {
        let mut next = Vec::new();
        for &(mask, lowest) in frontier.iter() {
            for bit in lowest..key_size {
                let flipped = mask | (1 << bit);
                masks.push(flipped);
                next.push((flipped, bit + 1));
            }
        }
        frontier = next;
    }
    masks
}

impl LshIndex<'_> {
    /// Up to `k` neighbours among the rows sharing a probed bucket with `query`
    pub fn knn(&self, query: &BinaryDescriptor, k: usize) -> Vec<(usize, u32)> {
        let mut seen = HashSet::new();
        let mut candidates = Candidates::new(k);

        for table in self.tables.iter() {
            let key = table.key(query);
            for mask in self.probes.iter() {
                let Some(bucket) = table.buckets.get(&(key ^ mask)) else {
                    continue;
                };
                for &index in bucket {
                    if seen.insert(index) {
                        candidates.offer(index, Hamming.distance(query, &self.train[index]));
                    }
                }
            }
        }

        candidates.best
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KdForestParams {
    pub trees: usize,
    /// Leaves visited before the search gives up
    pub checks: usize,
}

impl Default for KdForestParams {
    fn default() -> Self {
        Self {
            trees: 4,
            checks: 32,
        }
    }
}

enum KdNode {
    Leaf(usize),
    Split {
        dimension: usize,
        value: f32,
        left: usize,
        right: usize,
    },
}

/// Randomized k-d trees sharing one priority queue during search
pub struct KdForest<'a> {
    train: &'a [FloatDescriptor],
    nodes: Vec<KdNode>,
    roots: Vec<usize>,
    checks: usize,
}

/// Split dimension is drawn among this many highest variance dimensions
const RANDOM_DIMENSIONS: usize = 5;
const VARIANCE_SAMPLES: usize = 100;

/// Max-heap entry ordered by smallest lower bound first
#[derive(PartialEq)]
struct Branch {
    bound: f32,
    node: usize,
}

impl Eq for Branch {}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bound.total_cmp(&other.bound)
    }
}

impl<'a> KdForest<'a> {
    pub fn new(train: &'a [FloatDescriptor], params: KdForestParams) -> Self {
        let mut rng = StdRng::seed_from_u64(INDEX_SEED);
        let mut forest = Self {
            train,
            nodes: Vec::new(),
            roots: Vec::new(),
            checks: params.checks,
        };

        if !train.is_empty() {
            for _ in 0..params.trees.max(1) {
                let mut indices = (0..train.len()).collect::<Vec<_>>();
                indices.shuffle(&mut rng);
                let root = forest.build(&mut indices, &mut rng);
                forest.roots.push(root);
            }
        }
        forest
    }

    fn build(&mut self, indices: &mut [usize], rng: &mut StdRng) -> usize {
        if indices.len() == 1 {
            self.nodes.push(KdNode::Leaf(indices[0]));
            return self.nodes.len() - 1;
        }

        let (dimension, value) = self.choose_split(indices, rng);
        let mut pivot = partition(indices, |&i| self.train[i][dimension] < value);
        // all values equal along the split, halve the set
        if pivot == 0 || pivot == indices.len() {
            pivot = indices.len() / 2;
        }

        let (lower, upper) = indices.split_at_mut(pivot);
        let left = self.build(lower, rng);
        let right = self.build(upper, rng);
        self.nodes.push(KdNode::Split {
            dimension,
            value,
            left,
            right,
        });
        self.nodes.len() - 1
    }

    fn choose_split(&self, indices: &[usize], rng: &mut StdRng) -> (usize, f32) {
        let samples = &indices[..indices.len().min(VARIANCE_SAMPLES)];
        let n = samples.len() as f32;

        let mut mean = [0f32; 128];
        for &i in samples {
            for (m, v) in mean.iter_mut().zip(self.train[i].iter()) {
                *m += v / n;
            }
        }
        let mut variance = [0f32; 128];
        for &i in samples {
            for ((var, v), m) in variance.iter_mut().zip(self.train[i].iter()).zip(mean.iter()) {
                *var += (v - m) * (v - m);
            }
        }

        let mut dimensions = (0..mean.len()).collect::<Vec<_>>();
        dimensions.sort_by(|&a, &b| variance[b].total_cmp(&variance[a]));
        let dimension = dimensions[rng.gen_range(0..RANDOM_DIMENSIONS.min(dimensions.len()))];
        (dimension, mean[dimension])
    }

    /// Walks down to a leaf, queueing the branches not taken
    fn descend(
        &self,
        mut node: usize,
        query: &FloatDescriptor,
        bound: f32,
        queue: &mut BinaryHeap<Reverse<Branch>>,
    ) -> usize {
        loop {
            match self.nodes[node] {
                KdNode::Leaf(index) => return index,
                KdNode::Split {
                    dimension,
                    value,
                    left,
                    right,
                } => {
                    let difference = query[dimension] - value;
                    let (near, far) = if difference < 0.0 { (left, right) } else { (right, left) };
                    // squared distance to the far side along a single axis stays a lower bound
                    queue.push(Reverse(Branch {
                        bound: bound.max(difference * difference),
                        node: far,
                    }));
                    node = near;
                }
            }
        }
    }
}

/// Moves the elements matching `predicate` to the front, returning their count
fn partition<F: Fn(&usize) -> bool>(indices: &mut [usize], predicate: F) -> usize {
    let mut next = 0;
    for i in 0..indices.len() {
        if predicate(&indices[i]) {
            indices.swap(next, i);
            next += 1;
        }
    }
    next
}

impl KdForest<'_> {
    /// Up to `k` neighbours found within the configured number of leaf checks
    pub fn knn(&self, query: &FloatDescriptor, k: usize) -> Vec<(usize, u32)> {
        let mut candidates = Candidates::new(k);
        let mut seen = HashSet::new();
        let mut queue = BinaryHeap::new();
        let mut checks = 0;

        let mut leaves = Vec::with_capacity(self.roots.len());
        for &root in self.roots.iter() {
            leaves.push(self.descend(root, query, 0.0, &mut queue));
        }
        for leaf in leaves {
            if seen.insert(leaf) {
                candidates.offer(leaf, L2.distance(query, &self.train[leaf]));
                checks += 1;
            }
        }

        while let Some(Reverse(branch)) = queue.pop() {
            let worst = f32::from_bits(candidates.worst());
            if candidates.is_full() && (branch.bound >= worst * worst || checks >= self.checks) {
                break;
            }
            let leaf = self.descend(branch.node, query, branch.bound, &mut queue);
            if seen.insert(leaf) {
                candidates.offer(leaf, L2.distance(query, &self.train[leaf]));
                checks += 1;
            }
        }

        candidates.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::brute_force;

    fn float_rows(n: usize) -> Vec<FloatDescriptor> {
        (0..n)
            .map(|i| {
                let mut row = [0f32; 128];
                for (d, value) in row.iter_mut().enumerate() {
                    *value = ((i * 37 + d * 11) % 101) as f32;
                }
                row
            })
            .collect()
    }

    #[test]
    fn probe_masks_cover_the_hamming_ball() {
        let masks = probe_masks(20, 2);
        assert_eq!(masks.len(), 1 + 20 + 190);
        assert!(masks.iter().all(|m| m.count_ones() <= 2));
        assert_eq!(masks.iter().collect::<HashSet<_>>().len(), masks.len());
    }

    #[test]
    fn lsh_finds_exact_duplicates() {
        let train = (0..40u8)
            .map(|i| {
                let mut row = [0u8; 64];
                for (j, byte) in row.iter_mut().enumerate().take(32) {
                    *byte = i.wrapping_mul(31).wrapping_add((j as u8).wrapping_mul(17)) ^ (j as u8);
                }
                row
            })
            .collect::<Vec<_>>();
        let index = LshIndex::new(&train, LshParams::default());
        for (i, row) in train.iter().enumerate() {
            let found = index.knn(row, 1);
            assert_eq!(found[0].1, 0);
            assert_eq!(train[found[0].0], train[i]);
        }
    }

    #[test]
    fn kd_forest_matches_brute_force_on_small_sets() {
        let train = float_rows(24);
        let forest = KdForest::new(&train, KdForestParams::default());

        let mut query = train[5];
        query[0] += 0.5;
        let approximate = forest.knn(&query, 2);
        assert_eq!(approximate, brute_force::knn(&[query], &train, 2)[0]);
        assert_eq!(approximate[0].0, 5);
    }

    #[test]
    fn candidates_keep_the_best() {
        let mut candidates = Candidates::new(2);
        candidates.offer(0, 5);
        candidates.offer(1, 3);
        candidates.offer(2, 4);
        candidates.offer(3, 9);
        assert_eq!(candidates.best, vec![(1, 3), (2, 4)]);
    }
}
