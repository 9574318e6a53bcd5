//! Static spatial index over closed boxes.
//!
//! A bounding-volume hierarchy built once by median splits along the longest
//! axis of the box centres. Queries return item ids in ascending order so that
//! callers scanning "the first match" get the same answer on every run and
//! every worker.

use crate::geometry::bounds::BoundingBox;

const LEAF_SIZE: usize = 4;

#[derive(Clone, Debug)]
enum NodeKind {
    Leaf { start: usize, end: usize },
    Split { left: usize, right: usize },
}

#[derive(Clone, Debug)]
struct Node {
    bbox: BoundingBox,
    kind: NodeKind,
}

/// Index answering "which boxes contain this point" and "which boxes overlap
/// this box".
#[derive(Clone, Debug, Default)]
pub struct IntervalIndex {
    nodes: Vec<Node>,
    items: Vec<(usize, BoundingBox)>,
}

impl IntervalIndex {
    /// Build from `(id, box)` pairs. Empty boxes are dropped; ids need not be dense.
    pub fn new(items: Vec<(usize, BoundingBox)>) -> Self {
        let mut items: Vec<_> = items.into_iter().filter(|(_, b)| !b.is_empty()).collect();
        let mut nodes = Vec::with_capacity(2 * items.len() / LEAF_SIZE + 1);
        if !items.is_empty() {
            build(&mut nodes, &mut items, 0);
        }
        log::trace!(
            "interval index: {} boxes, {} nodes",
            items.len(),
            nodes.len()
        );
        Self { nodes, items }
    }

    /// Build with ids equal to positions in `boxes`.
    pub fn from_boxes(boxes: &[BoundingBox]) -> Self {
        Self::new(boxes.iter().copied().enumerate().collect())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Union of all indexed boxes.
    pub fn bounds(&self) -> BoundingBox {
        self.nodes
            .first()
            .map(|n| n.bbox)
            .unwrap_or_else(BoundingBox::empty)
    }

    /// Ids of all boxes containing `p`, ascending.
    pub fn find_containing(&self, p: [f64; 3]) -> Vec<usize> {
        let mut out = Vec::new();
        self.find_containing_into(p, &mut out);
        out
    }

    pub fn find_containing_into(&self, p: [f64; 3], out: &mut Vec<usize>) {
        self.query(out, |b| b.contains_point(p));
    }

    /// Lowest id among the boxes containing `p`.
    pub fn first_containing(&self, p: [f64; 3]) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut best: Option<usize> = None;
        let mut stack = vec![0usize];
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            if !node.bbox.contains_point(p) {
                continue;
            }
            match node.kind {
                NodeKind::Leaf { start, end } => {
                    for (id, b) in &self.items[start..end] {
                        if b.contains_point(p) && best.is_none_or(|cur| *id < cur) {
                            best = Some(*id);
                        }
                    }
                }
                NodeKind::Split { left, right } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        best
    }

    /// Ids of all boxes overlapping `query` (closed), ascending.
    pub fn find_overlapping(&self, query: &BoundingBox) -> Vec<usize> {
        let mut out = Vec::new();
        self.find_overlapping_into(query, &mut out);
        out
    }

    pub fn find_overlapping_into(&self, query: &BoundingBox, out: &mut Vec<usize>) {
        if query.is_empty() {
            out.clear();
            return;
        }
        self.query(out, |b| b.overlaps(query));
    }

    fn query<F>(&self, out: &mut Vec<usize>, hit: F)
    where
        F: Fn(&BoundingBox) -> bool,
    {
        out.clear();
        if self.nodes.is_empty() {
            return;
        }
        let mut stack = vec![0usize];
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            if !hit(&node.bbox) {
                continue;
            }
            match node.kind {
                NodeKind::Leaf { start, end } => {
                    out.extend(
                        self.items[start..end]
                            .iter()
                            .filter(|(_, b)| hit(b))
                            .map(|(id, _)| *id),
                    );
                }
                NodeKind::Split { left, right } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
    }
}

fn build(nodes: &mut Vec<Node>, items: &mut [(usize, BoundingBox)], offset: usize) -> usize {
    let mut bbox = BoundingBox::empty();
    for (_, b) in items.iter() {
        bbox.join(b);
    }
    let idx = nodes.len();
    if items.len() <= LEAF_SIZE {
        nodes.push(Node {
            bbox,
            kind: NodeKind::Leaf {
                start: offset,
                end: offset + items.len(),
            },
        });
        return idx;
    }

    let centers: Vec<[f64; 3]> = items.iter().map(|(_, b)| b.center()).collect();
    let centers = BoundingBox::from_points(&centers);
    let axis = centers.longest_axis();
    let mid = items.len() / 2;
    items.select_nth_unstable_by(mid, |a, b| {
        a.1.center()[axis].total_cmp(&b.1.center()[axis])
    });

    // placeholder, patched once both children exist
    nodes.push(Node {
        bbox,
        kind: NodeKind::Leaf { start: 0, end: 0 },
    });
    let (lo, hi) = items.split_at_mut(mid);
    let left = build(nodes, lo, offset);
    let right = build(nodes, hi, offset + mid);
    nodes[idx].kind = NodeKind::Split { left, right };
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_boxes(n: usize, seed: u64) -> Vec<BoundingBox> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut min = [0.0; 3];
                let mut max = [0.0; 3];
                for d in 0..3 {
                    min[d] = rng.gen_range(0.0..10.0);
                    max[d] = min[d] + rng.gen_range(0.0..1.5);
                }
                BoundingBox::new(min, max)
            })
            .collect()
    }

    #[test]
    fn matches_brute_force() {
        let boxes = random_boxes(300, 7);
        let index = IntervalIndex::from_boxes(&boxes);
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..200 {
            let p = [
                rng.gen_range(-1.0..11.0),
                rng.gen_range(-1.0..11.0),
                rng.gen_range(-1.0..11.0),
            ];
            let expect: Vec<usize> = (0..boxes.len())
                .filter(|&i| boxes[i].contains_point(p))
                .collect();
            assert_eq!(index.find_containing(p), expect);
            assert_eq!(index.first_containing(p), expect.first().copied());

            let q = BoundingBox::new(p, [p[0] + 0.5, p[1] + 0.5, p[2] + 0.5]);
            let expect: Vec<usize> = (0..boxes.len())
                .filter(|&i| boxes[i].overlaps(&q))
                .collect();
            assert_eq!(index.find_overlapping(&q), expect);
        }
    }

    #[test]
    fn shared_face_is_found_by_both_sides() {
        let boxes = [
            BoundingBox::new([0.0; 3], [1.0; 3]),
            BoundingBox::new([1.0, 0.0, 0.0], [2.0, 1.0, 1.0]),
        ];
        let index = IntervalIndex::from_boxes(&boxes);
        assert_eq!(index.find_containing([1.0, 0.5, 0.5]), vec![0, 1]);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = IntervalIndex::new(vec![(3, BoundingBox::empty())]);
        assert!(index.is_empty());
        assert!(index.find_containing([0.0; 3]).is_empty());
        assert!(index.bounds().is_empty());
    }

    #[test]
    fn sparse_ids_are_preserved() {
        let b = BoundingBox::new([0.0; 3], [1.0; 3]);
        let index = IntervalIndex::new(vec![(42, b), (7, b)]);
        assert_eq!(index.find_containing([0.5; 3]), vec![7, 42]);
    }
}
