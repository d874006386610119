//! 2-D k-d tree over detection centers.
//!
//! Rebuilt once per frame from that frame's detections and queried once per
//! live track, so construction is a plain median split and nodes live in a
//! flat `Vec`.

#[derive(Debug, Clone)]
struct Node {
    point: [f64; 2],
    /// Index into the slice the tree was built from
    index: usize,
    left: Option<usize>,
    right: Option<usize>,
    axis: usize,
}

/// Static nearest-neighbor index for 2-D points.
#[derive(Debug, Clone, Default)]
pub struct KdTree {
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl KdTree {
    /// Builds a balanced tree over `points`.
    pub fn build(points: &[[f64; 2]]) -> Self {
        let mut tree = Self {
            nodes: Vec::with_capacity(points.len()),
            root: None,
        };
        let mut order: Vec<usize> = (0..points.len()).collect();
        tree.root = tree.build_recursive(points, &mut order, 0);
        tree
    }

    fn build_recursive(&mut self, points: &[[f64; 2]], order: &mut [usize], depth: usize) -> Option<usize> {
        if order.is_empty() {
            return None;
        }

        let axis = depth % 2;
        order.sort_by(|&a, &b| {
            points[a][axis]
                .partial_cmp(&points[b][axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mid = order.len() / 2;
        let index = order[mid];

        let node_id = self.nodes.len();
        self.nodes.push(Node {
            point: points[index],
            index,
            left: None,
            right: None,
            axis,
        });

        let (lower, upper) = order.split_at_mut(mid);
        let left = self.build_recursive(points, lower, depth + 1);
        let right = self.build_recursive(points, &mut upper[1..], depth + 1);

        self.nodes[node_id].left = left;
        self.nodes[node_id].right = right;
        Some(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns `(index, distance)` of the point nearest to `query`.
    pub fn nearest(&self, query: [f64; 2]) -> Option<(usize, f64)> {
        let root = self.root?;
        let mut best: Option<(usize, f64)> = None;
        self.nearest_recursive(root, query, &mut best);
        best.map(|(idx, d2)| (idx, d2.sqrt()))
    }

    fn nearest_recursive(&self, node_id: usize, query: [f64; 2], best: &mut Option<(usize, f64)>) {
        let node = &self.nodes[node_id];

        let dx = node.point[0] - query[0];
        let dy = node.point[1] - query[1];
        let d2 = dx * dx + dy * dy;
        // Ties resolve to the lowest original index so results are deterministic
        let better = match *best {
            None => true,
            Some((idx, best_d2)) => d2 < best_d2 || (d2 == best_d2 && node.index < idx),
        };
        if better {
            *best = Some((node.index, d2));
        }

        let diff = query[node.axis] - node.point[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near) = near {
            self.nearest_recursive(near, query, best);
        }
        if let Some(far) = far {
            let within = best.map_or(true, |(_, best_d2)| diff * diff <= best_d2);
            if within {
                self.nearest_recursive(far, query, best);
            }
        }
    }
}
