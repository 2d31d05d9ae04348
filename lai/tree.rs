//! Binary tree of the distinct allele paths a window of genotypes admits.
//!
//! Nodes live in a flat arena; traversal is iterative so deep windows cannot
//! exhaust the stack.

use ndarray::{Array2, ArrayView2, ShapeError};

#[derive(Debug, Clone, Copy)]
struct Node {
    allele: u8,
    left: Option<usize>,
    right: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PathTree {
    nodes: Vec<Node>,
    depth: usize,
}

impl PathTree {
    /// Inserts every individual of `window` (n x w). A homozygous reference
    /// call follows the 0-branch, a homozygous alternate call the 1-branch,
    /// anything else both.
    pub fn build(window: ArrayView2<u8>) -> Self {
        let mut tree = Self {
            nodes: vec![Node {
                allele: 0,
                left: None,
                right: None,
            }],
            depth: window.ncols(),
        };
        let mut frontier = Vec::new();
        let mut next = Vec::new();
        for genotypes in window.rows() {
            frontier.clear();
            frontier.push(0usize);
            for &g in genotypes {
                next.clear();
                for &node in &frontier {
                    if g != 2 {
                        next.push(tree.child(node, 0));
                    }
                    if g != 0 {
                        next.push(tree.child(node, 1));
                    }
                }
                std::mem::swap(&mut frontier, &mut next);
            }
        }
        tree
    }

    fn child(&mut self, node: usize, allele: u8) -> usize {
        let existing = if allele == 0 {
            self.nodes[node].left
        } else {
            self.nodes[node].right
        };
        if let Some(idx) = existing {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            allele,
            left: None,
            right: None,
        });
        if allele == 0 {
            self.nodes[node].left = Some(idx);
        } else {
            self.nodes[node].right = Some(idx);
        }
        idx
    }

    /// Number of leaves, i.e. of distinct root-to-leaf paths.
    pub fn width(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.left.is_none() && n.right.is_none())
            .count()
    }

    /// Every root-to-leaf path (root excluded), 0-branches first.
    pub fn paths(&self) -> Result<Array2<u8>, ShapeError> {
        let mut rows: Vec<Vec<u8>> = Vec::new();
        let mut stack: Vec<(usize, Vec<u8>)> = vec![(0, Vec::with_capacity(self.depth))];
        while let Some((idx, prefix)) = stack.pop() {
            let node = self.nodes[idx];
            if node.left.is_none() && node.right.is_none() {
                rows.push(prefix);
                continue;
            }
            for child in [node.right, node.left].into_iter().flatten() {
                let mut path = prefix.clone();
                path.push(self.nodes[child].allele);
                stack.push((child, path));
            }
        }
        let width = rows.first().map_or(0, Vec::len);
        let flat: Vec<u8> = rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((rows.len(), width), flat)
    }
}
