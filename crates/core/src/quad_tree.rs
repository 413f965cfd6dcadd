//! Quad-tree directory blobs for feature packs.
//!
//! A blob maps lookup tiles below an index tile to the feature spans that
//! must be read for them. Nodes are laid out in breadth-first quad order
//! behind a fixed-width offset table:
//!
//! ```text
//! [u32 node_count][u32 × node_count record offsets]
//! record := varint child_mask
//!           varint child_node_index  (one per set mask bit, quad order)
//!           varint span_count
//!           varint span_offset       (span_count times)
//! ```
//!
//! A lookup walks the quad-key path from the index tile toward the lookup
//! tile, collecting the spans of every node it passes, then collects the
//! whole subtree below the node it reached: spans on the path belong to
//! ancestors of the lookup tile, spans below it to features contained in
//! it.

use std::collections::VecDeque;

use crate::tile::{quad_key, Tile};
use crate::wire::{get_varint, put_varint};
use crate::{Error, Result};

/// One span produced by the packer: all features of this span share
/// `best_tile`.
#[derive(Debug, Clone, Copy)]
pub struct QuadTreeInput {
    pub best_tile: Tile,
    pub span_offset: u32,
}

#[derive(Default)]
struct Node {
    children: [Option<usize>; 4],
    spans: Vec<u32>,
}

/// Serialize the directory for `inputs`, all of whose tiles lie in the
/// subtree of `root`.
pub fn make_quad_tree(root: Tile, inputs: &[QuadTreeInput]) -> Vec<u8> {
    let mut arena: Vec<Node> = vec![Node::default()];
    for input in inputs {
        let mut node = 0usize;
        for quad in quad_key(root, input.best_tile) {
            let slot = usize::from(quad);
            node = match arena[node].children[slot] {
                Some(child) => child,
                None => {
                    arena.push(Node::default());
                    let child = arena.len() - 1;
                    arena[node].children[slot] = Some(child);
                    child
                }
            };
        }
        arena[node].spans.push(input.span_offset);
    }

    // renumber breadth-first
    let mut order = Vec::with_capacity(arena.len());
    let mut queue = VecDeque::from([0usize]);
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for child in arena[i].children.into_iter().flatten() {
            queue.push_back(child);
        }
    }
    let mut renumbered = vec![0usize; arena.len()];
    for (new, &old) in order.iter().enumerate() {
        renumbered[old] = new;
    }

    let mut records: Vec<Vec<u8>> = Vec::with_capacity(order.len());
    for &old in &order {
        let node = &arena[old];
        let mut rec = Vec::new();
        let mut mask = 0u64;
        for (slot, child) in node.children.iter().enumerate() {
            if child.is_some() {
                mask |= 1 << slot;
            }
        }
        put_varint(&mut rec, mask);
        for child in node.children.into_iter().flatten() {
            put_varint(&mut rec, renumbered[child] as u64);
        }
        put_varint(&mut rec, node.spans.len() as u64);
        for &offset in &node.spans {
            put_varint(&mut rec, u64::from(offset));
        }
        records.push(rec);
    }

    let header_len = 4 + 4 * records.len();
    let mut blob = Vec::with_capacity(header_len + records.iter().map(Vec::len).sum::<usize>());
    blob.extend_from_slice(&(records.len() as u32).to_le_bytes());
    let mut offset = header_len as u32;
    for rec in &records {
        blob.extend_from_slice(&offset.to_le_bytes());
        offset += rec.len() as u32;
    }
    for rec in &records {
        blob.extend_from_slice(rec);
    }
    blob
}

struct BlobReader<'a> {
    blob: &'a [u8],
    node_count: usize,
}

struct NodeView {
    children: [Option<usize>; 4],
    spans: Vec<u32>,
}

impl<'a> BlobReader<'a> {
    fn new(blob: &'a [u8]) -> Result<Self> {
        let count_bytes: [u8; 4] = blob
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::malformed("quad tree blob too short"))?;
        let node_count = u32::from_le_bytes(count_bytes) as usize;
        if blob.len() < 4 + 4 * node_count {
            return Err(Error::malformed("quad tree offset table truncated"));
        }
        Ok(Self { blob, node_count })
    }

    fn node(&self, index: usize) -> Result<NodeView> {
        if index >= self.node_count {
            return Err(Error::malformed("quad tree node index out of range"));
        }
        let at = 4 + 4 * index;
        let offset = u32::from_le_bytes(self.blob[at..at + 4].try_into().unwrap()) as usize;
        let mut buf = self
            .blob
            .get(offset..)
            .ok_or_else(|| Error::malformed("quad tree node offset out of range"))?;

        let mask = get_varint(&mut buf)?;
        let mut children = [None; 4];
        for (slot, child) in children.iter_mut().enumerate() {
            if mask & (1 << slot) != 0 {
                *child = Some(get_varint(&mut buf)? as usize);
            }
        }
        let span_count = get_varint(&mut buf)? as usize;
        let mut spans = Vec::with_capacity(span_count);
        for _ in 0..span_count {
            spans.push(get_varint(&mut buf)? as u32);
        }
        Ok(NodeView { children, spans })
    }
}

/// Span offsets to read when rendering `target`, which must lie at or
/// below `root`.
pub fn lookup(blob: &[u8], root: Tile, target: Tile) -> Result<Vec<u32>> {
    debug_assert!(root.contains(&target));
    let reader = BlobReader::new(blob)?;

    let mut offsets = Vec::new();
    let mut node = reader.node(0)?;
    offsets.extend_from_slice(&node.spans);

    for quad in quad_key(root, target) {
        match node.children[usize::from(quad)] {
            Some(child) => {
                node = reader.node(child)?;
                offsets.extend_from_slice(&node.spans);
            }
            // the directory holds nothing at or below the lookup tile
            None => return Ok(offsets),
        }
    }

    // everything below the lookup tile is contained in it
    let mut queue: VecDeque<usize> = node.children.into_iter().flatten().collect();
    while let Some(i) = queue.pop_front() {
        let n = reader.node(i)?;
        offsets.extend_from_slice(&n.spans);
        queue.extend(n.children.into_iter().flatten());
    }
    Ok(offsets)
}

/// All span offsets in the blob, in breadth-first order.
pub fn all_spans(blob: &[u8]) -> Result<Vec<u32>> {
    let reader = BlobReader::new(blob)?;
    let mut offsets = Vec::new();
    for i in 0..reader.node_count {
        offsets.extend_from_slice(&reader.node(i)?.spans);
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(tile: Tile, span_offset: u32) -> QuadTreeInput {
        QuadTreeInput {
            best_tile: tile,
            span_offset,
        }
    }

    #[test]
    fn test_root_only_tree_serves_all_descendants() {
        let root = Tile::new(0, 0, 0);
        let blob = make_quad_tree(root, &[input(root, 8), input(root, 90)]);

        for target in [root, Tile::new(1, 1, 1), Tile::new(1023, 0, 10)] {
            assert_eq!(lookup(&blob, root, target).unwrap(), vec![8, 90]);
        }
    }

    #[test]
    fn test_path_spans_accumulate() {
        let root = Tile::new(0, 0, 1);
        let child = Tile::new(1, 0, 2); // quad 1 under root
        let grandchild = Tile::new(3, 1, 3); // quad 3 under child
        let blob = make_quad_tree(
            root,
            &[input(root, 10), input(child, 20), input(grandchild, 30)],
        );

        assert_eq!(lookup(&blob, root, root).unwrap(), vec![10, 20, 30]);
        assert_eq!(lookup(&blob, root, child).unwrap(), vec![10, 20, 30]);
        assert_eq!(lookup(&blob, root, grandchild).unwrap(), vec![10, 20, 30]);

        // the sibling branch sees only the root span
        let sibling = Tile::new(0, 1, 2);
        assert_eq!(lookup(&blob, root, sibling).unwrap(), vec![10]);
    }

    #[test]
    fn test_lookup_below_deepest_node() {
        let root = Tile::new(0, 0, 4);
        let leaf = Tile::new(1, 1, 5);
        let blob = make_quad_tree(root, &[input(leaf, 77)]);

        // descendant of the leaf still reaches the leaf span
        let below = Tile::new(5, 4, 7);
        assert!(leaf.contains(&below));
        assert_eq!(lookup(&blob, root, below).unwrap(), vec![77]);
    }

    #[test]
    fn test_disjoint_branches_do_not_leak() {
        let root = Tile::new(0, 0, 2);
        let a = Tile::new(0, 0, 3);
        let b = Tile::new(1, 1, 3);
        let blob = make_quad_tree(root, &[input(a, 1), input(b, 2)]);

        assert_eq!(lookup(&blob, root, a).unwrap(), vec![1]);
        assert_eq!(lookup(&blob, root, b).unwrap(), vec![2]);
        assert_eq!(lookup(&blob, root, root).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_all_spans_matches_union() {
        let root = Tile::new(3, 3, 5);
        let inputs: Vec<QuadTreeInput> = root
            .direct_children()
            .iter()
            .enumerate()
            .map(|(i, t)| input(*t, i as u32 * 100))
            .collect();
        let blob = make_quad_tree(root, &inputs);

        let mut all = all_spans(&blob).unwrap();
        all.sort_unstable();
        assert_eq!(all, vec![0, 100, 200, 300]);
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        assert!(lookup(&[1, 0], Tile::new(0, 0, 0), Tile::new(0, 0, 0)).is_err());
    }
}
