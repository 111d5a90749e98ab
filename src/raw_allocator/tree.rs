//! The free-block index: an AVL tree threaded through the free blocks.
//!
//! Free blocks double as tree nodes. The three node fields (left link,
//! right link, height) are overlaid on the first bytes of a free block's
//! body, so the index costs no memory beyond the blocks it manages and no
//! allocation of its own. Links are arena offsets, not pointers; the
//! sentinel [`NIL`] marks an absent child.
//!
//! Nodes are keyed by `(body size, offset)`. The offset tie-break makes
//! every key unique (blocks are distinct by offset) and makes [`pop`]
//! prefer the lowest block among equally sized candidates. All operations
//! run in `O(log n)`.
//!
//! The recursive operations return the possibly rotated root of the
//! subtree they worked on; the caller stores that root into the parent
//! slot. Rotations only rewrite link fields, block contents never move
//! during rebalancing.
//!
//! [`pop`]: FreeTree::pop

use core::fmt;

use super::arena::Arena;
use super::tag::{align_up, Tag, WORD};

/// Sentinel link marking an absent child.
pub const NIL: u32 = u32::MAX;

/// Byte count of the in-body node fields: left, right, height.
const NODE_FIELDS: usize = 3 * core::mem::size_of::<u32>();

/// Smallest total block size whose body can host the node fields, and
/// therefore the smallest block the allocator ever creates or splits off.
pub const MIN_NODE_SIZE: usize = align_up(NODE_FIELDS) + 2 * WORD;

/// The tree over all free blocks, rooted in a single offset.
pub struct FreeTree {
    root: u32,
}

impl FreeTree {
    /// Create an empty index.
    pub const fn new() -> Self {
        Self { root: NIL }
    }

    /// Insert the free block starting at `node` into the index.
    ///
    /// The block's header must already encode its current body size; its
    /// link fields are initialized here. The block must not be in the
    /// index yet.
    pub fn insert<const N: usize>(&mut self, arena: &mut Arena<N>, node: u32) {
        set_left(arena, node, NIL);
        set_right(arena, node, NIL);
        set_height(arena, node, 1);
        self.root = insert_at(arena, self.root, node);
    }

    /// Remove the block starting at `node` from the index.
    ///
    /// The block is located by its `(body size, offset)` key, so its
    /// header must still encode the size it was inserted with.
    pub fn remove<const N: usize>(&mut self, arena: &mut Arena<N>, node: u32) {
        self.root = remove_at(arena, self.root, node);
    }

    /// Remove and return the best-fitting block for `min_size`.
    ///
    /// The best fit is the smallest block whose body size is at least
    /// `min_size`; among equal sizes, the one at the lowest offset.
    /// Returns `None` when every indexed block is smaller.
    pub fn pop<const N: usize>(&mut self, arena: &mut Arena<N>, min_size: usize) -> Option<u32> {
        let (root, found) = pop_at(arena, self.root, min_size);
        self.root = root;
        if found == NIL {
            None
        } else {
            Some(found)
        }
    }

    /// Count the indexed blocks without touching them.
    ///
    /// Walks the tree in preorder and returns `None` if a node links to
    /// itself, the signature shape of a corrupted index. Never mutates.
    pub fn node_count<const N: usize>(&self, arena: &Arena<N>) -> Option<usize> {
        count_at(arena, self.root)
    }

    /// Write an indented preorder listing of `(size, depth)` pairs.
    pub fn dump<const N: usize, W: fmt::Write>(
        &self,
        arena: &Arena<N>,
        out: &mut W,
    ) -> fmt::Result {
        dump_at(arena, self.root, 0, out)
    }
}

/// Body size of the block at `node`, read from its header tag.
fn body_size<const N: usize>(arena: &Arena<N>, node: u32) -> usize {
    Tag::from_raw(arena.word(node as usize)).size()
}

fn left<const N: usize>(arena: &Arena<N>, node: u32) -> u32 {
    arena.cell(node as usize + WORD)
}

fn set_left<const N: usize>(arena: &mut Arena<N>, node: u32, child: u32) {
    arena.set_cell(node as usize + WORD, child);
}

fn right<const N: usize>(arena: &Arena<N>, node: u32) -> u32 {
    arena.cell(node as usize + WORD + 4)
}

fn set_right<const N: usize>(arena: &mut Arena<N>, node: u32, child: u32) {
    arena.set_cell(node as usize + WORD + 4, child);
}

fn set_height<const N: usize>(arena: &mut Arena<N>, node: u32, height: u32) {
    arena.set_cell(node as usize + WORD + 8, height);
}

/// Height of the subtree rooted at `node`; an absent subtree has height 0.
fn height<const N: usize>(arena: &Arena<N>, node: u32) -> u32 {
    if node == NIL {
        0
    } else {
        arena.cell(node as usize + WORD + 8)
    }
}

fn update_height<const N: usize>(arena: &mut Arena<N>, node: u32) {
    let l = height(arena, left(arena, node));
    let r = height(arena, right(arena, node));
    set_height(arena, node, 1 + l.max(r));
}

/// Balance factor: left height minus right height.
fn factor<const N: usize>(arena: &Arena<N>, node: u32) -> i32 {
    height(arena, left(arena, node)) as i32 - height(arena, right(arena, node)) as i32
}

/// Whether `a` orders before `b` under the `(body size, offset)` key.
fn key_below<const N: usize>(arena: &Arena<N>, a: u32, b: u32) -> bool {
    let (sa, sb) = (body_size(arena, a), body_size(arena, b));
    sa < sb || (sa == sb && a < b)
}

/// Left rotation at `node`; its right child becomes the subtree root.
fn rotate_left<const N: usize>(arena: &mut Arena<N>, node: u32) -> u32 {
    let pivot = right(arena, node);
    let inner = left(arena, pivot);
    set_right(arena, node, inner);
    set_left(arena, pivot, node);
    update_height(arena, node);
    update_height(arena, pivot);
    pivot
}

/// Right rotation at `node`; its left child becomes the subtree root.
fn rotate_right<const N: usize>(arena: &mut Arena<N>, node: u32) -> u32 {
    let pivot = left(arena, node);
    let inner = right(arena, pivot);
    set_left(arena, node, inner);
    set_right(arena, pivot, node);
    update_height(arena, node);
    update_height(arena, pivot);
    pivot
}

/// Restore the balance invariant at `node` after a child subtree changed.
///
/// Recomputes the height, then applies one of the four rotation cases if
/// the balance factor left the `[-1, 1]` band. Returns the subtree root
/// to store into the parent slot.
fn rebalance<const N: usize>(arena: &mut Arena<N>, node: u32) -> u32 {
    update_height(arena, node);
    let balance = factor(arena, node);

    if balance > 1 {
        let l = left(arena, node);
        if factor(arena, l) < 0 {
            let rotated = rotate_left(arena, l);
            set_left(arena, node, rotated);
        }
        rotate_right(arena, node)
    } else if balance < -1 {
        let r = right(arena, node);
        if factor(arena, r) > 0 {
            let rotated = rotate_right(arena, r);
            set_right(arena, node, rotated);
        }
        rotate_left(arena, node)
    } else {
        node
    }
}

fn insert_at<const N: usize>(arena: &mut Arena<N>, root: u32, node: u32) -> u32 {
    if root == NIL {
        return node;
    }

    if key_below(arena, node, root) {
        let l = left(arena, root);
        let child = insert_at(arena, l, node);
        set_left(arena, root, child);
    } else {
        let r = right(arena, root);
        let child = insert_at(arena, r, node);
        set_right(arena, root, child);
    }

    rebalance(arena, root)
}

/// Detach the smallest node of the subtree at `root`.
///
/// Returns the rebalanced remaining subtree and the detached node.
fn take_leftmost<const N: usize>(arena: &mut Arena<N>, root: u32) -> (u32, u32) {
    let l = left(arena, root);
    if l == NIL {
        return (right(arena, root), root);
    }
    let (child, leftmost) = take_leftmost(arena, l);
    set_left(arena, root, child);
    (rebalance(arena, root), leftmost)
}

/// Unlink the root of a subtree, returning the new subtree root.
///
/// With two children the in-order successor (the leftmost node of the
/// right subtree) takes the root's place by relinking; node contents are
/// never copied between blocks.
fn detach_root<const N: usize>(arena: &mut Arena<N>, node: u32) -> u32 {
    let l = left(arena, node);
    let r = right(arena, node);
    if l == NIL {
        return r;
    }
    if r == NIL {
        return l;
    }

    let (rest, successor) = take_leftmost(arena, r);
    set_left(arena, successor, l);
    set_right(arena, successor, rest);
    rebalance(arena, successor)
}

fn remove_at<const N: usize>(arena: &mut Arena<N>, root: u32, target: u32) -> u32 {
    if root == NIL {
        return NIL;
    }
    if root == target {
        return detach_root(arena, root);
    }

    if key_below(arena, target, root) {
        let l = left(arena, root);
        let child = remove_at(arena, l, target);
        set_left(arena, root, child);
    } else {
        let r = right(arena, root);
        let child = remove_at(arena, r, target);
        set_right(arena, root, child);
    }

    rebalance(arena, root)
}

/// Find, unlink and return the best fit for `min_size` in one descent.
///
/// At a node that is large enough the left subtree may still hold a
/// closer fit, so it is tried first; if it comes back empty the node
/// itself is the answer and is unlinked in place. Nodes that are too
/// small can only be improved upon to their right. Returns the subtree
/// root to re-attach and the unlinked node ([`NIL`] when nothing fits).
fn pop_at<const N: usize>(arena: &mut Arena<N>, root: u32, min_size: usize) -> (u32, u32) {
    if root == NIL {
        return (NIL, NIL);
    }

    if min_size <= body_size(arena, root) {
        let l = left(arena, root);
        if l != NIL {
            let (child, found) = pop_at(arena, l, min_size);
            if found != NIL {
                set_left(arena, root, child);
                return (rebalance(arena, root), found);
            }
        }
        (detach_root(arena, root), root)
    } else {
        let r = right(arena, root);
        if r == NIL {
            return (root, NIL);
        }
        let (child, found) = pop_at(arena, r, min_size);
        if found == NIL {
            return (root, NIL);
        }
        set_right(arena, root, child);
        (rebalance(arena, root), found)
    }
}

fn count_at<const N: usize>(arena: &Arena<N>, node: u32) -> Option<usize> {
    if node == NIL {
        return Some(0);
    }
    if left(arena, node) == node || right(arena, node) == node {
        return None;
    }
    let l = count_at(arena, left(arena, node))?;
    let r = count_at(arena, right(arena, node))?;
    Some(1 + l + r)
}

fn dump_at<const N: usize, W: fmt::Write>(
    arena: &Arena<N>,
    node: u32,
    depth: usize,
    out: &mut W,
) -> fmt::Result {
    if node == NIL {
        return Ok(());
    }
    for _ in 0..depth {
        out.write_str("  ")?;
    }
    writeln!(out, "({}, {})", body_size(arena, node), depth)?;
    dump_at(arena, left(arena, node), depth + 1, out)?;
    dump_at(arena, right(arena, node), depth + 1, out)
}
