//! A red-black tree that owns no memory: node identity is the key
//! itself (an address), and the links and colour live wherever the
//! *representation* puts them, whether in pagemap entries for
//! chunk-sized blocks or inside the free block for sub-chunk ones.  The
//! tree code never touches a raw link; everything goes through the
//! `TreeRep` trait.
//!
//! Nodes have no parent links (there are only two words of storage),
//! so every mutating operation records the ancestor path on the way
//! down and rebalances along it on the way back up.

/// Storage contract for tree nodes.  `0` is the null link; valid keys
/// are never zero.  The accessors take `&self` because representations
/// write through shared structures (the pagemap) or raw block memory.
pub trait TreeRep {
    fn left(&self, node: usize) -> usize;
    fn right(&self, node: usize) -> usize;
    fn set_left(&self, node: usize, link: usize);
    fn set_right(&self, node: usize, link: usize);
    fn is_red(&self, node: usize) -> bool;
    fn set_red(&self, node: usize, red: bool);
}

pub const NULL: usize = 0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dir {
    Left,
    Right,
}

impl Dir {
    #[inline]
    fn flip(self) -> Dir {
        match self {
            Dir::Left => Dir::Right,
            Dir::Right => Dir::Left,
        }
    }
}

#[inline]
fn child<R: TreeRep>(rep: &R, node: usize, dir: Dir) -> usize {
    match dir {
        Dir::Left => rep.left(node),
        Dir::Right => rep.right(node),
    }
}

#[inline]
fn set_child<R: TreeRep>(rep: &R, node: usize, dir: Dir, link: usize) {
    match dir {
        Dir::Left => rep.set_left(node, link),
        Dir::Right => rep.set_right(node, link),
    }
}

/// Rotates the subtree rooted at `node` in direction `dir` and returns
/// the new subtree root.  The caller re-attaches it.
#[inline]
fn rotate<R: TreeRep>(rep: &R, node: usize, dir: Dir) -> usize {
    let pivot = child(rep, node, dir.flip());
    debug_assert_ne!(pivot, NULL);
    set_child(rep, node, dir.flip(), child(rep, pivot, dir));
    set_child(rep, pivot, dir, node);
    pivot
}

/// Twice the depth bound of a balanced tree over a 64-bit key space;
/// a correct tree can never get here.
const MAX_DEPTH: usize = 128;

/// The ancestor trail of a descent: `node[i]` is an ancestor and
/// `dir[i]` the direction the descent took out of it.
struct Path {
    node: [usize; MAX_DEPTH],
    dir: [Dir; MAX_DEPTH],
    len: usize,
}

impl Path {
    fn new() -> Self {
        Path {
            node: [NULL; MAX_DEPTH],
            dir: [Dir::Left; MAX_DEPTH],
            len: 0,
        }
    }

    #[inline]
    fn push(&mut self, node: usize, dir: Dir) {
        assert!(self.len < MAX_DEPTH, "tree deeper than any balanced tree can be");
        self.node[self.len] = node;
        self.dir[self.len] = dir;
        self.len += 1;
    }

    #[inline]
    fn top(&self) -> (usize, Dir) {
        debug_assert!(self.len > 0);
        (self.node[self.len - 1], self.dir[self.len - 1])
    }

    #[inline]
    fn at(&self, index: usize) -> (usize, Dir) {
        (self.node[index], self.dir[index])
    }
}

/// One tree, keyed by address, ascending.  `Copy` so that arrays of
/// per-size-class trees can be constant-initialised.
#[derive(Clone, Copy, Debug)]
pub struct RBTree {
    root: usize,
}

impl RBTree {
    pub const EMPTY: RBTree = RBTree { root: NULL };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == NULL
    }

    /// Re-attaches a rebalanced subtree.  `depth` is the number of
    /// path entries strictly above the replaced node; zero means the
    /// root itself was replaced.
    #[inline]
    fn replace_child<R: TreeRep>(&mut self, rep: &R, path: &Path, depth: usize, new_sub: usize) {
        if depth == 0 {
            self.root = new_sub;
        } else {
            let (parent, dir) = path.at(depth - 1);
            set_child(rep, parent, dir, new_sub);
        }
    }

    /// Inserts `key`.  Inserting a key that is already present means a
    /// block was freed twice; that is a fatal invariant violation.
    pub fn insert<R: TreeRep>(&mut self, rep: &R, key: usize) {
        debug_assert_ne!(key, NULL);

        if self.root == NULL {
            rep.set_left(key, NULL);
            rep.set_right(key, NULL);
            rep.set_red(key, false);
            self.root = key;
            return;
        }

        let mut path = Path::new();
        let mut cur = self.root;
        loop {
            assert_ne!(cur, key, "block freed twice: {:#x}", key);
            let dir = if key < cur { Dir::Left } else { Dir::Right };
            path.push(cur, dir);
            let next = child(rep, cur, dir);
            if next == NULL {
                set_child(rep, cur, dir, key);
                break;
            }
            cur = next;
        }

        rep.set_left(key, NULL);
        rep.set_right(key, NULL);
        rep.set_red(key, true);

        // Walk back up restoring the red-black shape.  The node at the
        // bottom of `path` is always the parent of the current red
        // node of interest.
        loop {
            if path.len == 0 {
                break;
            }

            let (parent, pd) = path.top();
            if !rep.is_red(parent) {
                break;
            }

            // A red parent is never the root, so a grandparent exists.
            debug_assert!(path.len >= 2);
            let (grand, gd) = path.at(path.len - 2);
            let uncle = child(rep, grand, gd.flip());

            if uncle != NULL && rep.is_red(uncle) {
                rep.set_red(parent, false);
                rep.set_red(uncle, false);
                rep.set_red(grand, true);
                path.len -= 2;
                continue;
            }

            if pd != gd {
                // Zig-zag: one rotation at the parent turns it into
                // the same-direction case.
                let new_parent = rotate(rep, parent, gd);
                set_child(rep, grand, gd, new_parent);
            }

            let pivot = child(rep, grand, gd);
            rep.set_red(pivot, false);
            rep.set_red(grand, true);
            let new_sub = rotate(rep, grand, gd.flip());
            self.replace_child(rep, &path, path.len - 2, new_sub);
            break;
        }

        rep.set_red(self.root, false);
    }

    /// True iff `key` is in the tree.
    pub fn find<R: TreeRep>(&self, rep: &R, key: usize) -> bool {
        let mut cur = self.root;
        while cur != NULL {
            if cur == key {
                return true;
            }
            cur = child(rep, cur, if key < cur { Dir::Left } else { Dir::Right });
        }
        false
    }

    /// Removes `key` if present.  Returns whether it was.
    pub fn remove<R: TreeRep>(&mut self, rep: &R, key: usize) -> bool {
        let mut path = Path::new();
        let mut cur = self.root;
        loop {
            if cur == NULL {
                return false;
            }
            if cur == key {
                break;
            }
            let dir = if key < cur { Dir::Left } else { Dir::Right };
            path.push(cur, dir);
            cur = child(rep, cur, dir);
        }

        self.delete_node(rep, path, key);
        true
    }

    /// Removes and returns the smallest key.  Serving the lowest
    /// address first keeps reuse dense at the bottom of the range.
    pub fn remove_min<R: TreeRep>(&mut self, rep: &R) -> Option<usize> {
        if self.root == NULL {
            return None;
        }

        let mut path = Path::new();
        let mut cur = self.root;
        loop {
            let next = rep.left(cur);
            if next == NULL {
                break;
            }
            path.push(cur, Dir::Left);
            cur = next;
        }

        self.delete_node(rep, path, cur);
        Some(cur)
    }

    /// Unlinks `node`, whose strict ancestors (with descent
    /// directions) are in `path`, then restores the red-black shape.
    fn delete_node<R: TreeRep>(&mut self, rep: &R, mut path: Path, node: usize) {
        let node_depth = path.len;
        let replacement;

        if rep.left(node) != NULL && rep.right(node) != NULL {
            // Two children: splice the in-order successor into this
            // position.  Keys are node identities, so the nodes must
            // actually trade places; copying the key is not an option.
            path.push(node, Dir::Right);
            let node_entry = path.len - 1;

            let mut succ = rep.right(node);
            loop {
                let next = rep.left(succ);
                if next == NULL {
                    break;
                }
                path.push(succ, Dir::Left);
                succ = next;
            }

            let (succ_parent, succ_dir) = path.top();
            let orphan = rep.right(succ);

            // Detach the successor first: when it is `node`'s direct
            // right child this updates `node.right`, which the link
            // copy below must observe.
            set_child(rep, succ_parent, succ_dir, orphan);
            let removed_red = rep.is_red(succ);

            rep.set_left(succ, rep.left(node));
            rep.set_right(succ, rep.right(node));
            rep.set_red(succ, rep.is_red(node));
            self.replace_child(rep, &path, node_depth, succ);

            // The path entry that still names `node` now means the
            // successor sitting in its place.
            path.node[node_entry] = succ;

            if removed_red {
                return;
            }
            replacement = orphan;
        } else {
            let removed_red = rep.is_red(node);
            replacement = if rep.left(node) != NULL {
                rep.left(node)
            } else {
                rep.right(node)
            };
            self.replace_child(rep, &path, node_depth, replacement);

            if removed_red {
                // A red node cannot have exactly one child.
                debug_assert_eq!(replacement, NULL);
                return;
            }
        }

        // A black node came out.  If a red node slid into the hole,
        // repainting it restores every black depth.
        if replacement != NULL && rep.is_red(replacement) {
            rep.set_red(replacement, false);
            return;
        }

        self.fix_double_black(rep, path);
    }

    /// The deficient position is the `dir`-child of the node at the
    /// bottom of `path` (or the root when the path is empty), and the
    /// subtree there is one black short.
    fn fix_double_black<R: TreeRep>(&mut self, rep: &R, mut path: Path) {
        loop {
            if path.len == 0 {
                // The deficiency reached the root: every path lost one
                // black uniformly, so the tree is balanced again.
                if self.root != NULL {
                    rep.set_red(self.root, false);
                }
                return;
            }

            let (parent, dir) = path.top();
            let sibling = child(rep, parent, dir.flip());
            // The deficient side had black height at least one, so the
            // sibling side cannot be empty.
            debug_assert_ne!(sibling, NULL);

            if rep.is_red(sibling) {
                // Red sibling: rotate it above the parent, leaving a
                // black sibling for the next round.
                rep.set_red(sibling, false);
                rep.set_red(parent, true);
                let new_sub = rotate(rep, parent, dir);
                self.replace_child(rep, &path, path.len - 1, new_sub);
                path.node[path.len - 1] = sibling;
                path.dir[path.len - 1] = dir;
                path.push(parent, dir);
                continue;
            }

            let close = child(rep, sibling, dir);
            let distant = child(rep, sibling, dir.flip());

            if distant != NULL && rep.is_red(distant) {
                // Red distant nephew: one rotation pays the debt.
                rep.set_red(sibling, rep.is_red(parent));
                rep.set_red(parent, false);
                rep.set_red(distant, false);
                let new_sub = rotate(rep, parent, dir);
                self.replace_child(rep, &path, path.len - 1, new_sub);
                return;
            }

            if close != NULL && rep.is_red(close) {
                // Red close nephew: rotate it above the sibling; the
                // next iteration sees a red distant nephew.
                rep.set_red(sibling, true);
                rep.set_red(close, false);
                let new_sibling = rotate(rep, sibling, dir.flip());
                set_child(rep, parent, dir.flip(), new_sibling);
                continue;
            }

            // Both nephews black: repaint the sibling and move the
            // deficiency one level up.
            rep.set_red(sibling, true);
            if rep.is_red(parent) {
                rep.set_red(parent, false);
                return;
            }
            path.len -= 1;
        }
    }

    /// In-order traversal; visits keys ascending.
    pub fn for_each<R: TreeRep>(&self, rep: &R, f: &mut dyn FnMut(usize)) {
        fn walk<R: TreeRep>(rep: &R, node: usize, f: &mut dyn FnMut(usize)) {
            if node == NULL {
                return;
            }
            walk(rep, rep.left(node), f);
            f(node);
            walk(rep, rep.right(node), f);
        }
        walk(rep, self.root, f);
    }

    /// Asserts the red-black shape: root black, no red-red edge, keys
    /// in order, equal black depth on every path.
    pub fn check_invariants<R: TreeRep>(&self, rep: &R) {
        fn check<R: TreeRep>(rep: &R, node: usize, lo: usize, hi: usize) -> usize {
            if node == NULL {
                return 1;
            }
            assert!(node > lo, "key order violated at {:#x}", node);
            assert!(hi == NULL || node < hi, "key order violated at {:#x}", node);

            let left = rep.left(node);
            let right = rep.right(node);
            if rep.is_red(node) {
                assert!(left == NULL || !rep.is_red(left), "red-red edge at {:#x}", node);
                assert!(right == NULL || !rep.is_red(right), "red-red edge at {:#x}", node);
            }

            let lh = check(rep, left, lo, node);
            let rh = check(rep, right, node, hi);
            assert_eq!(lh, rh, "black depth mismatch under {:#x}", node);
            lh + !rep.is_red(node) as usize
        }

        if self.root == NULL {
            return;
        }
        assert!(!rep.is_red(self.root), "root must be black");
        check(rep, self.root, 0, NULL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::collections::{BTreeSet, HashMap};

    #[derive(Default, Clone, Copy)]
    struct TestNode {
        left: usize,
        right: usize,
        red: bool,
    }

    /// A representation that keeps node state in a side table, the way
    /// the pagemap representation keeps it in pagemap entries.
    #[derive(Default)]
    struct TestRep {
        nodes: RefCell<HashMap<usize, TestNode>>,
    }

    impl TestRep {
        fn node(&self, key: usize) -> TestNode {
            *self.nodes.borrow().get(&key).expect("node must exist")
        }

        fn update(&self, key: usize, f: impl FnOnce(&mut TestNode)) {
            f(self.nodes.borrow_mut().entry(key).or_default())
        }
    }

    impl TreeRep for TestRep {
        fn left(&self, node: usize) -> usize {
            self.node(node).left
        }
        fn right(&self, node: usize) -> usize {
            self.node(node).right
        }
        fn set_left(&self, node: usize, link: usize) {
            self.update(node, |n| n.left = link);
        }
        fn set_right(&self, node: usize, link: usize) {
            self.update(node, |n| n.right = link);
        }
        fn is_red(&self, node: usize) -> bool {
            self.node(node).red
        }
        fn set_red(&self, node: usize, red: bool) {
            self.update(node, |n| n.red = red);
        }
    }

    fn contents(tree: &RBTree, rep: &TestRep) -> Vec<usize> {
        let mut keys = Vec::new();
        tree.for_each(rep, &mut |k| keys.push(k));
        keys
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let rep = TestRep::default();
        let mut tree = RBTree::EMPTY;

        for i in 1..=128usize {
            tree.insert(&rep, i * 16);
            tree.check_invariants(&rep);
        }

        let keys = contents(&tree, &rep);
        assert_eq!(keys, (1..=128).map(|i| i * 16).collect::<Vec<_>>());
    }

    #[test]
    fn descending_inserts_stay_balanced() {
        let rep = TestRep::default();
        let mut tree = RBTree::EMPTY;

        for i in (1..=128usize).rev() {
            tree.insert(&rep, i * 16);
            tree.check_invariants(&rep);
        }

        for i in 1..=128usize {
            assert!(tree.find(&rep, i * 16));
        }
        assert!(!tree.find(&rep, 129 * 16));
    }

    #[test]
    fn remove_min_drains_in_order() {
        let rep = TestRep::default();
        let mut tree = RBTree::EMPTY;

        // A scrambled but deterministic insertion order.
        for i in 1..=64usize {
            tree.insert(&rep, ((i * 37) % 67) * 16 + 16);
        }

        let mut last = 0;
        while let Some(min) = tree.remove_min(&rep) {
            assert!(min > last, "remove_min must be ascending");
            last = min;
            tree.check_invariants(&rep);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn remove_interior_nodes() {
        let rep = TestRep::default();
        let mut tree = RBTree::EMPTY;

        for i in 1..=32usize {
            tree.insert(&rep, i * 16);
        }

        // Remove every other key, then the rest, checking shape at
        // each step.
        for i in (2..=32usize).step_by(2) {
            assert!(tree.remove(&rep, i * 16));
            tree.check_invariants(&rep);
        }
        for i in (1..=31usize).step_by(2) {
            assert!(tree.remove(&rep, i * 16));
            tree.check_invariants(&rep);
        }
        assert!(tree.is_empty());
        assert!(!tree.remove(&rep, 16));
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn duplicate_insert_is_fatal() {
        let rep = TestRep::default();
        let mut tree = RBTree::EMPTY;
        tree.insert(&rep, 0x4000);
        tree.insert(&rep, 0x4000);
    }

    proptest! {
        // Random interleavings of insert / remove / remove_min against
        // a BTreeSet model, with the shape checked after every step.
        #[test]
        fn random_ops_match_model(ops in vec((0..3u8, 1..200usize), 1..400)) {
            let rep = TestRep::default();
            let mut tree = RBTree::EMPTY;
            let mut model = BTreeSet::new();

            for (op, raw) in ops {
                let key = raw * 16;
                match op {
                    0 => {
                        if model.insert(key) {
                            tree.insert(&rep, key);
                        }
                    }
                    1 => {
                        let expected = model.remove(&key);
                        prop_assert_eq!(tree.remove(&rep, key), expected);
                    }
                    _ => {
                        let expected = model.iter().next().cloned();
                        if let Some(min) = expected {
                            model.remove(&min);
                        }
                        prop_assert_eq!(tree.remove_min(&rep), expected);
                    }
                }
                tree.check_invariants(&rep);
            }

            let keys = contents(&tree, &rep);
            prop_assert_eq!(keys, model.into_iter().collect::<Vec<_>>());
        }
    }
}
