//! A concurrent red-black tree. Writers own bounded local areas through
//! per-node flags, reserve their pending rebalancing paths with ancestor
//! markers, and readers traverse under per-node reader counts; every
//! conflict unwinds to a top-level retry with jittered back-off.

mod area;
mod check;
mod maintain;
mod marker;
mod node;

pub use self::check::CheckError;

use crossbeam_epoch::{unprotected, Atomic, Guard, Owned, Shared};
use rand::Rng;
use scopeguard::defer;

use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use self::area::LocalArea;
use self::marker::MarkerChain;
use self::node::{Color, Direction, Node};
use crate::concurrent_map::ConcurrentMap;

/// Conflict signal internal to the retry loops. Never observable through
/// the public API.
struct Conflict;

const INSERT_BACKOFF_MICROS: u64 = 100;
const REMOVE_BACKOFF_MICROS: u64 = 50;
const GET_BACKOFF_MICROS: u64 = 10;

/// Sleeps around `base` microseconds with roughly ±40% jitter, so that
/// colliding operations drift apart instead of retrying in lockstep.
fn backoff(base: u64) {
    let jitter = base * 2 / 5;
    let micros = rand::thread_rng().gen_range(base - jitter..=base + jitter);
    std::thread::sleep(Duration::from_micros(micros));
}

/// An ordered map on a red-black tree supporting concurrent `insert`,
/// `remove` and `get` without a tree-wide lock.
pub struct RBTree<K, V> {
    root: Atomic<Node<K, V>>,
    count: AtomicUsize,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Sync for RBTree<K, V> {}
unsafe impl<K: Send, V: Send> Send for RBTree<K, V> {}

impl<K, V> RBTree<K, V> {
    /// Creates a tree holding the single entry `(key, value)`.
    pub fn new(key: K, value: V) -> Self {
        Self {
            root: Atomic::new(Node::new(key, value, Color::Black)),
            count: AtomicUsize::new(1),
        }
    }

    /// Number of live entries. Maintained by writers as a convenience;
    /// not synchronized with concurrent observers.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> RBTree<K, V>
where
    K: Ord,
    V: Clone,
{
    /// Looks up `key`, retrying with back-off whenever the descent runs
    /// into a flagged node.
    pub fn get(&self, key: &K, guard: &Guard) -> Option<V> {
        loop {
            match self.try_get(key, guard) {
                Ok(found) => return found,
                Err(Conflict) => backoff(GET_BACKOFF_MICROS),
            }
        }
    }

    fn try_get(&self, key: &K, guard: &Guard) -> Result<Option<V>, Conflict> {
        let root = self.root.load(Ordering::SeqCst, guard);
        let root_ref = match unsafe { root.as_ref() } {
            None => return Ok(None),
            Some(r) => r,
        };
        if !root_ref.start_read() {
            return Err(Conflict);
        }
        defer! {
            root_ref.end_read();
        }
        // a rotation may have replaced the root between the load and the
        // count increment; the demoted node no longer spans the whole
        // key range
        if self.root.load(Ordering::SeqCst, guard) != root {
            return Err(Conflict);
        }
        self.read_from(root_ref, key, guard)
    }

    /// One step of the reader descent: the counter is taken before the
    /// flag is examined, mirroring the writers' flag-then-counter order,
    /// so a race between the two fails on at least one side.
    fn read_from(&self, node: &Node<K, V>, key: &K, guard: &Guard) -> Result<Option<V>, Conflict> {
        let child = match key.cmp(node.key()) {
            cmp::Ordering::Equal => return Ok(Some(node.value().clone())),
            cmp::Ordering::Less => node.left.load(Ordering::SeqCst, guard),
            cmp::Ordering::Greater => node.right.load(Ordering::SeqCst, guard),
        };
        let child_ref = match unsafe { child.as_ref() } {
            None => return Ok(None),
            Some(c) => c,
        };
        if !child_ref.start_read() {
            return Err(Conflict);
        }
        defer! {
            child_ref.end_read();
        }
        self.read_from(child_ref, key, guard)
    }

    /// Inserts `key`, overwriting the value in place if it is already
    /// present.
    pub fn insert(&self, key: K, value: V, guard: &Guard) {
        let mut item = (key, value);
        loop {
            match self.try_insert(item.0, item.1, guard) {
                Ok(()) => return,
                Err(back) => {
                    item = back;
                    backoff(INSERT_BACKOFF_MICROS);
                }
            }
        }
    }

    fn try_insert(&self, key: K, value: V, guard: &Guard) -> Result<(), (K, V)> {
        let root = self.root.load(Ordering::SeqCst, guard);
        if root.is_null() {
            // empty tree: the linking CAS is the whole commit
            let new = Owned::new(Node::new(key, value, Color::Black));
            return match self.root.compare_exchange(
                Shared::null(),
                new,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            ) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Err(e) => Err(e.new.into_box().into_payload()),
            };
        }
        let root_ref = unsafe { root.deref() };
        if !root_ref.try_lock() {
            return Err((key, value));
        }
        if self.root.load(Ordering::SeqCst, guard) != root {
            root_ref.unlock();
            return Err((key, value));
        }
        // hand-over-hand descent holding one flag at a time
        let mut current = root;
        loop {
            let cur_ref = unsafe { current.deref() };
            let dir = match key.cmp(cur_ref.key()) {
                cmp::Ordering::Equal => {
                    cur_ref.set_value(value);
                    cur_ref.unlock();
                    return Ok(());
                }
                cmp::Ordering::Less => Direction::Left,
                cmp::Ordering::Greater => Direction::Right,
            };
            let child = cur_ref.child(dir, guard);
            if child.is_null() {
                return self.attach(current, dir, key, value, guard);
            }
            if !unsafe { child.deref() }.try_lock() {
                cur_ref.unlock();
                return Err((key, value));
            }
            cur_ref.unlock();
            current = child;
        }
    }

    /// Links a fresh red leaf under `parent` (whose flag the caller
    /// holds). Under a black parent the link itself is the commit; under
    /// a red parent the rebalancing area is assembled first, so the link
    /// only happens once the repair is guaranteed to run.
    fn attach<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        dir: Direction,
        key: K,
        value: V,
        guard: &'g Guard,
    ) -> Result<(), (K, V)> {
        let p_ref = unsafe { parent.deref() };
        if p_ref.color() == Color::Black {
            let new = Owned::new(Node::new(key, value, Color::Red));
            new.parent.store(parent, Ordering::SeqCst);
            let leaf = new.into_shared(guard);
            match dir {
                Direction::Left => p_ref.left.store(leaf, Ordering::SeqCst),
                Direction::Right => p_ref.right.store(leaf, Ordering::SeqCst),
                Direction::Root => unreachable!(),
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            p_ref.unlock();
            return Ok(());
        }

        let mut tree_area = LocalArea::new();
        let mut chain = MarkerChain::new();
        tree_area.hold(parent);
        let sibling = p_ref.child(dir.opposite(), guard);
        if !sibling.is_null() && !tree_area.acquire(sibling, &chain) {
            tree_area.release();
            return Err((key, value));
        }
        // a red parent is never the root; lock the grandparent and
        // re-validate the edge, which is only stable under its flag
        let gp = p_ref.parent.load(Ordering::SeqCst, guard);
        if gp.is_null() || !tree_area.acquire(gp, &chain) {
            tree_area.release();
            return Err((key, value));
        }
        if p_ref.parent.load(Ordering::SeqCst, guard) != gp {
            tree_area.release();
            return Err((key, value));
        }
        let uncle = Node::sibling(parent, guard);
        if !uncle.is_null() && !tree_area.acquire(uncle, &chain) {
            tree_area.release();
            return Err((key, value));
        }
        if Node::is_red(uncle) {
            // a red uncle means the repair will recolor and ascend;
            // reserve the ancestor cone while failing is still cheap
            let above = unsafe { gp.deref() }.parent.load(Ordering::SeqCst, guard);
            if !chain.reserve(above, &tree_area, guard) {
                tree_area.release();
                chain.release();
                return Err((key, value));
            }
        }

        let new = Owned::new(Node::new(key, value, Color::Red));
        new.parent.store(parent, Ordering::SeqCst);
        let leaf = new.into_shared(guard);
        // the leaf is unreachable until the link below, so its flag CAS
        // cannot be contended
        let locked = unsafe { leaf.deref() }.try_lock();
        debug_assert!(locked);
        tree_area.hold(leaf);
        match dir {
            Direction::Left => p_ref.left.store(leaf, Ordering::SeqCst),
            Direction::Right => p_ref.right.store(leaf, Ordering::SeqCst),
            Direction::Root => unreachable!(),
        }
        self.count.fetch_add(1, Ordering::SeqCst);

        self.fixup_insert(leaf, &mut tree_area, &mut chain, guard);
        tree_area.release();
        chain.release();
        Ok(())
    }

    /// Removes `key`, returning the prior value if it was present.
    pub fn remove(&self, key: &K, guard: &Guard) -> Option<V> {
        loop {
            match self.try_remove(key, guard) {
                Ok(prior) => return prior,
                Err(Conflict) => backoff(REMOVE_BACKOFF_MICROS),
            }
        }
    }

    fn try_remove(&self, key: &K, guard: &Guard) -> Result<Option<V>, Conflict> {
        let root = self.root.load(Ordering::SeqCst, guard);
        let root_ref = match unsafe { root.as_ref() } {
            None => return Ok(None),
            Some(r) => r,
        };
        if !root_ref.try_lock() {
            return Err(Conflict);
        }
        if self.root.load(Ordering::SeqCst, guard) != root {
            root_ref.unlock();
            return Err(Conflict);
        }
        // descend keeping the current node and its parent flagged
        let mut parent: Shared<'_, Node<K, V>> = Shared::null();
        let mut current = root;
        loop {
            let cur_ref = unsafe { current.deref() };
            let dir = match key.cmp(cur_ref.key()) {
                cmp::Ordering::Equal => break,
                cmp::Ordering::Less => Direction::Left,
                cmp::Ordering::Greater => Direction::Right,
            };
            let child = cur_ref.child(dir, guard);
            if child.is_null() {
                cur_ref.unlock();
                if let Some(p) = unsafe { parent.as_ref() } {
                    p.unlock();
                }
                return Ok(None);
            }
            if !unsafe { child.deref() }.try_lock() {
                cur_ref.unlock();
                if let Some(p) = unsafe { parent.as_ref() } {
                    p.unlock();
                }
                return Err(Conflict);
            }
            if let Some(p) = unsafe { parent.as_ref() } {
                p.unlock();
            }
            parent = current;
            current = child;
        }

        let v_ref = unsafe { current.deref() };
        let prior = v_ref.value().clone();
        let mut tree_area = LocalArea::new();
        let mut chain = MarkerChain::new();
        if !parent.is_null() {
            tree_area.hold(parent);
        }
        tree_area.hold(current);

        let left = v_ref.left.load(Ordering::SeqCst, guard);
        let right = v_ref.right.load(Ordering::SeqCst, guard);
        if !left.is_null() && !right.is_null() {
            // binary node: swap with the in-order successor and retarget
            // the physical removal there
            let (succ_parent, succ) = match self.lock_successor(current, right, guard) {
                Some(pair) => pair,
                None => {
                    tree_area.release();
                    return Err(Conflict);
                }
            };
            if succ_parent != current {
                tree_area.hold(succ_parent);
            }
            tree_area.hold(succ);
            if !tree_area.extend_delete(succ, &chain, guard) {
                tree_area.release();
                return Err(Conflict);
            }
            // grandparent of the removal focus: rotations around the
            // focus' parent rewire its child slot
            let sp_ref = unsafe { succ_parent.deref() };
            let sgp = sp_ref.parent.load(Ordering::SeqCst, guard);
            if !sgp.is_null() && !tree_area.contains(sgp) {
                if !tree_area.acquire(sgp, &chain) {
                    tree_area.release();
                    return Err(Conflict);
                }
                if sp_ref.parent.load(Ordering::SeqCst, guard) != sgp {
                    tree_area.release();
                    return Err(Conflict);
                }
            }
            if !chain.reserve(sgp, &tree_area, guard) {
                tree_area.release();
                chain.release();
                return Err(Conflict);
            }

            v_ref.swap_payload(unsafe { succ.deref() });

            let succ_ref = unsafe { succ.deref() };
            let succ_right = succ_ref.right.load(Ordering::SeqCst, guard);
            let succ_dir = Node::dir(succ, guard);
            // the detached node keeps its flag past the release below:
            // late readers holding a stale pointer retry instead of
            // descending a dead subtree
            tree_area.forget(succ);
            if !succ_right.is_null() {
                // black successor with a red child: splice and recolor
                self.unlink(succ, succ_parent, succ_right, guard);
                unsafe { succ_right.deref() }.set_color(Color::Black);
            } else if succ_ref.color() == Color::Black {
                self.unlink(succ, succ_parent, Shared::null(), guard);
                self.fixup_delete(succ_parent, succ_dir, &mut tree_area, &mut chain, guard);
            } else {
                self.unlink(succ, succ_parent, Shared::null(), guard);
            }
            self.count.fetch_sub(1, Ordering::SeqCst);
            tree_area.release();
            chain.release();
            unsafe { guard.defer_destroy(succ) };
            return Ok(Some(prior));
        }

        // at most one child
        if !tree_area.extend_delete(current, &chain, guard) {
            tree_area.release();
            return Err(Conflict);
        }
        let gp = if parent.is_null() {
            Shared::null()
        } else {
            unsafe { parent.deref() }.parent.load(Ordering::SeqCst, guard)
        };
        if !chain.reserve(gp, &tree_area, guard) {
            tree_area.release();
            chain.release();
            return Err(Conflict);
        }

        let child = if left.is_null() { right } else { left };
        tree_area.forget(current);
        if !child.is_null() {
            self.unlink(current, parent, child, guard);
            unsafe { child.deref() }.set_color(Color::Black);
        } else if v_ref.color() == Color::Black && !parent.is_null() {
            let dir = Node::dir(current, guard);
            self.unlink(current, parent, Shared::null(), guard);
            self.fixup_delete(parent, dir, &mut tree_area, &mut chain, guard);
        } else {
            // red leaf, or black leaf at the root
            self.unlink(current, parent, Shared::null(), guard);
        }
        self.count.fetch_sub(1, Ordering::SeqCst);
        tree_area.release();
        chain.release();
        unsafe { guard.defer_destroy(current) };
        Ok(Some(prior))
    }

    /// Descends to the leftmost node of the right subtree with
    /// hand-over-hand flag acquisition, returning the successor and its
    /// flagged parent. `None` is a conflict; every flag taken here has
    /// been released again.
    fn lock_successor<'g>(
        &self,
        v: Shared<'g, Node<K, V>>,
        right: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> Option<(Shared<'g, Node<K, V>>, Shared<'g, Node<K, V>>)> {
        if !unsafe { right.deref() }.try_lock() {
            return None;
        }
        let mut succ_parent = v;
        let mut succ = right;
        loop {
            let s_ref = unsafe { succ.deref() };
            let next = s_ref.left.load(Ordering::SeqCst, guard);
            if next.is_null() {
                return Some((succ_parent, succ));
            }
            if !unsafe { next.deref() }.try_lock() {
                s_ref.unlock();
                if succ_parent != v {
                    unsafe { succ_parent.deref() }.unlock();
                }
                return None;
            }
            if succ_parent != v {
                unsafe { succ_parent.deref() }.unlock();
            }
            succ_parent = succ;
            succ = next;
        }
    }

    /// Replaces `node` by `replacement` (possibly null) under `parent`.
    /// The caller holds the flags of `node` and `parent`.
    fn unlink<'g>(
        &self,
        node: Shared<'g, Node<K, V>>,
        parent: Shared<'g, Node<K, V>>,
        replacement: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) {
        match Node::dir(node, guard) {
            Direction::Root => self.root.store(replacement, Ordering::SeqCst),
            Direction::Left => unsafe { parent.deref() }.left.store(replacement, Ordering::SeqCst),
            Direction::Right => {
                unsafe { parent.deref() }.right.store(replacement, Ordering::SeqCst)
            }
        }
        if let Some(r) = unsafe { replacement.as_ref() } {
            r.parent.store(parent, Ordering::SeqCst);
        }
    }
}

impl<K, V> ConcurrentMap<K, V> for RBTree<K, V>
where
    K: Ord,
    V: Clone,
{
    fn new(key: K, value: V) -> Self {
        RBTree::new(key, value)
    }

    fn get(&self, key: &K, guard: &Guard) -> Option<V> {
        self.get(key, guard)
    }

    fn insert(&self, key: K, value: V, guard: &Guard) {
        self.insert(key, value, guard)
    }

    fn remove(&self, key: &K, guard: &Guard) -> Option<V> {
        self.remove(key, guard)
    }
}

impl<K, V> Drop for RBTree<K, V> {
    fn drop(&mut self) {
        unsafe {
            let guard = unprotected();
            let mut stack = vec![self.root.load(Ordering::Relaxed, guard)];
            while let Some(node) = stack.pop() {
                if node.is_null() {
                    continue;
                }
                let node_ref = node.deref();
                stack.push(node_ref.left.load(Ordering::Relaxed, guard));
                stack.push(node_ref.right.load(Ordering::Relaxed, guard));
                drop(node.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::node::{Color, Node};
    use super::RBTree;
    use crate::concurrent_map::tests as map_tests;
    use crossbeam_epoch::{pin, Guard, Shared};
    use crossbeam_utils::thread;
    use rand::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn inorder<K: Ord + Clone, V>(tree: &RBTree<K, V>) -> Vec<K> {
        fn walk<K: Ord + Clone, V>(node: Shared<'_, Node<K, V>>, out: &mut Vec<K>, guard: &Guard) {
            if let Some(n) = unsafe { node.as_ref() } {
                walk(n.left.load(Ordering::SeqCst, guard), out, guard);
                out.push(n.key().clone());
                walk(n.right.load(Ordering::SeqCst, guard), out, guard);
            }
        }
        let guard = pin();
        let mut out = Vec::new();
        walk(tree.root.load(Ordering::SeqCst, &guard), &mut out, &guard);
        out
    }

    fn color_of<K: Ord, V>(tree: &RBTree<K, V>, key: &K) -> Option<Color> {
        let guard = pin();
        let mut node = tree.root.load(Ordering::SeqCst, &guard);
        while let Some(n) = unsafe { node.as_ref() } {
            node = match key.cmp(n.key()) {
                std::cmp::Ordering::Equal => return Some(n.color()),
                std::cmp::Ordering::Less => n.left.load(Ordering::SeqCst, &guard),
                std::cmp::Ordering::Greater => n.right.load(Ordering::SeqCst, &guard),
            };
        }
        None
    }

    fn root_key<K: Ord + Clone, V>(tree: &RBTree<K, V>) -> Option<K> {
        let guard = pin();
        unsafe { tree.root.load(Ordering::SeqCst, &guard).as_ref() }.map(|n| n.key().clone())
    }

    #[test]
    fn build_small_balanced() {
        let guard = pin();
        let tree = RBTree::new(1, "a");
        tree.insert(0, "b", &guard);
        tree.insert(2, "c", &guard);
        assert_eq!(inorder(&tree), vec![0, 1, 2]);
        assert_eq!(color_of(&tree, &1), Some(Color::Black));
        assert_eq!(color_of(&tree, &0), Some(Color::Red));
        assert_eq!(color_of(&tree, &2), Some(Color::Red));
        assert_eq!(tree.check(&guard), Ok(()));
    }

    #[test]
    fn red_uncle_recolors() {
        let guard = pin();
        let tree = RBTree::new(2, 2);
        tree.insert(1, 1, &guard);
        tree.insert(3, 3, &guard);
        tree.insert(0, 0, &guard);
        assert_eq!(root_key(&tree), Some(2));
        assert_eq!(color_of(&tree, &2), Some(Color::Black));
        assert_eq!(color_of(&tree, &1), Some(Color::Black));
        assert_eq!(color_of(&tree, &3), Some(Color::Black));
        assert_eq!(color_of(&tree, &0), Some(Color::Red));
        assert_eq!(tree.check(&guard), Ok(()));
    }

    #[test]
    fn remove_root_retargets_successor() {
        let guard = pin();
        let tree = RBTree::new(2, 2);
        tree.insert(1, 1, &guard);
        tree.insert(3, 3, &guard);
        tree.insert(0, 0, &guard);
        assert_eq!(tree.remove(&2, &guard), Some(2));
        assert_eq!(tree.get(&2, &guard), None);
        assert_eq!(tree.len(), 3);
        assert_eq!(inorder(&tree), vec![0, 1, 3]);
        assert_eq!(tree.check(&guard), Ok(()));
    }

    #[test]
    fn descending_chain_rebalances() {
        let guard = pin();
        let tree = RBTree::new(3, ());
        tree.insert(2, (), &guard);
        tree.insert(1, (), &guard);
        assert_eq!(root_key(&tree), Some(2));
        assert_eq!(color_of(&tree, &1), Some(Color::Red));
        assert_eq!(color_of(&tree, &3), Some(Color::Red));
        assert_eq!(inorder(&tree), vec![1, 2, 3]);
        assert_eq!(tree.check(&guard), Ok(()));
    }

    #[test]
    fn overwrite_keeps_count() {
        let guard = pin();
        let tree = RBTree::new(1, "x");
        tree.insert(7, "v1", &guard);
        let count = tree.len();
        tree.insert(7, "v2", &guard);
        assert_eq!(tree.get(&7, &guard), Some("v2"));
        assert_eq!(tree.len(), count);
    }

    #[test]
    fn remove_missing_is_none() {
        let guard = pin();
        let tree = RBTree::new(5, 5);
        tree.insert(3, 3, &guard);
        tree.insert(8, 8, &guard);
        let before = inorder(&tree);
        assert_eq!(tree.remove(&42, &guard), None);
        assert_eq!(inorder(&tree), before);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn drain_to_empty_and_refill() {
        let guard = pin();
        let tree = RBTree::new(10, 10);
        for k in [5, 15, 3, 7] {
            tree.insert(k, k, &guard);
        }
        for k in [10, 5, 15, 3, 7] {
            assert_eq!(tree.remove(&k, &guard), Some(k));
        }
        assert!(tree.is_empty());
        assert!(tree.root.load(Ordering::SeqCst, &guard).is_null());
        tree.insert(1, 1, &guard);
        assert_eq!(tree.get(&1, &guard), Some(1));
        assert_eq!(tree.check(&guard), Ok(()));
    }

    #[test]
    fn fill_then_drain_random() {
        let guard = pin();
        let mut rng = rand::thread_rng();
        let tree = RBTree::new(i64::MIN, i64::MIN);
        let mut keys: Vec<i64> = Vec::new();
        while keys.len() < 1000 {
            let k = rng.gen();
            tree.insert(k, k, &guard);
            if tree.check(&guard) != Ok(()) {
                panic!("invariants broken after inserting {k}:\n{tree}");
            }
            keys.push(k);
        }
        keys.push(i64::MIN);
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(inorder(&tree), keys);
        assert_eq!(tree.len(), keys.len());

        keys.shuffle(&mut rng);
        for k in &keys {
            assert_eq!(tree.remove(k, &guard), Some(*k));
            if tree.check(&guard) != Ok(()) {
                panic!("invariants broken after removing {k}:\n{tree}");
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn smoke_rbtree() {
        map_tests::smoke::<_, RBTree<i32, String>, _>(&|k| k.to_string());
    }

    #[test]
    fn concurrent_churn_settles() {
        const THREADS: i64 = 8;
        const KEYS_PER_THREAD: i64 = 500;

        let tree = &RBTree::new(-1, -1);
        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i64> =
                        (0..KEYS_PER_THREAD).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    // every key goes in; odd keys come straight back out
                    for k in keys {
                        tree.insert(k, k, &pin());
                        if k % 2 == 1 {
                            assert_eq!(tree.remove(&k, &pin()), Some(k));
                        }
                    }
                });
            }
        })
        .unwrap();

        let guard = pin();
        assert_eq!(tree.check(&guard), Ok(()));
        let mut expected: Vec<i64> = (0..THREADS * KEYS_PER_THREAD).filter(|k| k % 2 == 0).collect();
        expected.push(-1);
        expected.sort_unstable();
        assert_eq!(inorder(tree), expected);
        assert_eq!(tree.len(), expected.len());
        for k in expected {
            assert_eq!(tree.get(&k, &guard), Some(k));
        }
    }

    #[test]
    fn readers_race_writers() {
        const WRITERS: i64 = 4;
        const READERS: i64 = 4;
        const KEYS: i64 = 2000;

        let tree = &RBTree::new(-1, -1);
        thread::scope(|s| {
            for t in 0..WRITERS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i64> = (0..KEYS).filter(|k| k % WRITERS == t).collect();
                    keys.shuffle(&mut rng);
                    for k in keys {
                        tree.insert(k, k, &pin());
                    }
                });
            }
            for _ in 0..READERS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    for _ in 0..KEYS {
                        let k = rng.gen_range(0..KEYS);
                        // a hit must carry the right value; a miss just
                        // means the insert has not landed yet
                        if let Some(v) = tree.get(&k, &pin()) {
                            assert_eq!(v, k);
                        }
                    }
                });
            }
        })
        .unwrap();

        let guard = pin();
        assert_eq!(tree.check(&guard), Ok(()));
        for k in 0..KEYS {
            assert_eq!(tree.get(&k, &guard), Some(k));
        }
    }

    #[test]
    fn display_dump_shape() {
        let guard = pin();
        let tree = RBTree::new(1, 1);
        tree.insert(0, 0, &guard);
        tree.insert(2, 2, &guard);
        let dump = format!("{tree}");
        assert!(dump.contains("key: 1"));
        assert!(dump.contains("L-> "));
        assert!(dump.contains("R-> "));
    }

    #[test]
    fn final_state_matches_bookkeeping() {
        let guard = pin();
        let mut rng = rand::thread_rng();
        let tree = RBTree::new(0u32, "root".to_owned());
        let mut model: HashMap<u32, String> = HashMap::new();
        model.insert(0, "root".to_owned());
        for _ in 0..5000 {
            let k = rng.gen_range(0..512);
            if rng.gen_bool(0.5) {
                let v = k.to_string();
                tree.insert(k, v.clone(), &guard);
                model.insert(k, v);
            } else {
                assert_eq!(tree.remove(&k, &guard), model.remove(&k));
            }
            assert_eq!(tree.check(&guard), Ok(()));
        }
        for (k, v) in &model {
            assert_eq!(tree.get(k, &guard).as_ref(), Some(v));
        }
        assert_eq!(tree.len(), model.len());
    }
}
