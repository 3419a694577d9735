use crossbeam_epoch::{Guard, Shared};
use crossbeam_utils::Backoff;

use std::sync::atomic::Ordering;

use super::marker::MarkerChain;
use super::node::Node;

/// Nodes a writer holds flags on, released in reverse order on unwind.
pub(crate) struct LocalArea<'g, K, V> {
    nodes: Vec<Shared<'g, Node<K, V>>>,
}

impl<'g, K, V> LocalArea<'g, K, V> {
    pub(crate) fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Records a node whose flag the caller already holds.
    pub(crate) fn hold(&mut self, node: Shared<'g, Node<K, V>>) {
        debug_assert!(unsafe { node.deref() }.is_locked());
        self.nodes.push(node);
    }

    pub(crate) fn contains(&self, node: Shared<'g, Node<K, V>>) -> bool {
        self.nodes.iter().any(|n| *n == node)
    }

    /// Another writer's marker counts as a lost flag: release and retry.
    pub(crate) fn acquire(
        &mut self,
        node: Shared<'g, Node<K, V>>,
        chain: &MarkerChain<'g, K, V>,
    ) -> bool {
        let node_ref = unsafe { node.deref() };
        if !node_ref.try_lock() {
            return false;
        }
        if node_ref.is_marked() && !chain.contains(node) {
            node_ref.unlock();
            return false;
        }
        self.nodes.push(node);
        true
    }

    pub(crate) fn extend_delete(
        &mut self,
        focus: Shared<'g, Node<K, V>>,
        chain: &MarkerChain<'g, K, V>,
        guard: &'g Guard,
    ) -> bool {
        let sibling = Node::sibling(focus, guard);
        if sibling.is_null() {
            return true;
        }
        if !self.acquire(sibling, chain) {
            return false;
        }
        let sibling_ref = unsafe { sibling.deref() };
        let sl = sibling_ref.left.load(Ordering::SeqCst, guard);
        if !sl.is_null() && !self.acquire(sl, chain) {
            return false;
        }
        let sr = sibling_ref.right.load(Ordering::SeqCst, guard);
        if !sr.is_null() && !self.acquire(sr, chain) {
            return false;
        }
        true
    }

    /// For the area hand-off of an ascending fixup, which cannot unwind.
    pub(crate) fn acquire_spin(
        &mut self,
        node: Shared<'g, Node<K, V>>,
        chain: &MarkerChain<'g, K, V>,
    ) {
        let backoff = Backoff::new();
        while !self.acquire(node, chain) {
            backoff.snooze();
        }
    }

    pub(crate) fn unacquire(&mut self, node: Shared<'g, Node<K, V>>) {
        if let Some(pos) = self.nodes.iter().position(|n| *n == node) {
            self.nodes.remove(pos);
            unsafe { node.deref() }.unlock();
        }
    }

    /// Removes without unlocking: a detached node keeps its flag set.
    pub(crate) fn forget(&mut self, node: Shared<'g, Node<K, V>>) {
        if let Some(pos) = self.nodes.iter().position(|n| *n == node) {
            self.nodes.remove(pos);
        }
    }

    pub(crate) fn release(&mut self) {
        for node in self.nodes.drain(..).rev() {
            unsafe { node.deref() }.unlock();
        }
    }

    pub(crate) fn release_except(&mut self, keep: &[Shared<'g, Node<K, V>>]) {
        let nodes = std::mem::take(&mut self.nodes);
        for node in nodes.iter().rev() {
            if !keep.contains(node) {
                unsafe { node.deref() }.unlock();
            }
        }
        self.nodes = nodes.into_iter().filter(|n| keep.contains(n)).collect();
    }
}
