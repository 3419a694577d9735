use crossbeam_epoch::{Guard, Shared};
use crossbeam_utils::Backoff;

use std::sync::atomic::Ordering;

use super::area::LocalArea;
use super::node::Node;

pub(crate) const MARKER_DEPTH: usize = 4;

/// Ancestors reserved for a pending upward rebalancing, ordered bottom-up.
pub(crate) struct MarkerChain<'g, K, V> {
    nodes: Vec<Shared<'g, Node<K, V>>>,
}

impl<'g, K, V> MarkerChain<'g, K, V> {
    pub(crate) fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn contains(&self, node: Shared<'g, Node<K, V>>) -> bool {
        self.nodes.iter().any(|n| *n == node)
    }

    /// The flag is held for the duration of the marker CAS.
    fn mark_one(&mut self, node: Shared<'g, Node<K, V>>, area: &LocalArea<'g, K, V>) -> bool {
        let node_ref = unsafe { node.deref() };
        if area.contains(node) {
            let marked = node_ref.try_mark();
            debug_assert!(marked);
            self.nodes.push(node);
            return true;
        }
        if !node_ref.try_flag() {
            return false;
        }
        if !node_ref.try_mark() {
            node_ref.unlock();
            return false;
        }
        node_ref.unlock();
        self.nodes.push(node);
        true
    }

    fn mark_one_spin(&mut self, node: Shared<'g, Node<K, V>>, area: &LocalArea<'g, K, V>) {
        let backoff = Backoff::new();
        while !self.mark_one(node, area) {
            backoff.snooze();
        }
    }

    /// On collision the chain is left partially built; the caller must
    /// `release` and retry the whole operation.
    pub(crate) fn reserve(
        &mut self,
        from: Shared<'g, Node<K, V>>,
        area: &LocalArea<'g, K, V>,
        guard: &'g Guard,
    ) -> bool {
        let mut cursor = from;
        for _ in 0..MARKER_DEPTH {
            if cursor.is_null() {
                break;
            }
            if !self.mark_one(cursor, area) {
                return false;
            }
            cursor = unsafe { cursor.deref() }.parent.load(Ordering::SeqCst, guard);
        }
        true
    }

    /// Waiting variant, for an ascent discovered past the last abort point.
    pub(crate) fn reserve_spin(
        &mut self,
        from: Shared<'g, Node<K, V>>,
        area: &LocalArea<'g, K, V>,
        guard: &'g Guard,
    ) {
        let mut cursor = from;
        for _ in 0..MARKER_DEPTH {
            if cursor.is_null() {
                break;
            }
            self.mark_one_spin(cursor, area);
            cursor = unsafe { cursor.deref() }.parent.load(Ordering::SeqCst, guard);
        }
    }

    /// Slides the window one level rootward.
    pub(crate) fn advance_spin(&mut self, area: &LocalArea<'g, K, V>, guard: &'g Guard) {
        if let Some(top) = self.nodes.last() {
            let above = unsafe { top.deref() }.parent.load(Ordering::SeqCst, guard);
            if !above.is_null() && !self.contains(above) {
                self.mark_one_spin(above, area);
            }
        }
        if self.nodes.len() > 1 {
            let lowest = self.nodes.remove(0);
            unsafe { lowest.deref() }.clear_marker();
        }
    }

    pub(crate) fn release(&mut self) {
        for node in self.nodes.drain(..) {
            unsafe { node.deref() }.clear_marker();
        }
    }
}
