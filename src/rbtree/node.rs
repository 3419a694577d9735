use crossbeam_epoch::{Atomic, Guard, Shared};

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Color {
    Red,
    Black,
}

impl Color {
    fn from_u8(raw: u8) -> Self {
        if raw == 0 {
            Color::Red
        } else {
            Color::Black
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Color::Red => 0,
            Color::Black => 1,
        }
    }
}

/// Position of a node relative to its parent.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Direction {
    Root,
    Left,
    Right,
}

impl Direction {
    pub(crate) fn opposite(self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
            Direction::Root => Direction::Root,
        }
    }
}

/// A tree node. `key` and `value` are written only by the holder of this
/// node's writer flag; links are written only by writers holding the flags
/// of every node whose child pointer they touch.
pub(crate) struct Node<K, V> {
    key: UnsafeCell<K>,
    value: UnsafeCell<V>,
    color: AtomicU8,
    pub(crate) parent: Atomic<Node<K, V>>,
    pub(crate) left: Atomic<Node<K, V>>,
    pub(crate) right: Atomic<Node<K, V>>,
    /// Writer flag: exclusive mutation right on this node.
    flag: AtomicBool,
    /// Count of readers currently positioned at this node.
    readers: AtomicU32,
    /// Reservation for a pending upward rebalancing; grants refusal
    /// rights only.
    marker: AtomicBool,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(key: K, value: V, color: Color) -> Self {
        Self {
            key: UnsafeCell::new(key),
            value: UnsafeCell::new(value),
            color: AtomicU8::new(color.as_u8()),
            parent: Atomic::null(),
            left: Atomic::null(),
            right: Atomic::null(),
            flag: AtomicBool::new(false),
            readers: AtomicU32::new(0),
            marker: AtomicBool::new(false),
        }
    }

    /// Recovers the payload of a node that was never published.
    pub(crate) fn into_payload(self) -> (K, V) {
        (self.key.into_inner(), self.value.into_inner())
    }

    pub(crate) fn key(&self) -> &K {
        unsafe { &*self.key.get() }
    }

    pub(crate) fn value(&self) -> &V {
        unsafe { &*self.value.get() }
    }

    /// Caller must hold this node's writer flag.
    pub(crate) fn set_value(&self, value: V) {
        unsafe { *self.value.get() = value };
    }

    /// Exchanges key and value with `other`. Caller must hold the writer
    /// flags of both nodes.
    pub(crate) fn swap_payload(&self, other: &Self) {
        unsafe {
            std::ptr::swap(self.key.get(), other.key.get());
            std::ptr::swap(self.value.get(), other.value.get());
        }
    }

    pub(crate) fn color(&self) -> Color {
        Color::from_u8(self.color.load(Ordering::SeqCst))
    }

    pub(crate) fn set_color(&self, color: Color) {
        self.color.store(color.as_u8(), Ordering::SeqCst);
    }

    /// Tries to take the writer flag. The flag is taken first and the
    /// reader count inspected after; a positive count releases the flag
    /// and reports failure. Paired with the readers' increment-then-check,
    /// at least one side of any race observes the other.
    pub(crate) fn try_lock(&self) -> bool {
        if self
            .flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if self.readers.load(Ordering::SeqCst) > 0 {
            self.flag.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Flag CAS without the reader check. Used for the transient hold
    /// while publishing a marker; readers never observe markers.
    pub(crate) fn try_flag(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Announces a reader at this node. Fails (undoing the count) if a
    /// writer holds or wins the flag concurrently.
    pub(crate) fn start_read(&self) -> bool {
        self.readers.fetch_add(1, Ordering::SeqCst);
        if self.flag.load(Ordering::SeqCst) {
            self.readers.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn end_read(&self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn try_mark(&self) -> bool {
        self.marker
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn clear_marker(&self) {
        self.marker.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.marker.load(Ordering::SeqCst)
    }

    pub(crate) fn is_red(node: Shared<'_, Self>) -> bool {
        unsafe { node.as_ref() }.map_or(false, |n| n.color() == Color::Red)
    }

    /// Null children count as black.
    pub(crate) fn is_black(node: Shared<'_, Self>) -> bool {
        unsafe { node.as_ref() }.map_or(true, |n| n.color() == Color::Black)
    }

    pub(crate) fn dir<'g>(node: Shared<'g, Self>, guard: &'g Guard) -> Direction {
        let node_ref = unsafe { node.deref() };
        let parent = node_ref.parent.load(Ordering::SeqCst, guard);
        match unsafe { parent.as_ref() } {
            None => Direction::Root,
            Some(p) => {
                if p.left.load(Ordering::SeqCst, guard) == node {
                    Direction::Left
                } else {
                    Direction::Right
                }
            }
        }
    }

    pub(crate) fn child<'g>(&self, dir: Direction, guard: &'g Guard) -> Shared<'g, Self> {
        match dir {
            Direction::Left => self.left.load(Ordering::SeqCst, guard),
            Direction::Right => self.right.load(Ordering::SeqCst, guard),
            Direction::Root => panic!("root is not a child direction"),
        }
    }

    pub(crate) fn sibling<'g>(node: Shared<'g, Self>, guard: &'g Guard) -> Shared<'g, Self> {
        let node_ref = unsafe { node.deref() };
        let parent = node_ref.parent.load(Ordering::SeqCst, guard);
        match unsafe { parent.as_ref() } {
            None => Shared::null(),
            Some(p) => match Self::dir(node, guard) {
                Direction::Left => p.right.load(Ordering::SeqCst, guard),
                Direction::Right => p.left.load(Ordering::SeqCst, guard),
                Direction::Root => unreachable!(),
            },
        }
    }

    pub(crate) fn uncle<'g>(node: Shared<'g, Self>, guard: &'g Guard) -> Shared<'g, Self> {
        let node_ref = unsafe { node.deref() };
        let parent = node_ref.parent.load(Ordering::SeqCst, guard);
        if parent.is_null() {
            return Shared::null();
        }
        Self::sibling(parent, guard)
    }
}

#[cfg(test)]
mod tests {
    use super::{Color, Node};

    #[test]
    fn flag_excludes_reader() {
        let node = Node::new(1, 1, Color::Red);
        assert!(node.try_lock());
        assert!(!node.start_read());
        node.unlock();
        assert!(node.start_read());
        assert!(!node.try_lock());
        node.end_read();
        assert!(node.try_lock());
    }

    #[test]
    fn marker_is_exclusive() {
        let node = Node::new(1, 1, Color::Black);
        assert!(node.try_mark());
        assert!(!node.try_mark());
        node.clear_marker();
        assert!(node.try_mark());
    }
}
