use crossbeam_epoch::{Guard, Shared};

use std::sync::atomic::Ordering;

use super::area::LocalArea;
use super::marker::MarkerChain;
use super::node::{Color, Direction, Node};
use super::RBTree;

impl<K, V> RBTree<K, V> {
    /// Left rotation around `n`:
    ///
    /// ```text
    ///   |                       |
    ///   N                       S
    ///  / \     l-rotate(N)     / \
    /// L   S    ==========>    N   R
    ///    / \                 / \
    ///   M   R               L   M
    /// ```
    ///
    /// The caller holds the flags of `n`, its right child, and `n`'s
    /// parent. Markers on the three nodes whose parent/child relation
    /// changes are cleared: they name positions the rotation invalidates.
    pub(crate) fn rotate_left<'g>(&self, n: Shared<'g, Node<K, V>>, guard: &'g Guard) {
        let n_ref = unsafe { n.deref() };
        let new_top = n_ref.right.load(Ordering::SeqCst, guard);
        if new_top.is_null() {
            return;
        }
        let top_ref = unsafe { new_top.deref() };
        let dir = Node::dir(n, guard);
        let parent = n_ref.parent.load(Ordering::SeqCst, guard);

        n_ref.clear_marker();
        top_ref.clear_marker();
        if let Some(p_ref) = unsafe { parent.as_ref() } {
            p_ref.clear_marker();
        }

        let mid = top_ref.left.load(Ordering::SeqCst, guard);
        n_ref.right.store(mid, Ordering::SeqCst);
        if let Some(mid_ref) = unsafe { mid.as_ref() } {
            mid_ref.parent.store(n, Ordering::SeqCst);
        }
        top_ref.left.store(n, Ordering::SeqCst);
        n_ref.parent.store(new_top, Ordering::SeqCst);
        top_ref.parent.store(parent, Ordering::SeqCst);
        match dir {
            Direction::Root => self.root.store(new_top, Ordering::SeqCst),
            Direction::Left => unsafe { parent.deref() }.left.store(new_top, Ordering::SeqCst),
            Direction::Right => unsafe { parent.deref() }.right.store(new_top, Ordering::SeqCst),
        }
    }

    /// Mirror of [`rotate_left`](Self::rotate_left).
    pub(crate) fn rotate_right<'g>(&self, n: Shared<'g, Node<K, V>>, guard: &'g Guard) {
        let n_ref = unsafe { n.deref() };
        let new_top = n_ref.left.load(Ordering::SeqCst, guard);
        if new_top.is_null() {
            return;
        }
        let top_ref = unsafe { new_top.deref() };
        let dir = Node::dir(n, guard);
        let parent = n_ref.parent.load(Ordering::SeqCst, guard);

        n_ref.clear_marker();
        top_ref.clear_marker();
        if let Some(p_ref) = unsafe { parent.as_ref() } {
            p_ref.clear_marker();
        }

        let mid = top_ref.right.load(Ordering::SeqCst, guard);
        n_ref.left.store(mid, Ordering::SeqCst);
        if let Some(mid_ref) = unsafe { mid.as_ref() } {
            mid_ref.parent.store(n, Ordering::SeqCst);
        }
        top_ref.right.store(n, Ordering::SeqCst);
        n_ref.parent.store(new_top, Ordering::SeqCst);
        top_ref.parent.store(parent, Ordering::SeqCst);
        match dir {
            Direction::Root => self.root.store(new_top, Ordering::SeqCst),
            Direction::Left => unsafe { parent.deref() }.left.store(new_top, Ordering::SeqCst),
            Direction::Right => unsafe { parent.deref() }.right.store(new_top, Ordering::SeqCst),
        }
    }

    fn rotate(&self, n: Shared<'_, Node<K, V>>, toward: Direction, guard: &Guard) {
        match toward {
            Direction::Left => self.rotate_left(n, guard),
            Direction::Right => self.rotate_right(n, guard),
            Direction::Root => unreachable!(),
        }
    }

    /// Locks `child`'s parent into the area, re-validating the edge after
    /// the lock: a parent link is only stable while the parent's own flag
    /// is held, so the read is repeated until it survives the
    /// acquisition. Waits out transient holders; the fixups that call
    /// this are past their last abort point.
    pub(crate) fn acquire_parent_spin<'g>(
        &self,
        child: Shared<'g, Node<K, V>>,
        area: &mut LocalArea<'g, K, V>,
        chain: &MarkerChain<'g, K, V>,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let child_ref = unsafe { child.deref() };
        loop {
            let parent = child_ref.parent.load(Ordering::SeqCst, guard);
            if parent.is_null() || area.contains(parent) {
                return parent;
            }
            area.acquire_spin(parent, chain);
            if child_ref.parent.load(Ordering::SeqCst, guard) == parent {
                return parent;
            }
            area.unacquire(parent);
        }
    }

    /// Restores the red-black invariants after linking the red leaf
    /// `focus` under a red parent. On entry the area covers the focus,
    /// its parent, sibling, grandparent and uncle.
    ///
    /// Each red-uncle recolor moves the violation two levels up. The next
    /// area and the marker cone are secured before any color flips, so a
    /// live violation is always covered by held flags; those acquisitions
    /// wait out transient holders rather than fail, because past this
    /// point the operation has no unwind.
    pub(crate) fn fixup_insert<'g>(
        &self,
        focus: Shared<'g, Node<K, V>>,
        area: &mut LocalArea<'g, K, V>,
        chain: &mut MarkerChain<'g, K, V>,
        guard: &'g Guard,
    ) {
        let mut n = focus;
        loop {
            let n_ref = unsafe { n.deref() };
            let parent = n_ref.parent.load(Ordering::SeqCst, guard);
            let p_ref = match unsafe { parent.as_ref() } {
                None => {
                    n_ref.set_color(Color::Black);
                    return;
                }
                Some(p) => p,
            };
            if p_ref.color() == Color::Black {
                return;
            }
            let gp = p_ref.parent.load(Ordering::SeqCst, guard);
            let gp_ref = match unsafe { gp.as_ref() } {
                None => {
                    // parent is the root
                    p_ref.set_color(Color::Black);
                    return;
                }
                Some(g) => g,
            };
            let uncle = Node::uncle(n, guard);
            if Node::is_red(uncle) {
                let above = self.acquire_parent_spin(gp, area, chain, guard);
                if above.is_null() {
                    // grandparent is the root: recoloring it red and back
                    // to black collapses to recoloring its children
                    p_ref.set_color(Color::Black);
                    unsafe { uncle.deref() }.set_color(Color::Black);
                    return;
                }
                if chain.is_empty() {
                    chain.reserve_spin(above, area, guard);
                }
                let new_sibling = Node::sibling(gp, guard);
                if !new_sibling.is_null() && !area.contains(new_sibling) {
                    area.acquire_spin(new_sibling, chain);
                }
                let new_gp = self.acquire_parent_spin(above, area, chain, guard);
                let new_uncle = Node::sibling(above, guard);
                if !new_uncle.is_null() && !area.contains(new_uncle) {
                    area.acquire_spin(new_uncle, chain);
                }

                p_ref.set_color(Color::Black);
                unsafe { uncle.deref() }.set_color(Color::Black);
                gp_ref.set_color(Color::Red);

                area.release_except(&[gp, above, new_sibling, new_gp, new_uncle]);
                chain.advance_spin(area, guard);
                chain.advance_spin(area, guard);
                n = gp;
                continue;
            }

            // black uncle: one or two rotations finish the repair. The
            // rotation around the grandparent rewires its parent's child
            // slot, so that ancestor joins the area first.
            self.acquire_parent_spin(gp, area, chain, guard);
            let n_dir = Node::dir(n, guard);
            let p_dir = Node::dir(parent, guard);
            let (risen, line) = if n_dir != p_dir {
                // bent: straighten the triangle first
                self.rotate(parent, p_dir, guard);
                (n, p_dir)
            } else {
                (parent, n_dir)
            };
            self.rotate(gp, line.opposite(), guard);
            unsafe { risen.deref() }.set_color(Color::Black);
            gp_ref.set_color(Color::Red);
            return;
        }
    }

    /// Restores the red-black invariants after a black node was unlinked
    /// from under `parent` on side `deficit`. On entry the area covers
    /// the parent, its parent, the sibling of the removed node, and the
    /// sibling's children; the marker cone was reserved before the
    /// unlink.
    ///
    /// The both-nephews-black, black-parent case moves the deficit one
    /// level up; as in the insert fixup, the next area is secured before
    /// the recolor commits.
    pub(crate) fn fixup_delete<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        deficit: Direction,
        area: &mut LocalArea<'g, K, V>,
        chain: &mut MarkerChain<'g, K, V>,
        guard: &'g Guard,
    ) {
        let mut parent = parent;
        let mut deficit = deficit;
        loop {
            let p_ref = unsafe { parent.deref() };
            // rotations around the parent rewire the grandparent's child
            // slot; make sure it is owned before any case runs
            let gp = self.acquire_parent_spin(parent, area, chain, guard);
            let mut sibling = p_ref.child(deficit.opposite(), guard);
            if Node::is_red(sibling) {
                // red sibling: rotate it above the parent to surface a
                // black sibling, then refit the area to the new nephews
                self.rotate(parent, deficit, guard);
                unsafe { sibling.deref() }.set_color(Color::Black);
                p_ref.set_color(Color::Red);
                sibling = p_ref.child(deficit.opposite(), guard);
                let s_ref = unsafe { sibling.deref() };
                let sl = s_ref.left.load(Ordering::SeqCst, guard);
                if !sl.is_null() && !area.contains(sl) {
                    area.acquire_spin(sl, chain);
                }
                let sr = s_ref.right.load(Ordering::SeqCst, guard);
                if !sr.is_null() && !area.contains(sr) {
                    area.acquire_spin(sr, chain);
                }
            }

            let s_ref = unsafe { sibling.deref() };
            let near = s_ref.child(deficit, guard);
            let far = s_ref.child(deficit.opposite(), guard);
            if Node::is_black(near) && Node::is_black(far) {
                if p_ref.color() == Color::Red {
                    s_ref.set_color(Color::Red);
                    p_ref.set_color(Color::Black);
                    return;
                }
                if gp.is_null() {
                    // parent is the root: the whole tree loses one black
                    s_ref.set_color(Color::Red);
                    return;
                }
                // the deficit moves to the parent; secure its area first
                let uncle = Node::sibling(parent, guard);
                let mut keep = vec![gp];
                if !uncle.is_null() {
                    if !area.contains(uncle) {
                        area.acquire_spin(uncle, chain);
                    }
                    keep.push(uncle);
                    let u_ref = unsafe { uncle.deref() };
                    let ul = u_ref.left.load(Ordering::SeqCst, guard);
                    if !ul.is_null() {
                        if !area.contains(ul) {
                            area.acquire_spin(ul, chain);
                        }
                        keep.push(ul);
                    }
                    let ur = u_ref.right.load(Ordering::SeqCst, guard);
                    if !ur.is_null() {
                        if !area.contains(ur) {
                            area.acquire_spin(ur, chain);
                        }
                        keep.push(ur);
                    }
                }
                deficit = Node::dir(parent, guard);
                s_ref.set_color(Color::Red);
                area.release_except(&keep);
                chain.advance_spin(area, guard);
                parent = gp;
                continue;
            }

            if Node::is_red(near) && Node::is_black(far) {
                // bent: lift the near nephew over the sibling
                self.rotate(sibling, deficit.opposite(), guard);
                s_ref.set_color(Color::Red);
                sibling = p_ref.child(deficit.opposite(), guard);
                unsafe { sibling.deref() }.set_color(Color::Black);
            }

            // straight: the far nephew is red
            let s_ref = unsafe { sibling.deref() };
            let p_color = p_ref.color();
            self.rotate(parent, deficit, guard);
            s_ref.set_color(p_color);
            p_ref.set_color(Color::Black);
            let far = s_ref.child(deficit.opposite(), guard);
            unsafe { far.deref() }.set_color(Color::Black);
            return;
        }
    }
}
