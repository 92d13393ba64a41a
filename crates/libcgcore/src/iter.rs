//! Tree walks over groups and controller states, and the resumable task
//! iterator.
//!
//! Walks hold only a short read section on one sibling list per step, so the
//! tree may change between steps. Resuming after a node that has been
//! released uses the serial-number rule: the next sibling is the first child
//! of the parent with a higher serial number.

use std::ops::Bound;
use std::sync::Arc;

use nix::unistd::Pid;
use parking_lot::RwLock;

use crate::cgroup::Cgroup;
use crate::core::Shared;
use crate::css::Css;
use crate::css_set::{CssSet, Membership};

pub trait TreeNode: Sized {
    fn serial_nr(&self) -> u64;
    fn parent_node(&self) -> Option<&Arc<Self>>;
    fn children_list(&self) -> &RwLock<Vec<Arc<Self>>>;
    /// Whether the node may still be reached by walks.
    fn is_live_node(&self) -> bool;
}

impl TreeNode for Cgroup {
    fn serial_nr(&self) -> u64 {
        self.serial_nr
    }

    fn parent_node(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    fn children_list(&self) -> &RwLock<Vec<Arc<Self>>> {
        &self.children
    }

    fn is_live_node(&self) -> bool {
        !self.is_dead()
    }
}

impl TreeNode for Css {
    fn serial_nr(&self) -> u64 {
        self.serial_nr
    }

    fn parent_node(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    fn children_list(&self) -> &RwLock<Vec<Arc<Self>>> {
        &self.children
    }

    fn is_live_node(&self) -> bool {
        self.is_online()
    }
}

/// The child of `parent` after `pos`, or the first child when `pos` is `None`.
pub fn next_child<T: TreeNode>(pos: Option<&Arc<T>>, parent: &Arc<T>) -> Option<Arc<T>> {
    let children = parent.children_list().read();
    match pos {
        None => children.first().cloned(),
        Some(pos) => {
            // Siblings are appended in serial order, which also covers a
            // `pos` that has already been unlinked.
            let serial = pos.serial_nr();
            let idx = children.partition_point(|c| c.serial_nr() <= serial);
            children.get(idx).cloned()
        }
    }
}

/// Pre-order successor of `pos` within the subtree rooted at `root`.
pub fn next_descendant_pre<T: TreeNode>(pos: Option<&Arc<T>>, root: &Arc<T>) -> Option<Arc<T>> {
    let Some(pos) = pos else {
        return Some(root.clone());
    };
    if let Some(first) = next_child(None, pos) {
        return Some(first);
    }
    let mut pos = pos.clone();
    while !Arc::ptr_eq(&pos, root) {
        let parent = pos.parent_node()?.clone();
        if let Some(next) = next_child(Some(&pos), &parent) {
            return Some(next);
        }
        pos = parent;
    }
    None
}

/// Deepest last descendant of `pos`, `pos` itself if it has no children.
pub fn rightmost_descendant<T: TreeNode>(pos: &Arc<T>) -> Arc<T> {
    let mut pos = pos.clone();
    loop {
        let last = pos.children_list().read().last().cloned();
        match last {
            Some(last) => pos = last,
            None => return pos,
        }
    }
}

/// Deepest first descendant of `pos`.
pub fn leftmost_descendant<T: TreeNode>(pos: &Arc<T>) -> Arc<T> {
    let mut pos = pos.clone();
    while let Some(first) = next_child(None, &pos) {
        pos = first;
    }
    pos
}

/// Post-order successor of `pos`; the walk ends with `root` itself.
pub fn next_descendant_post<T: TreeNode>(
    pos: Option<&Arc<T>>,
    root: &Arc<T>,
) -> Option<Arc<T>> {
    let Some(pos) = pos else {
        return Some(leftmost_descendant(root));
    };
    if Arc::ptr_eq(pos, root) {
        return None;
    }
    let parent = pos.parent_node()?.clone();
    match next_child(Some(pos), &parent) {
        Some(next) => Some(leftmost_descendant(&next)),
        None => Some(parent),
    }
}

/// Pre-order walk including the root.
pub struct DescendantsPre<T: TreeNode> {
    root: Arc<T>,
    pos: Option<Arc<T>>,
    done: bool,
}

impl<T: TreeNode> DescendantsPre<T> {
    pub fn new(root: &Arc<T>) -> Self {
        Self {
            root: root.clone(),
            pos: None,
            done: false,
        }
    }

    /// Do not descend below the node returned last.
    pub fn skip_subtree(&mut self) {
        if let Some(pos) = &self.pos {
            self.pos = Some(rightmost_descendant(pos));
        }
    }
}

impl<T: TreeNode> Iterator for DescendantsPre<T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = next_descendant_pre(self.pos.as_ref(), &self.root);
        match &next {
            Some(node) => self.pos = Some(node.clone()),
            None => self.done = true,
        }
        next
    }
}

/// Post-order walk, children before parents, ending at the root.
pub struct DescendantsPost<T: TreeNode> {
    root: Arc<T>,
    pos: Option<Arc<T>>,
    done: bool,
}

impl<T: TreeNode> DescendantsPost<T> {
    pub fn new(root: &Arc<T>) -> Self {
        Self {
            root: root.clone(),
            pos: None,
            done: false,
        }
    }
}

impl<T: TreeNode> Iterator for DescendantsPost<T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = next_descendant_post(self.pos.as_ref(), &self.root);
        match &next {
            Some(node) => {
                if Arc::ptr_eq(node, &self.root) {
                    self.done = true;
                }
                self.pos = Some(node.clone());
            }
            None => self.done = true,
        }
        next
    }
}

/// Live groups of the subtree in pre-order.
pub(crate) fn live_descendants_pre(root: &Arc<Cgroup>) -> impl Iterator<Item = Arc<Cgroup>> {
    DescendantsPre::new(root).filter(|c| !c.is_dead())
}

/// Live groups of the subtree in post-order.
pub(crate) fn live_descendants_post(root: &Arc<Cgroup>) -> impl Iterator<Item = Arc<Cgroup>> {
    DescendantsPost::new(root).filter(|c| !c.is_dead())
}

/// Whether any child state is online.
pub fn css_has_online_children(css: &Arc<Css>) -> bool {
    css.children.read().iter().any(|c| c.is_online())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterOrigin {
    Cgroup(u64),
    Css(u64),
}

/// Position of a live task iterator, guarded by the membership lock.
pub(crate) struct IterState {
    origin: IterOrigin,
    link_seq: Option<u64>,
    cur_cset: Option<Arc<CssSet>>,
    pub task_pos: Option<Pid>,
}

fn next_populated_cset(mb: &Membership, origin: IterOrigin, after: Option<u64>) -> Option<(u64, Arc<CssSet>)> {
    let links = match origin {
        IterOrigin::Cgroup(serial) => mb.cgrp_links.get(&serial),
        IterOrigin::Css(serial) => mb.css_links.get(&serial),
    }?;
    let lower = match after {
        Some(seq) => Bound::Excluded(seq),
        None => Bound::Unbounded,
    };
    links
        .range((lower, Bound::Unbounded))
        .find(|(_, cset)| mb.populated(cset))
        .map(|(seq, cset)| (*seq, cset.clone()))
}

/// Moves iterator `id` to the first task of the next populated set. The set
/// it moves to is pinned and the previous one released.
pub(crate) fn advance_css_set(shared: &Shared, mb: &mut Membership, id: u64) {
    let Some(state) = mb.iters.get(&id) else { return };
    let next = next_populated_cset(mb, state.origin, state.link_seq);
    let old = mb.iters.get_mut(&id).and_then(|state| state.cur_cset.take());

    if let Some(old) = old {
        mb.node_mut(&old).task_iters.retain(|&it| it != id);
        shared.put_css_set_locked(mb, &old);
    }

    match next {
        Some((seq, cset)) => {
            cset.get();
            mb.node_mut(&cset).task_iters.push(id);
            let head = mb.node(&cset).tasks.head;
            if let Some(state) = mb.iters.get_mut(&id) {
                state.link_seq = Some(seq);
                state.task_pos = head;
                state.cur_cset = Some(cset);
            }
        }
        None => {
            if let Some(state) = mb.iters.get_mut(&id) {
                state.task_pos = None;
            }
        }
    }
}

/// Steps iterator `id` past its current task.
pub(crate) fn advance_task(shared: &Shared, mb: &mut Membership, id: u64) {
    let Some(pos) = mb.iters.get(&id).and_then(|state| state.task_pos) else {
        return;
    };
    match mb.task(pos).and_then(|task| task.next()) {
        Some(next) => {
            if let Some(state) = mb.iters.get_mut(&id) {
                state.task_pos = Some(next);
            }
        }
        None => advance_css_set(shared, mb, id),
    }
}

/// Iterates the tasks of a group, or of every group where a controller
/// state is in effect.
///
/// The iterator survives concurrent membership changes: each task that stays
/// put for the whole iteration is returned exactly once, tasks migrating in
/// or out may or may not be seen.
pub struct CssTaskIter {
    shared: Arc<Shared>,
    id: u64,
}

impl CssTaskIter {
    pub(crate) fn start(shared: &Arc<Shared>, origin: IterOrigin) -> Self {
        let mut mb = shared.css_set.lock();
        mb.next_iter_id += 1;
        let id = mb.next_iter_id;
        mb.iters.insert(
            id,
            IterState {
                origin,
                link_seq: None,
                cur_cset: None,
                task_pos: None,
            },
        );
        advance_css_set(shared, &mut mb, id);
        Self {
            shared: shared.clone(),
            id,
        }
    }
}

impl Iterator for CssTaskIter {
    type Item = Pid;

    fn next(&mut self) -> Option<Self::Item> {
        let mut mb = self.shared.css_set.lock();
        let pos = mb.iters.get(&self.id).and_then(|state| state.task_pos)?;
        advance_task(&self.shared, &mut mb, self.id);
        Some(pos)
    }
}

impl Drop for CssTaskIter {
    fn drop(&mut self) {
        let mut mb = self.shared.css_set.lock();
        if let Some(state) = mb.iters.remove(&self.id) {
            if let Some(cset) = state.cur_cset {
                mb.node_mut(&cset).task_iters.retain(|&it| it != self.id);
                self.shared.put_css_set_locked(&mut mb, &cset);
            }
        }
    }
}
