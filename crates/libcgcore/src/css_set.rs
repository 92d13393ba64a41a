use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::unistd::Pid;

use crate::cgroup::Cgroup;
use crate::common::CgroupError;
use crate::core::Shared;
use crate::css::Css;
use crate::iter::IterState;
use crate::subsys::SubsysId;

/// A de-duplicated tuple of controller states, one per controller slot.
///
/// Tasks point at exactly one set; every task with the same effective
/// membership on every hierarchy shares the same set.
pub struct CssSet {
    id: u64,
    hash: u64,
    pub(crate) subsys: Vec<Arc<Css>>,
    refcount: AtomicUsize,
}

impl CssSet {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn css(&self, ssid: SubsysId) -> &Arc<Css> {
        &self.subsys[ssid]
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    // Drops a reference unless it is the last one.
    fn put_unless_last(&self) -> bool {
        let mut cur = self.refcount.load(Ordering::Acquire);
        loop {
            if cur <= 1 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl fmt::Debug for CssSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CssSet")
            .field("id", &self.id)
            .field("refcount", &self.refcount())
            .finish()
    }
}

fn css_set_hash(template: &[Arc<Css>]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for css in template {
        css.serial_nr().hash(&mut hasher);
    }
    hasher.finish()
}

/// A set's link to its group on one hierarchy.
pub(crate) struct CgrpLink {
    pub cgrp: Arc<Cgroup>,
    pub seq: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TaskList {
    pub head: Option<Pid>,
    pub tail: Option<Pid>,
    pub len: usize,
}

/// Mutable state of a set, guarded by the membership lock.
pub(crate) struct CsetNode {
    pub cset: Arc<CssSet>,
    pub tasks: TaskList,
    pub task_iters: Vec<u64>,
    /// One link per hierarchy in the order hierarchies were set up.
    pub cgrp_links: Vec<CgrpLink>,
    /// Position in each slot's state link list.
    pub e_links: Vec<u64>,
    pub dead: bool,
}

pub(crate) struct TaskEntry {
    pub pid: Pid,
    pub tgid: Pid,
    pub cset: Arc<CssSet>,
    pub linked: bool,
    pub exiting: bool,
    pub no_migrate: bool,
    prev: Option<Pid>,
    next: Option<Pid>,
}

impl TaskEntry {
    pub fn new(pid: Pid, tgid: Pid, cset: Arc<CssSet>) -> Self {
        Self {
            pid,
            tgid,
            cset,
            linked: false,
            exiting: false,
            no_migrate: false,
            prev: None,
            next: None,
        }
    }

    pub fn next(&self) -> Option<Pid> {
        self.next
    }
}

/// Everything protected by the membership lock.
#[derive(Default)]
pub(crate) struct Membership {
    pub csets: HashMap<u64, CsetNode>,
    table: HashMap<u64, Vec<Arc<CssSet>>>,
    /// Sets linked to a group, keyed by group serial, in link order.
    pub cgrp_links: HashMap<u64, BTreeMap<u64, Arc<CssSet>>>,
    /// Sets using a controller state, keyed by state serial, in link order.
    pub css_links: HashMap<u64, BTreeMap<u64, Arc<CssSet>>>,
    pub tasks: HashMap<Pid, TaskEntry>,
    /// Thread groups in creation order, keyed by leader.
    pub threads: HashMap<Pid, Vec<Pid>>,
    pub iters: HashMap<u64, IterState>,
    next_seq: u64,
    next_cset_id: u64,
    pub next_iter_id: u64,
}

impl Membership {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn node(&self, cset: &CssSet) -> &CsetNode {
        match self.csets.get(&cset.id) {
            Some(node) => node,
            None => panic!("css_set {} is not registered", cset.id),
        }
    }

    pub fn node_mut(&mut self, cset: &CssSet) -> &mut CsetNode {
        match self.csets.get_mut(&cset.id) {
            Some(node) => node,
            None => panic!("css_set {} is not registered", cset.id),
        }
    }

    pub fn populated(&self, cset: &CssSet) -> bool {
        self.node(cset).tasks.len != 0
    }

    pub fn css_set_count(&self) -> usize {
        self.csets.len()
    }

    /// The group `cset` is linked to on hierarchy `hierarchy_id`.
    pub fn cset_cgroup(&self, cset: &CssSet, hierarchy_id: u32) -> Option<Arc<Cgroup>> {
        self.node(cset)
            .cgrp_links
            .iter()
            .find(|link| link.cgrp.hierarchy_id() == hierarchy_id)
            .map(|link| link.cgrp.clone())
    }

    pub fn task(&self, pid: Pid) -> Option<&TaskEntry> {
        self.tasks.get(&pid)
    }

    pub fn task_entry_mut(&mut self, pid: Pid) -> Option<&mut TaskEntry> {
        self.tasks.get_mut(&pid)
    }

    fn task_mut(&mut self, pid: Pid) -> &mut TaskEntry {
        match self.tasks.get_mut(&pid) {
            Some(task) => task,
            None => panic!("task {pid} is not registered"),
        }
    }

    /// Tasks linked to `cset` in list order.
    pub fn cset_tasks(&self, cset: &CssSet) -> Vec<Pid> {
        let mut out = Vec::with_capacity(self.node(cset).tasks.len);
        let mut pos = self.node(cset).tasks.head;
        while let Some(pid) = pos {
            out.push(pid);
            pos = self.tasks.get(&pid).and_then(|t| t.next);
        }
        out
    }

    /// Every set linked to `cgrp`, in link order.
    pub fn cgroup_csets(&self, cgrp: &Cgroup) -> Vec<Arc<CssSet>> {
        self.cgrp_links
            .get(&cgrp.serial_nr())
            .map(|links| links.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every registered set.
    pub fn all_csets(&self) -> Vec<Arc<CssSet>> {
        self.table.values().flatten().cloned().collect()
    }

    fn list_append(&mut self, cset: &Arc<CssSet>, pid: Pid) {
        let tail = self.node(cset).tasks.tail;
        {
            let task = self.task_mut(pid);
            debug_assert!(!task.linked);
            task.prev = tail;
            task.next = None;
            task.linked = true;
        }
        match tail {
            Some(tail) => self.task_mut(tail).next = Some(pid),
            None => self.node_mut(cset).tasks.head = Some(pid),
        }
        let list = &mut self.node_mut(cset).tasks;
        list.tail = Some(pid);
        list.len += 1;
    }

    fn list_remove(&mut self, cset: &Arc<CssSet>, pid: Pid) {
        let (prev, next) = {
            let task = self.task_mut(pid);
            debug_assert!(task.linked);
            let links = (task.prev, task.next);
            task.prev = None;
            task.next = None;
            task.linked = false;
            links
        };
        match prev {
            Some(prev) => self.task_mut(prev).next = next,
            None => self.node_mut(cset).tasks.head = next,
        }
        match next {
            Some(next) => self.task_mut(next).prev = prev,
            None => self.node_mut(cset).tasks.tail = prev,
        }
        self.node_mut(cset).tasks.len -= 1;
    }

    fn find_existing(
        &self,
        hash: u64,
        template: &[Arc<Css>],
        old: &CssSet,
        new_cgrp: &Arc<Cgroup>,
    ) -> Option<Arc<CssSet>> {
        self.table
            .get(&hash)?
            .iter()
            .find(|cset| self.compare_css_sets(cset, old, new_cgrp, template))
            .cloned()
    }

    /// Equal content on every slot and the same group on every hierarchy,
    /// where the hierarchy of `new_cgrp` must resolve to `new_cgrp` itself.
    fn compare_css_sets(
        &self,
        cset: &CssSet,
        old: &CssSet,
        new_cgrp: &Arc<Cgroup>,
        template: &[Arc<Css>],
    ) -> bool {
        if cset
            .subsys
            .iter()
            .zip(template)
            .any(|(a, b)| !Arc::ptr_eq(a, b))
        {
            return false;
        }

        let links = &self.node(cset).cgrp_links;
        let old_links = &self.node(old).cgrp_links;
        assert_eq!(
            links.len(),
            old_links.len(),
            "css_sets link a different number of hierarchies"
        );
        for (l1, l2) in links.iter().zip(old_links) {
            let (c1, c2) = (&l1.cgrp, &l2.cgrp);
            assert_eq!(
                c1.hierarchy_id(),
                c2.hierarchy_id(),
                "css_set hierarchy links out of order"
            );
            if c1.hierarchy_id() == new_cgrp.hierarchy_id() {
                if !Arc::ptr_eq(c1, new_cgrp) {
                    return false;
                }
            } else if !Arc::ptr_eq(c1, c2) {
                return false;
            }
        }
        true
    }
}

impl Shared {
    /// Registers the initial set every task starts in.
    pub(crate) fn register_init_css_set(
        mb: &mut Membership,
        subsys: Vec<Arc<Css>>,
        dfl_cgrp: &Arc<Cgroup>,
    ) -> Arc<CssSet> {
        let hash = css_set_hash(&subsys);
        let cset = Arc::new(CssSet {
            id: 0,
            hash,
            subsys,
            refcount: AtomicUsize::new(1),
        });
        mb.next_cset_id = 1;
        Self::insert_node(mb, &cset);
        Self::link_css_set(mb, &cset, dfl_cgrp);
        cset
    }

    fn insert_node(mb: &mut Membership, cset: &Arc<CssSet>) {
        let mut e_links = Vec::with_capacity(cset.subsys.len());
        for css in &cset.subsys {
            let seq = mb.seq();
            mb.css_links
                .entry(css.serial_nr())
                .or_default()
                .insert(seq, cset.clone());
            e_links.push(seq);
        }
        mb.csets.insert(
            cset.id,
            CsetNode {
                cset: cset.clone(),
                tasks: TaskList::default(),
                task_iters: Vec::new(),
                cgrp_links: Vec::new(),
                e_links,
                dead: false,
            },
        );
        mb.table.entry(cset.hash).or_default().push(cset.clone());
    }

    /// Appends a link between `cset` and `cgrp`. Non-root groups are pinned
    /// by every set linked to them.
    pub(crate) fn link_css_set(mb: &mut Membership, cset: &Arc<CssSet>, cgrp: &Arc<Cgroup>) {
        if cgrp.parent().is_some() {
            cgrp.get();
        }
        let seq = mb.seq();
        mb.node_mut(cset).cgrp_links.push(CgrpLink {
            cgrp: cgrp.clone(),
            seq,
        });
        mb.cgrp_links
            .entry(cgrp.serial_nr())
            .or_default()
            .insert(seq, cset.clone());
    }

    /// Drops every link to the root group of a hierarchy being destroyed.
    pub(crate) fn unlink_root_cgroup(mb: &mut Membership, root_cgrp: &Cgroup) {
        mb.cgrp_links.remove(&root_cgrp.serial_nr());
        for node in mb.csets.values_mut() {
            node.cgrp_links
                .retain(|link| !std::ptr::eq(Arc::as_ptr(&link.cgrp), root_cgrp));
        }
    }

    /// Effective state of `ssid` for `cgrp`: its own state if the controller
    /// is enabled there, otherwise the nearest ancestor's.
    pub(crate) fn cgroup_e_css(&self, cgrp: &Arc<Cgroup>, ssid: SubsysId) -> Arc<Css> {
        let mut cur = cgrp.clone();
        loop {
            let parent = match cur.parent() {
                Some(parent) => parent.clone(),
                None => break,
            };
            if cur.ss_mask().contains(ssid) {
                if let Some(css) = cur.css(ssid) {
                    return css;
                }
            }
            cur = parent;
        }
        match cur.css(ssid) {
            Some(css) => css,
            None => self.init_cset.subsys[ssid].clone(),
        }
    }

    /// Finds or creates the set matching `old` with its membership on the
    /// hierarchy of `cgrp` replaced by `cgrp`. Returns a new reference.
    ///
    /// Caller holds the structural lock.
    pub(crate) fn find_css_set(
        &self,
        old: &Arc<CssSet>,
        cgrp: &Arc<Cgroup>,
    ) -> Result<Arc<CssSet>, CgroupError> {
        let root_mask = cgrp.root_mask();
        let template: Vec<Arc<Css>> = (0..self.subsys.len())
            .map(|ssid| {
                if root_mask.contains(ssid) {
                    self.cgroup_e_css(cgrp, ssid)
                } else {
                    old.subsys[ssid].clone()
                }
            })
            .collect();
        let hash = css_set_hash(&template);

        {
            let mb = self.css_set.lock();
            if let Some(existing) = mb.find_existing(hash, &template, old, cgrp) {
                existing.get();
                return Ok(existing);
            }
        }

        let mut subsys = Vec::new();
        subsys
            .try_reserve_exact(template.len())
            .map_err(|_| CgroupError::NoMemory("css_set"))?;
        subsys.extend(template.iter().cloned());
        for css in &subsys {
            css.get();
        }

        let mut mb = self.css_set.lock();
        let cset = Arc::new(CssSet {
            id: mb.next_cset_id,
            hash,
            subsys,
            refcount: AtomicUsize::new(1),
        });
        mb.next_cset_id += 1;

        let groups: Vec<Arc<Cgroup>> = mb
            .node(old)
            .cgrp_links
            .iter()
            .map(|link| {
                if link.cgrp.hierarchy_id() == cgrp.hierarchy_id() {
                    cgrp.clone()
                } else {
                    link.cgrp.clone()
                }
            })
            .collect();
        Self::insert_node(&mut mb, &cset);
        for group in &groups {
            Self::link_css_set(&mut mb, &cset, group);
        }
        tracing::debug!(cset = cset.id, cgroup = %cgrp.path(), "created css_set");
        Ok(cset)
    }

    /// Drops a set reference, taking the membership lock only when it might
    /// be the last one.
    pub(crate) fn put_css_set(&self, cset: &Arc<CssSet>) {
        if cset.put_unless_last() {
            return;
        }
        let mut mb = self.css_set.lock();
        self.put_css_set_locked(&mut mb, cset);
    }

    pub(crate) fn put_css_set_locked(&self, mb: &mut Membership, cset: &Arc<CssSet>) {
        let prev = cset.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "css_set {} refcount underflow", cset.id);
        if prev != 1 {
            return;
        }
        let node = match mb.csets.remove(&cset.id) {
            Some(node) => node,
            None => panic!("css_set {} released twice", cset.id),
        };
        assert_eq!(node.tasks.len, 0, "released css_set still has tasks");

        if let Some(bucket) = mb.table.get_mut(&cset.hash) {
            bucket.retain(|c| !Arc::ptr_eq(c, cset));
            if bucket.is_empty() {
                mb.table.remove(&cset.hash);
            }
        }
        for (css, seq) in cset.subsys.iter().zip(&node.e_links) {
            if let Some(links) = mb.css_links.get_mut(&css.serial_nr()) {
                links.remove(seq);
                if links.is_empty() {
                    mb.css_links.remove(&css.serial_nr());
                }
            }
            css.put();
        }
        for link in &node.cgrp_links {
            if let Some(links) = mb.cgrp_links.get_mut(&link.cgrp.serial_nr()) {
                links.remove(&link.seq);
                if links.is_empty() {
                    mb.cgrp_links.remove(&link.cgrp.serial_nr());
                }
            }
            if link.cgrp.parent().is_some() {
                link.cgrp.put();
            }
        }
        tracing::debug!(cset = cset.id, "released css_set");
    }

    /// Moves `pid` from `from` to `to` and keeps population counts and task
    /// iterators consistent. References are the caller's business.
    pub(crate) fn css_set_move_task(
        &self,
        mb: &mut Membership,
        pid: Pid,
        from: Option<&Arc<CssSet>>,
        to: Option<&Arc<CssSet>>,
    ) {
        if let Some(to) = to {
            if !mb.populated(to) {
                self.css_set_update_populated(mb, to, true);
            }
        }

        if let Some(from) = from {
            let iters: Vec<u64> = mb.node(from).task_iters.clone();
            for id in iters {
                let points_here = mb.iters.get(&id).and_then(|it| it.task_pos) == Some(pid);
                if points_here {
                    crate::iter::advance_task(self, mb, id);
                }
            }
            mb.list_remove(from, pid);
            Self::adjust_nr_tasks(mb, from, false);
            self.bump_membership(mb, from);
            if !mb.populated(from) {
                self.css_set_update_populated(mb, from, false);
            }
        }

        if let Some(to) = to {
            mb.task_mut(pid).cset = to.clone();
            mb.list_append(to, pid);
            Self::adjust_nr_tasks(mb, to, true);
            self.bump_membership(mb, to);
        }
    }

    fn adjust_nr_tasks(mb: &Membership, cset: &CssSet, inc: bool) {
        for link in &mb.node(cset).cgrp_links {
            Self::add_subtree_tasks(&link.cgrp, 1, inc);
        }
    }

    /// Adds or removes `count` tasks on `cgrp` and every ancestor.
    pub(crate) fn add_subtree_tasks(cgrp: &Arc<Cgroup>, count: usize, inc: bool) {
        let mut cur = Some(cgrp);
        while let Some(c) = cur {
            if inc {
                c.nr_tasks.fetch_add(count, Ordering::AcqRel);
            } else {
                c.nr_tasks.fetch_sub(count, Ordering::AcqRel);
            }
            cur = c.parent();
        }
    }

    fn bump_membership(&self, mb: &Membership, cset: &CssSet) {
        for link in &mb.node(cset).cgrp_links {
            link.cgrp.bump_membership();
        }
    }

    fn css_set_update_populated(&self, mb: &Membership, cset: &CssSet, populated: bool) {
        for link in &mb.node(cset).cgrp_links {
            self.cgroup_update_populated(&link.cgrp, populated);
        }
    }

    /// Edge-triggered walk toward the root. Each group counts its populated
    /// sets plus its populated children, so only zero crossings propagate.
    pub(crate) fn cgroup_update_populated(&self, cgrp: &Arc<Cgroup>, populated: bool) {
        let mut cur = Some(cgrp.clone());
        while let Some(c) = cur {
            let trigger = if populated {
                c.populated_cnt.fetch_add(1, Ordering::AcqRel) == 0
            } else {
                let prev = c.populated_cnt.fetch_sub(1, Ordering::AcqRel);
                assert!(prev > 0, "populated count underflow on {}", c.path());
                prev == 1
            };
            if !trigger {
                break;
            }
            self.check_for_release(&c);
            c.notify_core_file(crate::common::CGROUP_EVENTS);
            cur = c.parent().cloned();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::test::{new_core, pid};

    #[test]
    fn test_find_css_set_dedups() {
        let (core, _log) = new_core(&["a", "b"]);
        let root = core.default_root();
        let child = core.mkdir(&root, "c").expect("mkdir");
        let shared = core.shared();

        let _state = shared.state.lock();
        let init = shared.init_cset.clone();
        let first = shared.find_css_set(&init, &child).expect("first lookup");
        let second = shared.find_css_set(&init, &child).expect("second lookup");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.refcount(), 2);

        let back = shared.find_css_set(&first, &root).expect("lookup root");
        assert!(Arc::ptr_eq(&back, &init));
        shared.put_css_set(&back);

        let before = shared.css_set.lock().css_set_count();
        shared.put_css_set(&first);
        shared.put_css_set(&second);
        assert_eq!(shared.css_set.lock().css_set_count(), before - 1);
    }

    #[test]
    fn test_tasks_with_same_membership_share_set() {
        let (core, _log) = new_core(&["a"]);
        let root = core.default_root();
        let child = core.mkdir(&root, "c").expect("mkdir");
        core.fork(None, pid(10)).expect("fork 10");
        core.fork(None, pid(11)).expect("fork 11");
        core.attach(&child, pid(10), false).expect("attach 10");
        core.attach(&child, pid(11), false).expect("attach 11");
        let a = core.task_css_set(pid(10)).expect("set of 10");
        let b = core.task_css_set(pid(11)).expect("set of 11");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.refcount() >= 2);
    }

    #[test]
    fn test_set_released_when_last_task_leaves() {
        let (core, _log) = new_core(&["a"]);
        let root = core.default_root();
        let child = core.mkdir(&root, "c").expect("mkdir");
        core.fork(None, pid(10)).expect("fork");
        let baseline = core.shared().css_set.lock().css_set_count();
        core.attach(&child, pid(10), false).expect("attach");
        assert_eq!(core.shared().css_set.lock().css_set_count(), baseline + 1);
        core.attach(&root, pid(10), false).expect("attach back");
        assert_eq!(core.shared().css_set.lock().css_set_count(), baseline);
    }

    #[test]
    fn test_population_counts_subtree_tasks() {
        let (core, _log) = new_core(&["a"]);
        let root = core.default_root();
        let p = core.mkdir(&root, "p").expect("mkdir p");
        let c = core.mkdir(&p, "c").expect("mkdir c");
        for t in 10..13 {
            core.fork(None, pid(t)).expect("fork");
            core.attach(&c, pid(t), false).expect("attach");
        }
        core.fork(None, pid(13)).expect("fork");
        core.attach(&p, pid(13), false).expect("attach");
        assert_eq!(c.population(), 3);
        assert_eq!(p.population(), 4);
        assert_eq!(root.population(), 4);

        core.exit(pid(10)).expect("exit");
        assert_eq!(c.population(), 2);
        assert_eq!(p.population(), 3);

        let h = core
            .mount(&crate::MountOptions::new().subsys(&["a"]))
            .expect("mount");
        assert_eq!(h.root_cgroup().population(), 3);
    }
}
