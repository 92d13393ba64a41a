use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::cftype::{CgroupFile, FileTable};
use crate::core::Shared;
use crate::css::Css;
use crate::hierarchy::Hierarchy;
use crate::mask::SubsysMask;
use crate::pidlist::Pidlist;
use crate::refcnt::RefCnt;
use crate::subsys::SubsysId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CgroupFlags: u32 {
        const DEAD = 1 << 0;
        const RELEASED = 1 << 1;
        const NOTIFY_ON_RELEASE = 1 << 2;
        const CLONE_CHILDREN = 1 << 3;
    }
}

/// Wait condition keyed by a generation counter, so a waiter that sampled the
/// generation under a lock cannot miss a wakeup issued after dropping it.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn wake_all(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    pub fn wait_past(&self, seen: u64) {
        let mut generation = self.generation.lock();
        while *generation == seen {
            self.cond.wait(&mut generation);
        }
    }
}

/// A node of a hierarchy.
pub struct Cgroup {
    pub(crate) id: u32,
    pub(crate) serial_nr: u64,
    name: String,
    pub(crate) level: usize,
    /// Ids of every ancestor and self, root first.
    pub(crate) ancestor_ids: Vec<u32>,
    pub(crate) parent: Option<Arc<Cgroup>>,
    pub(crate) hierarchy_id: u32,
    pub(crate) root: Weak<Hierarchy>,
    pub(crate) core: Weak<Shared>,
    pub(crate) refcnt: RefCnt,
    flags: AtomicU32,
    pub(crate) children: RwLock<Vec<Arc<Cgroup>>>,
    pub(crate) subsys: RwLock<Vec<Option<Arc<Css>>>>,
    subtree_control: AtomicU32,
    subtree_ss_mask: AtomicU32,
    old_subtree_control: AtomicU32,
    old_subtree_ss_mask: AtomicU32,
    /// Populated sets linked here plus populated children.
    pub(crate) populated_cnt: AtomicUsize,
    /// Tasks linked anywhere in the subtree.
    pub(crate) nr_tasks: AtomicUsize,
    membership_gen: AtomicU64,
    pub(crate) files: FileTable,
    pub(crate) pidlists: Mutex<Vec<Pidlist>>,
    pub(crate) offline_waitq: WaitQueue,
    pub(crate) release_pending: AtomicBool,
}

pub(crate) struct CgroupInit {
    pub id: u32,
    pub serial_nr: u64,
    pub name: String,
    pub parent: Option<Arc<Cgroup>>,
    pub hierarchy_id: u32,
    pub root: Weak<Hierarchy>,
    pub core: Weak<Shared>,
    pub nr_subsys: usize,
    pub immortal: bool,
}

impl Cgroup {
    pub(crate) fn new(init: CgroupInit) -> Self {
        let (level, mut ancestor_ids) = match &init.parent {
            Some(parent) => (parent.level + 1, parent.ancestor_ids.clone()),
            None => (0, Vec::new()),
        };
        ancestor_ids.push(init.id);
        let refcnt = if init.immortal {
            RefCnt::new_immortal()
        } else {
            RefCnt::new()
        };
        Self {
            id: init.id,
            serial_nr: init.serial_nr,
            name: init.name,
            level,
            ancestor_ids,
            parent: init.parent,
            hierarchy_id: init.hierarchy_id,
            root: init.root,
            core: init.core,
            refcnt,
            flags: AtomicU32::new(0),
            children: RwLock::new(Vec::new()),
            subsys: RwLock::new(vec![None; init.nr_subsys]),
            subtree_control: AtomicU32::new(0),
            subtree_ss_mask: AtomicU32::new(0),
            old_subtree_control: AtomicU32::new(0),
            old_subtree_ss_mask: AtomicU32::new(0),
            populated_cnt: AtomicUsize::new(0),
            nr_tasks: AtomicUsize::new(0),
            membership_gen: AtomicU64::new(0),
            files: FileTable::default(),
            pidlists: Mutex::new(Vec::new()),
            offline_waitq: WaitQueue::default(),
            release_pending: AtomicBool::new(false),
        }
    }

    /// Id within the hierarchy. Roots are 1.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn serial_nr(&self) -> u64 {
        self.serial_nr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn parent(&self) -> Option<&Arc<Cgroup>> {
        self.parent.as_ref()
    }

    pub fn hierarchy_id(&self) -> u32 {
        self.hierarchy_id
    }

    pub fn root(&self) -> Option<Arc<Hierarchy>> {
        self.root.upgrade()
    }

    pub fn is_on_dfl(&self) -> bool {
        self.hierarchy_id == crate::hierarchy::DFL_HIERARCHY_ID
    }

    /// Whether `ancestor` is this group or one of its ancestors.
    pub fn is_descendant_of(&self, ancestor: &Cgroup) -> bool {
        self.hierarchy_id == ancestor.hierarchy_id
            && self.level >= ancestor.level
            && self.ancestor_ids[ancestor.level] == ancestor.id
    }

    /// Slash-separated path from the hierarchy root, `/` for the root itself.
    pub fn path(&self) -> String {
        let mut names = Vec::with_capacity(self.level);
        let mut cur = Some(self);
        while let Some(c) = cur {
            if c.parent.is_some() {
                names.push(c.name.as_str());
            }
            cur = c.parent.as_deref();
        }
        if names.is_empty() {
            return "/".to_owned();
        }
        names.reverse();
        let mut path = String::new();
        for name in names {
            path.push('/');
            path.push_str(name);
        }
        path
    }

    pub fn children(&self) -> Vec<Arc<Cgroup>> {
        self.children.read().clone()
    }

    pub fn child(&self, name: &str) -> Option<Arc<Cgroup>> {
        self.children
            .read()
            .iter()
            .find(|c| c.name == name && !c.is_dead())
            .cloned()
    }

    /// This group's own state for `ssid`, if it is currently online.
    pub fn css(&self, ssid: SubsysId) -> Option<Arc<Css>> {
        self.subsys.read().get(ssid).cloned().flatten()
    }

    pub fn is_populated(&self) -> bool {
        self.populated_cnt.load(Ordering::Acquire) != 0
    }

    /// Number of tasks in this group and its descendants.
    pub fn population(&self) -> usize {
        self.nr_tasks.load(Ordering::Acquire)
    }

    /// Populated sets linked here plus populated children.
    pub fn nr_populated(&self) -> usize {
        self.populated_cnt.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.has_flag(CgroupFlags::DEAD)
    }

    pub fn is_released(&self) -> bool {
        self.has_flag(CgroupFlags::RELEASED)
    }

    pub fn notify_on_release(&self) -> bool {
        self.has_flag(CgroupFlags::NOTIFY_ON_RELEASE)
    }

    pub fn clone_children(&self) -> bool {
        self.has_flag(CgroupFlags::CLONE_CHILDREN)
    }

    pub fn has_online_children(&self) -> bool {
        self.children.read().iter().any(|c| !c.is_dead())
    }

    pub fn subtree_control(&self) -> SubsysMask {
        SubsysMask::from_bits(self.subtree_control.load(Ordering::Acquire))
    }

    pub fn subtree_ss_mask(&self) -> SubsysMask {
        SubsysMask::from_bits(self.subtree_ss_mask.load(Ordering::Acquire))
    }

    pub(crate) fn set_subtree_control(&self, mask: SubsysMask) {
        self.subtree_control.store(mask.bits(), Ordering::Release);
    }

    pub(crate) fn set_subtree_ss_mask(&self, mask: SubsysMask) {
        self.subtree_ss_mask.store(mask.bits(), Ordering::Release);
    }

    pub(crate) fn save_control(&self) {
        self.old_subtree_control
            .store(self.subtree_control.load(Ordering::Acquire), Ordering::Release);
        self.old_subtree_ss_mask
            .store(self.subtree_ss_mask.load(Ordering::Acquire), Ordering::Release);
    }

    pub(crate) fn restore_control(&self) {
        self.subtree_control
            .store(self.old_subtree_control.load(Ordering::Acquire), Ordering::Release);
        self.subtree_ss_mask
            .store(self.old_subtree_ss_mask.load(Ordering::Acquire), Ordering::Release);
    }

    /// Mask of the hierarchy this group belongs to.
    pub fn root_mask(&self) -> SubsysMask {
        self.root().map_or(SubsysMask::EMPTY, |root| root.subsys_mask())
    }

    /// Controllers this group may enable for its children.
    pub fn control(&self) -> SubsysMask {
        if let Some(parent) = &self.parent {
            return parent.subtree_control();
        }
        let Some(root) = self.root() else {
            return SubsysMask::EMPTY;
        };
        let mut mask = root.subsys_mask();
        if self.is_on_dfl() {
            if let Some(core) = self.core.upgrade() {
                mask = mask - core.dfl_inhibit - core.dfl_implicit;
            }
        }
        mask
    }

    /// Controllers actually enabled on this group, including dependencies.
    pub fn ss_mask(&self) -> SubsysMask {
        match &self.parent {
            Some(parent) => parent.subtree_ss_mask(),
            None => self.root_mask(),
        }
    }

    pub fn file(&self, name: &str) -> Option<Arc<CgroupFile>> {
        self.files.get(name)
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.names()
    }

    pub(crate) fn notify_core_file(&self, name: &str) {
        if let Some(file) = self.files.get(name) {
            file.notify();
        }
    }

    pub(crate) fn membership_gen(&self) -> u64 {
        self.membership_gen.load(Ordering::Acquire)
    }

    pub(crate) fn bump_membership(&self) {
        self.membership_gen.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn get(&self) {
        self.refcnt.get();
    }

    pub(crate) fn tryget(&self) -> bool {
        self.refcnt.tryget()
    }

    pub(crate) fn put(&self) {
        if self.refcnt.put() {
            self.released();
        }
    }

    pub(crate) fn released(&self) {
        let Some(core) = self.core.upgrade() else { return };
        match core.cgroup_arc(self) {
            Some(me) => core.queue_cgroup_release(me),
            None => tracing::warn!(cgroup = %self.name, "released cgroup is not registered"),
        }
    }

    pub(crate) fn has_flag(&self, flag: CgroupFlags) -> bool {
        CgroupFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    pub(crate) fn set_flag(&self, flag: CgroupFlags, on: bool) {
        if on {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for Cgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cgroup")
            .field("hierarchy", &self.hierarchy_id)
            .field("id", &self.id)
            .field("path", &self.path())
            .field("populated", &self.population())
            .finish()
    }
}
