use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::cgroup::Cgroup;
use crate::core::Shared;
use crate::refcnt::RefCnt;
use crate::subsys::{CssPrivate, SubsysId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CssFlags: u32 {
        const ONLINE = 1 << 0;
        const RELEASED = 1 << 1;
        const VISIBLE = 1 << 2;
        const DYING = 1 << 3;
    }
}

/// Per-(group, controller) state object.
pub struct Css {
    pub(crate) ss: SubsysId,
    pub(crate) id: u32,
    pub(crate) serial_nr: u64,
    // Only a hierarchy root's state is ever re-pointed, on rebind.
    pub(crate) cgroup: RwLock<Weak<Cgroup>>,
    pub(crate) parent: Option<Arc<Css>>,
    pub(crate) children: RwLock<Vec<Arc<Css>>>,
    pub(crate) refcnt: RefCnt,
    /// Self plus online children.
    pub(crate) online_cnt: AtomicUsize,
    flags: AtomicU32,
    private: CssPrivate,
    pub(crate) core: Weak<Shared>,
}

impl Css {
    pub(crate) fn new(
        ss: SubsysId,
        id: u32,
        serial_nr: u64,
        cgroup: &Arc<Cgroup>,
        parent: Option<Arc<Css>>,
        private: CssPrivate,
        core: Weak<Shared>,
    ) -> Self {
        let refcnt = if parent.is_none() {
            RefCnt::new_immortal()
        } else {
            RefCnt::new()
        };
        Self {
            ss,
            id,
            serial_nr,
            cgroup: RwLock::new(Arc::downgrade(cgroup)),
            parent,
            children: RwLock::new(Vec::new()),
            refcnt,
            online_cnt: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            private,
            core,
        }
    }

    pub fn ssid(&self) -> SubsysId {
        self.ss
    }

    /// Id within the controller, unique among its live states. Roots are 1.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn serial_nr(&self) -> u64 {
        self.serial_nr
    }

    pub fn parent(&self) -> Option<&Arc<Css>> {
        self.parent.as_ref()
    }

    pub fn cgroup(&self) -> Option<Arc<Cgroup>> {
        self.cgroup.read().upgrade()
    }

    /// Controller-private state.
    pub fn private<T: 'static>(&self) -> Option<&T> {
        self.private.downcast_ref::<T>()
    }

    pub fn is_online(&self) -> bool {
        self.has_flag(CssFlags::ONLINE)
    }

    pub fn is_dying(&self) -> bool {
        self.has_flag(CssFlags::DYING)
    }

    pub fn is_released(&self) -> bool {
        self.has_flag(CssFlags::RELEASED)
    }

    pub fn is_visible(&self) -> bool {
        self.has_flag(CssFlags::VISIBLE)
    }

    pub fn children(&self) -> Vec<Arc<Css>> {
        self.children.read().clone()
    }

    pub fn get(&self) {
        self.refcnt.get();
    }

    pub fn tryget(&self) -> bool {
        self.refcnt.tryget()
    }

    /// Fails once the state started dying.
    pub fn tryget_online(&self) -> bool {
        self.refcnt.tryget_live()
    }

    pub fn put(&self) {
        if self.refcnt.put() {
            self.released();
        }
    }

    // Last reference gone: hand over to the destruction queue.
    pub(crate) fn released(&self) {
        let Some(core) = self.core.upgrade() else { return };
        let Some(me) = core.css_from_id(self.ss, self.id) else {
            tracing::warn!(ss = self.ss, id = self.id, "released css is not registered");
            return;
        };
        core.queue_css_release(me);
    }

    /// Wakes pollers of one of this state's files, `name` without the
    /// controller prefix.
    pub fn notify_file(&self, name: &str) {
        let (Some(core), Some(cgrp)) = (self.core.upgrade(), self.cgroup()) else {
            return;
        };
        let ss = &core.subsys[self.ss];
        let on_dfl = cgrp.is_on_dfl();
        let noprefix = cgrp.root().map_or(false, |root| root.noprefix());
        if let Some(cft) = ss.files_for(on_dfl).iter().find(|cft| cft.name == name) {
            if let Some(file) = cgrp.files.get(&cft.file_name(Some(ss.name), noprefix)) {
                file.notify();
            }
        }
    }

    pub(crate) fn has_flag(&self, flag: CssFlags) -> bool {
        CssFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    pub(crate) fn set_flag(&self, flag: CssFlags) -> bool {
        let prev = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        prev & flag.bits() != 0
    }

    pub(crate) fn clear_flag(&self, flag: CssFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }
}

impl fmt::Debug for Css {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Css")
            .field("ss", &self.ss)
            .field("id", &self.id)
            .field("serial_nr", &self.serial_nr)
            .field(
                "flags",
                &CssFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed)),
            )
            .field("refcnt", &self.refcnt.count())
            .finish()
    }
}
