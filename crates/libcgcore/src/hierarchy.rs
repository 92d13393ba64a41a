use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::cgroup::{Cgroup, CgroupInit};
use crate::core::Shared;
use crate::idr::Idr;
use crate::mask::SubsysMask;

pub const DFL_HIERARCHY_ID: u32 = 0;

/// One hierarchy and its root group.
pub struct Hierarchy {
    id: u32,
    name: String,
    cgrp: Arc<Cgroup>,
    subsys_mask: AtomicU32,
    pub(crate) nr_cgrps: AtomicUsize,
    pub(crate) cgroup_idr: Mutex<Idr<Weak<Cgroup>>>,
    release_agent_path: Mutex<String>,
    noprefix: bool,
}

impl Hierarchy {
    pub(crate) fn new(
        id: u32,
        opts: &MountOptions,
        core: Weak<Shared>,
        serial_nr: u64,
        nr_subsys: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Hierarchy>| {
            let mut idr = Idr::new();
            // Root groups always get id 1.
            let root_id = idr.alloc(1, None).unwrap_or(1);
            let cgrp = Arc::new(Cgroup::new(CgroupInit {
                id: root_id,
                serial_nr,
                name: String::new(),
                parent: None,
                hierarchy_id: id,
                root: me.clone(),
                core,
                nr_subsys,
                immortal: id == DFL_HIERARCHY_ID,
            }));
            idr.replace(root_id, Some(Arc::downgrade(&cgrp)));
            cgrp.set_flag(
                crate::cgroup::CgroupFlags::CLONE_CHILDREN,
                opts.clone_children,
            );
            Hierarchy {
                id,
                name: opts.name.clone().unwrap_or_default(),
                cgrp,
                subsys_mask: AtomicU32::new(0),
                nr_cgrps: AtomicUsize::new(1),
                cgroup_idr: Mutex::new(idr),
                release_agent_path: Mutex::new(opts.release_agent.clone().unwrap_or_default()),
                noprefix: opts.noprefix,
            }
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dfl(&self) -> bool {
        self.id == DFL_HIERARCHY_ID
    }

    pub fn root_cgroup(&self) -> &Arc<Cgroup> {
        &self.cgrp
    }

    pub fn subsys_mask(&self) -> SubsysMask {
        SubsysMask::from_bits(self.subsys_mask.load(Ordering::Acquire))
    }

    pub(crate) fn set_subsys_mask(&self, mask: SubsysMask) {
        self.subsys_mask.store(mask.bits(), Ordering::Release);
    }

    pub fn nr_cgrps(&self) -> usize {
        self.nr_cgrps.load(Ordering::Acquire)
    }

    pub fn noprefix(&self) -> bool {
        self.noprefix
    }

    pub fn release_agent_path(&self) -> String {
        self.release_agent_path.lock().clone()
    }

    pub(crate) fn set_release_agent_path(&self, path: &str) {
        *self.release_agent_path.lock() = path.to_owned();
    }

    pub(crate) fn find_cgroup(&self, id: u32) -> Option<Arc<Cgroup>> {
        if id == self.cgrp.id() {
            return Some(self.cgrp.clone());
        }
        self.cgroup_idr.lock().find(id).and_then(|weak| weak.upgrade())
    }
}

impl fmt::Debug for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hierarchy")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("subsys_mask", &self.subsys_mask())
            .field("nr_cgrps", &self.nr_cgrps())
            .finish()
    }
}

/// Options of a legacy hierarchy mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Controllers to bind. Empty without `none` means every available one.
    pub subsys: Vec<String>,
    /// Bind no controllers, requires `name`.
    pub none: bool,
    pub name: Option<String>,
    pub noprefix: bool,
    pub clone_children: bool,
    pub release_agent: Option<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subsys(mut self, names: &[&str]) -> Self {
        self.subsys = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn none(mut self) -> Self {
        self.none = true;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn noprefix(mut self) -> Self {
        self.noprefix = true;
        self
    }

    pub fn clone_children(mut self) -> Self {
        self.clone_children = true;
        self
    }

    pub fn release_agent(mut self, path: &str) -> Self {
        self.release_agent = Some(path.to_owned());
        self
    }
}
