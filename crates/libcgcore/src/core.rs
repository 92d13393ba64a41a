use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};

use crate::cgroup::Cgroup;
use crate::common::{CgroupError, ControllerError};
use crate::config::CoreConfig;
use crate::css::Css;
use crate::css_set::{CssSet, Membership};
use crate::hierarchy::{Hierarchy, MountOptions, DFL_HIERARCHY_ID};
use crate::idr::Idr;
use crate::iter::{CssTaskIter, IterOrigin};
use crate::mask::{SubsysMask, SUBSYS_COUNT_MAX};
use crate::release::{ReleaseAgent, UsermodeReleaseAgent};
use crate::subsys::{Controller, HookMasks, Subsys, SubsysId};
use crate::workqueue::{WorkQueue, WorkQueueError};

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("at most {max} controllers can be registered, got {count}")]
    TooManyControllers { count: usize, max: usize },
    #[error("controller {0} registered twice")]
    DuplicateName(String),
    #[error("{controller} depends on unknown controller {dependency}")]
    UnknownDependency {
        controller: String,
        dependency: String,
    },
    #[error("{controller} depends on {dependency}, which must be registered first")]
    LateDependency {
        controller: String,
        dependency: String,
    },
    #[error("unknown controller {0} in configuration")]
    UnknownConfigController(String),
    #[error("failed to set up root state of {controller}: {source}")]
    RootState {
        controller: String,
        #[source]
        source: ControllerError,
    },
    #[error(transparent)]
    WorkQueue(#[from] WorkQueueError),
}

/// State protected by the structural lock.
pub(crate) struct CoreState {
    pub roots: Vec<Arc<Hierarchy>>,
    pub hierarchy_ids: Idr<()>,
}

impl CoreState {
    pub fn hierarchy(&self, id: u32) -> Option<&Arc<Hierarchy>> {
        self.roots.iter().find(|root| root.id() == id)
    }
}

pub(crate) struct Shared {
    pub config: CoreConfig,
    pub subsys: Vec<Subsys>,
    pub hooks: HookMasks,
    pub dfl_inhibit: SubsysMask,
    pub dfl_implicit: SubsysMask,
    /// Structural lock: tree shape, masks, hierarchy set.
    pub state: Mutex<CoreState>,
    /// Membership lock: sets, task links, iterators.
    pub css_set: Mutex<Membership>,
    /// Shared by single-task fork/exit, exclusive for batch migration.
    pub threadgroup: RwLock<()>,
    pub dfl_root: Arc<Hierarchy>,
    pub init_cset: Arc<CssSet>,
    pub destroy_wq: WorkQueue,
    pub pidlist_wq: WorkQueue,
    pub release_agent: Arc<dyn ReleaseAgent>,
    serial: AtomicU64,
    pub me: Weak<Shared>,
}

impl Shared {
    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::AcqRel)
    }

    pub fn nr_subsys(&self) -> usize {
        self.subsys.len()
    }

    pub fn css_from_id(&self, ssid: SubsysId, id: u32) -> Option<Arc<Css>> {
        self.subsys
            .get(ssid)?
            .css_idr
            .lock()
            .find(id)
            .and_then(|weak| weak.upgrade())
    }

    /// Recovers the shared handle of a group from a borrowed one.
    pub fn cgroup_arc(&self, cgrp: &Cgroup) -> Option<Arc<Cgroup>> {
        let root = cgrp.root()?;
        let found = root.find_cgroup(cgrp.id())?;
        std::ptr::eq(Arc::as_ptr(&found), cgrp).then_some(found)
    }

    pub fn subsys_by_name(&self, name: &str, on_dfl: bool) -> Option<&Subsys> {
        self.subsys.iter().find(|ss| {
            if on_dfl {
                ss.name == name
            } else {
                ss.legacy_name == name || ss.name == name
            }
        })
    }

    pub fn mask_names(&self, mask: SubsysMask, on_dfl: bool) -> Vec<&'static str> {
        mask.iter()
            .filter_map(|ssid| self.subsys.get(ssid))
            .map(|ss| if on_dfl { ss.name } else { ss.legacy_name })
            .collect()
    }

    /// Enabled controllers.
    pub fn enabled_mask(&self) -> SubsysMask {
        self.subsys
            .iter()
            .filter(|ss| ss.enabled)
            .map(|ss| ss.id)
            .collect()
    }
}

/// Builder for [`CgroupCore`].
#[derive(Default)]
pub struct CgroupCoreBuilder {
    config: CoreConfig,
    controllers: Vec<Box<dyn Controller>>,
    release_agent: Option<Arc<dyn ReleaseAgent>>,
}

impl CgroupCoreBuilder {
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a controller. Slots are assigned in registration order.
    pub fn controller(mut self, ctrl: Box<dyn Controller>) -> Self {
        self.controllers.push(ctrl);
        self
    }

    pub fn release_agent(mut self, agent: Arc<dyn ReleaseAgent>) -> Self {
        self.release_agent = Some(agent);
        self
    }

    pub fn build(self) -> Result<CgroupCore, BuildError> {
        let CgroupCoreBuilder {
            config,
            controllers,
            release_agent,
        } = self;

        if controllers.len() > SUBSYS_COUNT_MAX {
            return Err(BuildError::TooManyControllers {
                count: controllers.len(),
                max: SUBSYS_COUNT_MAX,
            });
        }
        let names: Vec<&'static str> = controllers.iter().map(|c| c.name()).collect();
        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(*name) {
                return Err(BuildError::DuplicateName(name.to_string()));
            }
        }

        let mut depends = Vec::with_capacity(controllers.len());
        for (ssid, ctrl) in controllers.iter().enumerate() {
            let mut mask = SubsysMask::EMPTY;
            for dep in ctrl.depends_on() {
                match names.iter().position(|n| *n == dep) {
                    Some(dep_id) if dep_id < ssid => mask.insert(dep_id),
                    Some(_) => {
                        return Err(BuildError::LateDependency {
                            controller: ctrl.name().to_owned(),
                            dependency: dep.to_owned(),
                        })
                    }
                    None => {
                        return Err(BuildError::UnknownDependency {
                            controller: ctrl.name().to_owned(),
                            dependency: dep.to_owned(),
                        })
                    }
                }
            }
            depends.push(mask);
        }

        // Dependencies are resolved in slot order, so one pass over the
        // earlier slots yields the transitive closure.
        for ssid in 0..depends.len() {
            let mut closure = depends[ssid];
            for dep in depends[ssid].iter() {
                closure |= depends[dep];
            }
            depends[ssid] = closure;
        }

        let mask_of = |list: &[String]| -> Result<SubsysMask, BuildError> {
            list.iter()
                .map(|name| {
                    names
                        .iter()
                        .position(|n| n == name)
                        .ok_or_else(|| BuildError::UnknownConfigController(name.clone()))
                })
                .collect()
        };
        let disabled = mask_of(&config.disabled)?;
        let no_v1 = mask_of(&config.no_v1)?;
        let dfl_inhibit = mask_of(&config.dfl_inhibit)?;

        let mut privates = Vec::with_capacity(controllers.len());
        for ctrl in &controllers {
            let private = ctrl
                .css_alloc(None)
                .map_err(|source| BuildError::RootState {
                    controller: ctrl.name().to_owned(),
                    source,
                })?;
            privates.push(private);
        }

        let destroy_wq = WorkQueue::new("cgroup_destroy", config.destroy_workers)?;
        let pidlist_wq = WorkQueue::new("cgroup_pidlist_destroy", 1)?;
        let release_agent = release_agent.unwrap_or_else(|| Arc::new(UsermodeReleaseAgent));

        let mut hooks = HookMasks::default();
        let mut dfl_implicit = SubsysMask::EMPTY;
        for (ssid, ctrl) in controllers.iter().enumerate() {
            hooks.record(ssid, ctrl.task_hooks());
            if ctrl.implicit_on_dfl() {
                dfl_implicit.insert(ssid);
            }
        }
        let nr_subsys = controllers.len();

        let shared = Arc::new_cyclic(|me: &Weak<Shared>| {
            let serial = AtomicU64::new(0);
            let dfl_root = Hierarchy::new(
                DFL_HIERARCHY_ID,
                &MountOptions::default(),
                me.clone(),
                serial.fetch_add(1, Ordering::AcqRel),
                nr_subsys,
            );

            let mut root_csses = Vec::with_capacity(nr_subsys);
            let mut subsys = Vec::with_capacity(nr_subsys);
            for ((ssid, ctrl), private) in controllers.into_iter().enumerate().zip(privates) {
                let mut idr = Idr::new();
                let id = idr.alloc(1, None).unwrap_or(1);
                let css = Arc::new(Css::new(
                    ssid,
                    id,
                    serial.fetch_add(1, Ordering::AcqRel),
                    dfl_root.root_cgroup(),
                    None,
                    private,
                    me.clone(),
                ));
                idr.replace(id, Some(Arc::downgrade(&css)));
                root_csses.push(css);

                let dfl_files = ctrl.dfl_files().into_iter().map(Arc::new).collect();
                let legacy_files = ctrl.legacy_files().into_iter().map(Arc::new).collect();
                subsys.push(Subsys {
                    id: ssid,
                    name: ctrl.name(),
                    legacy_name: ctrl.legacy_name(),
                    depends_on: depends[ssid],
                    implicit_on_dfl: ctrl.implicit_on_dfl(),
                    enabled: !disabled.contains(ssid),
                    no_v1: no_v1.contains(ssid),
                    dfl_files,
                    legacy_files,
                    ctrl,
                    root: RwLock::new(dfl_root.clone()),
                    css_idr: Mutex::new(idr),
                });
            }

            let enabled: SubsysMask = subsys
                .iter()
                .filter(|ss| ss.enabled)
                .map(|ss| ss.id)
                .collect();
            dfl_root.set_subsys_mask(enabled);

            let mut mb = Membership::default();
            let init_cset =
                Shared::register_init_css_set(&mut mb, root_csses, dfl_root.root_cgroup());

            let mut hierarchy_ids = Idr::new();
            hierarchy_ids.alloc(DFL_HIERARCHY_ID, Some(()));

            Shared {
                config,
                subsys,
                hooks,
                dfl_inhibit,
                dfl_implicit,
                state: Mutex::new(CoreState {
                    roots: vec![dfl_root.clone()],
                    hierarchy_ids,
                }),
                css_set: Mutex::new(mb),
                threadgroup: RwLock::new(()),
                dfl_root,
                init_cset,
                destroy_wq,
                pidlist_wq,
                release_agent,
                serial,
                me: me.clone(),
            }
        });

        {
            let _state = shared.state.lock();
            for ss in &shared.subsys {
                let css = shared.init_cset.subsys[ss.id].clone();
                shared
                    .online_css(&css)
                    .map_err(|source| BuildError::RootState {
                        controller: ss.name.to_owned(),
                        source,
                    })?;
            }
            let root = shared.dfl_root.root_cgroup().clone();
            shared.propagate_control(&root);
            shared.populate_core_files(&root);
            for ssid in root.ss_mask().iter() {
                if let Some(css) = root.css(ssid) {
                    shared.css_populate_dir(&css);
                }
            }
        }
        tracing::debug!(controllers = ?shared.mask_names(shared.enabled_mask(), true), "cgroup core initialized");
        Ok(CgroupCore { shared })
    }
}

/// Handle to one cgroup engine.
#[derive(Clone)]
pub struct CgroupCore {
    shared: Arc<Shared>,
}

impl CgroupCore {
    pub fn builder() -> CgroupCoreBuilder {
        CgroupCoreBuilder::default()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }

    pub fn default_hierarchy(&self) -> Arc<Hierarchy> {
        self.shared.dfl_root.clone()
    }

    pub fn default_root(&self) -> Arc<Cgroup> {
        self.shared.dfl_root.root_cgroup().clone()
    }

    pub fn hierarchies(&self) -> Vec<Arc<Hierarchy>> {
        self.shared.state.lock().roots.clone()
    }

    pub fn hierarchy(&self, id: u32) -> Option<Arc<Hierarchy>> {
        self.shared.state.lock().hierarchy(id).cloned()
    }

    pub fn controller_id(&self, name: &str) -> Option<SubsysId> {
        self.shared
            .subsys
            .iter()
            .find(|ss| ss.name == name)
            .map(|ss| ss.id)
    }

    pub fn controller_names(&self) -> Vec<&'static str> {
        self.shared.subsys.iter().map(|ss| ss.name).collect()
    }

    /// The controller's current hierarchy.
    pub fn controller_hierarchy(&self, ssid: SubsysId) -> Option<Arc<Hierarchy>> {
        self.shared.subsys.get(ssid).map(|ss| ss.root())
    }

    pub fn mkdir(&self, parent: &Arc<Cgroup>, name: &str) -> Result<Arc<Cgroup>, CgroupError> {
        self.shared.mkdir(parent, name)
    }

    pub fn rmdir(&self, cgrp: &Arc<Cgroup>) -> Result<(), CgroupError> {
        self.shared.rmdir(cgrp)
    }

    /// Resolves a slash-separated path below the root of `hierarchy`.
    pub fn lookup(&self, hierarchy: &Hierarchy, path: &str) -> Option<Arc<Cgroup>> {
        let mut cur = hierarchy.root_cgroup().clone();
        for name in path.split('/').filter(|s| !s.is_empty()) {
            cur = cur.child(name)?;
        }
        Some(cur)
    }

    pub fn cgroup_from_id(&self, hierarchy: &Hierarchy, id: u32) -> Option<Arc<Cgroup>> {
        hierarchy.find_cgroup(id)
    }

    pub fn css_from_id(&self, ssid: SubsysId, id: u32) -> Option<Arc<Css>> {
        self.shared.css_from_id(ssid, id)
    }

    /// Online effective state of `ssid` for `cgrp` with a reference taken.
    /// Falls back to the controller's root state; release it with `put`.
    pub fn get_e_css(&self, cgrp: &Arc<Cgroup>, ssid: SubsysId) -> Option<Arc<Css>> {
        if ssid >= self.shared.nr_subsys() {
            return None;
        }
        let mut cur = Some(cgrp.clone());
        while let Some(c) = cur {
            if let Some(css) = c.css(ssid) {
                if css.tryget_online() {
                    return Some(css);
                }
            }
            cur = c.parent().cloned();
        }
        let css = self.shared.init_cset.subsys[ssid].clone();
        css.get();
        Some(css)
    }

    pub fn attach(&self, dst: &Arc<Cgroup>, pid: Pid, threadgroup: bool) -> Result<(), CgroupError> {
        self.shared.attach(dst, pid, threadgroup)
    }

    pub fn transfer_tasks(&self, to: &Arc<Cgroup>, from: &Arc<Cgroup>) -> Result<(), CgroupError> {
        self.shared.transfer_tasks(to, from)
    }

    pub fn attach_task_all(&self, from: Pid, task: Pid) -> Result<(), CgroupError> {
        self.shared.attach_task_all(from, task)
    }

    pub fn mount(&self, opts: &MountOptions) -> Result<Arc<Hierarchy>, CgroupError> {
        self.shared.mount(opts)
    }

    pub fn umount(&self, hierarchy: &Arc<Hierarchy>) -> Result<(), CgroupError> {
        self.shared.umount(hierarchy)
    }

    /// Tasks whose group on that hierarchy is `cgrp` itself.
    pub fn cgroup_tasks(&self, cgrp: &Arc<Cgroup>) -> CssTaskIter {
        CssTaskIter::start(&self.shared, IterOrigin::Cgroup(cgrp.serial_nr()))
    }

    /// Tasks for which `css` is the effective state.
    pub fn css_tasks(&self, css: &Arc<Css>) -> CssTaskIter {
        CssTaskIter::start(&self.shared, IterOrigin::Css(css.serial_nr()))
    }

    pub fn task_css_set(&self, pid: Pid) -> Option<Arc<CssSet>> {
        let mb = self.shared.css_set.lock();
        mb.task(pid).map(|task| task.cset.clone())
    }

    pub fn task_cgroup(&self, pid: Pid, hierarchy: &Hierarchy) -> Option<Arc<Cgroup>> {
        let mb = self.shared.css_set.lock();
        let cset = mb.task(pid)?.cset.clone();
        mb.cset_cgroup(&cset, hierarchy.id())
    }

    pub fn task_css(&self, pid: Pid, ssid: SubsysId) -> Option<Arc<Css>> {
        let mb = self.shared.css_set.lock();
        mb.task(pid).and_then(|task| task.cset.subsys.get(ssid).cloned())
    }

    pub fn nr_css_sets(&self) -> usize {
        self.shared.css_set.lock().css_set_count()
    }

    /// Waits until queued teardown, including grace delays, has finished.
    pub fn flush_destruction(&self) {
        self.shared.destroy_wq.flush();
    }

    pub fn flush_destruction_timeout(&self, timeout: Duration) -> bool {
        self.shared.destroy_wq.flush_timeout(timeout)
    }
}
