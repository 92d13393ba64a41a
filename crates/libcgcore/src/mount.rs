//! Legacy hierarchy mounts and moving controllers between hierarchies.

use std::sync::Arc;

use crate::common::CgroupError;
use crate::core::Shared;
use crate::hierarchy::{Hierarchy, MountOptions};
use crate::mask::SubsysMask;

const MAX_ROOT_NAME_LEN: usize = 64;

fn valid_root_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ROOT_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl Shared {
    /// Controllers a mount asks for.
    fn parse_mount_mask(&self, opts: &MountOptions) -> Result<SubsysMask, CgroupError> {
        if let Some(name) = &opts.name {
            if !valid_root_name(name) {
                return Err(CgroupError::invalid(format!("invalid hierarchy name {name:?}")));
            }
        }
        let mut mask = SubsysMask::EMPTY;
        let mut all = false;
        for name in &opts.subsys {
            if name == "all" {
                all = true;
                continue;
            }
            let ss = self
                .subsys
                .iter()
                .find(|ss| ss.legacy_name == name.as_str())
                .filter(|ss| ss.enabled && !ss.no_v1)
                .ok_or_else(|| CgroupError::NoEntry(name.clone()))?;
            mask.insert(ss.id);
        }
        if all && !mask.is_empty() {
            return Err(CgroupError::invalid("\"all\" cannot be combined with controller names"));
        }
        if opts.none && (all || !mask.is_empty()) {
            return Err(CgroupError::invalid("\"none\" cannot be combined with controllers"));
        }
        if all || (!opts.none && mask.is_empty()) {
            mask = self
                .subsys
                .iter()
                .filter(|ss| ss.enabled && !ss.no_v1)
                .map(|ss| ss.id)
                .collect();
        }
        if mask.is_empty() && opts.name.is_none() {
            return Err(CgroupError::invalid("a hierarchy without controllers needs a name"));
        }
        Ok(mask)
    }

    /// Mounts a legacy hierarchy, or returns the one that already has exactly
    /// the requested name and controllers.
    pub(crate) fn mount(&self, opts: &MountOptions) -> Result<Arc<Hierarchy>, CgroupError> {
        let mask = self.parse_mount_mask(opts)?;
        let mut state = self.lock_and_drain_offline(self.dfl_root.root_cgroup());

        for root in state.roots.iter().filter(|root| !root.is_dfl()) {
            if root.root_cgroup().is_dead() {
                continue;
            }
            let name_match = opts.name.as_deref().map_or(false, |name| name == root.name());
            if name_match || root.subsys_mask().intersects(mask) {
                let same_name = opts.name.as_deref().unwrap_or_default() == root.name();
                if root.subsys_mask() != mask || !same_name {
                    return Err(CgroupError::busy(format!(
                        "controllers or name in use by hierarchy {}",
                        root.id()
                    )));
                }
                if root.noprefix() != opts.noprefix {
                    tracing::warn!(hierarchy = root.id(), "new mount options ignored for existing hierarchy");
                }
                return Ok(root.clone());
            }
        }

        let id = state
            .hierarchy_ids
            .alloc(1, Some(()))
            .ok_or(CgroupError::NoMemory("hierarchy id"))?;
        let root = Hierarchy::new(id, opts, self.me.clone(), self.next_serial(), self.nr_subsys());
        let root_cgrp = root.root_cgroup().clone();
        self.populate_core_files(&root_cgrp);

        if let Err(err) = self.rebind_subsystems(&root, mask) {
            state.hierarchy_ids.remove(id);
            return Err(err);
        }

        {
            let mut mb = self.css_set.lock();
            for cset in mb.all_csets() {
                Self::link_css_set(&mut mb, &cset, &root_cgrp);
                Self::add_subtree_tasks(&root_cgrp, mb.node(&cset).tasks.len, true);
                if mb.populated(&cset) {
                    self.cgroup_update_populated(&root_cgrp, true);
                }
            }
            root_cgrp.bump_membership();
        }
        state.roots.push(root.clone());
        tracing::info!(
            hierarchy = id,
            name = root.name(),
            controllers = ?self.mask_names(mask, false),
            "mounted hierarchy"
        );
        Ok(root)
    }

    /// Starts tearing down a legacy hierarchy. Its controllers return to the
    /// default hierarchy once the root group is freed.
    pub(crate) fn umount(&self, root: &Arc<Hierarchy>) -> Result<(), CgroupError> {
        if root.is_dfl() {
            return Err(CgroupError::invalid("the default hierarchy cannot be unmounted"));
        }
        let state = self.state.lock();
        if !state.roots.iter().any(|r| Arc::ptr_eq(r, root)) {
            return Err(CgroupError::NoDevice);
        }
        let cgrp = root.root_cgroup();
        if cgrp.is_dead() {
            return Err(CgroupError::NoDevice);
        }
        if cgrp.has_online_children() {
            return Err(CgroupError::busy(format!("hierarchy {} has groups", root.id())));
        }
        cgrp.set_flag(crate::cgroup::CgroupFlags::DEAD, true);
        drop(state);
        tracing::info!(hierarchy = root.id(), name = root.name(), "unmounting hierarchy");
        if cgrp.refcnt.kill() {
            cgrp.released();
        }
        Ok(())
    }

    /// Moves the controllers in `mask` to `dst`.
    ///
    /// Caller holds the structural lock.
    pub(crate) fn rebind_subsystems(&self, dst: &Arc<Hierarchy>, mask: SubsysMask) -> Result<(), CgroupError> {
        for ssid in mask.iter() {
            let ss = &self.subsys[ssid];
            let src = ss.root();
            let css = &self.init_cset.subsys[ssid];
            if css.children().iter().any(|child| !child.is_released()) {
                return Err(CgroupError::busy(format!("{} is in use", ss.name)));
            }
            if !src.is_dfl() && !dst.is_dfl() && !Arc::ptr_eq(&src, dst) {
                return Err(CgroupError::busy(format!(
                    "{} is bound to hierarchy {}",
                    ss.name,
                    src.id()
                )));
            }
        }

        let dfl_disable: SubsysMask = mask
            .iter()
            .filter(|&ssid| self.subsys[ssid].root().is_dfl())
            .collect();
        if !dfl_disable.is_empty() && !dst.is_dfl() {
            let scgrp = self.dfl_root.root_cgroup();
            self.dfl_root
                .set_subsys_mask(self.dfl_root.subsys_mask() - dfl_disable);
            let result = self.apply_control(scgrp);
            if let Err(err) = &result {
                tracing::warn!(?err, "failed to detach controllers from the default hierarchy");
            }
            self.finalize_control(scgrp, &Ok(()));
        }

        let dcgrp = dst.root_cgroup();
        for ssid in mask.iter() {
            let ss = &self.subsys[ssid];
            let src = ss.root();
            if Arc::ptr_eq(&src, dst) {
                continue;
            }
            let scgrp = src.root_cgroup().clone();
            let css = self.init_cset.subsys[ssid].clone();

            if !src.is_dfl() {
                src.set_subsys_mask(src.subsys_mask() - SubsysMask::single(ssid));
                if let Err(err) = self.apply_control(&scgrp) {
                    tracing::warn!(?err, ss = ss.name, "failed to detach controller");
                }
                self.finalize_control(&scgrp, &Ok(()));
            }

            // A dead source root is skipped by the walks above.
            self.css_clear_dir(&css);
            scgrp.subsys.write()[ssid] = None;
            dcgrp.subsys.write()[ssid] = Some(css.clone());
            *ss.root.write() = dst.clone();
            *css.cgroup.write() = Arc::downgrade(dcgrp);

            dst.set_subsys_mask(dst.subsys_mask() | SubsysMask::single(ssid));
            if !dst.is_dfl() {
                dcgrp.set_subtree_control(dcgrp.subtree_control() | SubsysMask::single(ssid));
            }
            let result = self.apply_control(dcgrp);
            if let Err(err) = &result {
                tracing::warn!(?err, ss = ss.name, hierarchy = dst.id(), "partial failure to rebind");
            }
            self.finalize_control(dcgrp, &Ok(()));
            ss.ctrl.bind(&css);
            tracing::debug!(ss = ss.name, from = src.id(), to = dst.id(), "rebound controller");
        }
        Ok(())
    }

    /// Final teardown of a legacy hierarchy after its root group was freed.
    pub(crate) fn destroy_root(&self, root: &Arc<Hierarchy>) {
        let mut state = self.state.lock();
        let mask = root.subsys_mask();
        if let Err(err) = self.rebind_subsystems(&self.dfl_root, mask) {
            tracing::warn!(?err, hierarchy = root.id(), "failed to return controllers");
        }
        {
            let mut mb = self.css_set.lock();
            Self::unlink_root_cgroup(&mut mb, root.root_cgroup());
        }
        root.root_cgroup().files.clear();
        state.roots.retain(|r| !Arc::ptr_eq(r, root));
        state.hierarchy_ids.remove(root.id());
        tracing::info!(hierarchy = root.id(), name = root.name(), "destroyed hierarchy");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use crate::common::CgroupError;
    use crate::test::{new_core, new_core_with_config, pid, HookCall};
    use crate::{CoreConfig, MountOptions};

    #[test]
    fn test_mount_binds_controllers() -> Result<()> {
        let (core, log) = new_core(&["a", "b"]);
        let root = core.default_root();
        assert!(root.file("a.knob").is_some());
        log.clear();

        let h = core.mount(&MountOptions::new().subsys(&["a"]))?;
        assert_eq!(h.id(), 1);
        assert_eq!(h.subsys_mask().iter().collect::<Vec<_>>(), vec![0]);
        assert!(Arc::ptr_eq(&core.controller_hierarchy(0).expect("a"), &h));
        assert!(core.controller_hierarchy(1).expect("b").is_dfl());
        let css = h.root_cgroup().css(0).expect("root state moved");
        assert!(Arc::ptr_eq(&css.cgroup().expect("owner"), h.root_cgroup()));
        assert!(root.css(0).is_none());
        assert!(root.file("a.knob").is_none());
        assert!(h.root_cgroup().file("a.knob").is_some());
        assert!(log.calls().contains(&HookCall::Bind("a")));
        assert!(!core.default_hierarchy().subsys_mask().contains(0));

        let g = core.mkdir(h.root_cgroup(), "g")?;
        assert!(g.css(0).is_some(), "legacy groups enable everything");
        Ok(())
    }

    #[test]
    fn test_mount_links_existing_tasks() -> Result<()> {
        let (core, _log) = new_core(&["a"]);
        core.fork(None, pid(10))?;
        let h = core.mount(&MountOptions::new().subsys(&["a"]))?;
        let cgrp = core.task_cgroup(pid(10), &h).expect("linked to new root");
        assert!(Arc::ptr_eq(&cgrp, h.root_cgroup()));
        assert!(h.root_cgroup().is_populated());
        assert_eq!(core.cgroup_tasks(h.root_cgroup()).count(), 1);
        Ok(())
    }

    #[test]
    fn test_mount_reuse_and_conflicts() -> Result<()> {
        let (core, _log) = new_core(&["a", "b"]);
        let h = core.mount(&MountOptions::new().subsys(&["a"]))?;
        let again = core.mount(&MountOptions::new().subsys(&["a"]))?;
        assert!(Arc::ptr_eq(&h, &again));

        let err = core
            .mount(&MountOptions::new().subsys(&["a", "b"]))
            .expect_err("a is taken");
        assert!(matches!(err, CgroupError::Busy(_)));

        let named = core.mount(&MountOptions::new().none().name("tracker"))?;
        let err = core
            .mount(&MountOptions::new().subsys(&["b"]).name("tracker"))
            .expect_err("name taken with a different mask");
        assert!(matches!(err, CgroupError::Busy(_)));
        let same = core.mount(&MountOptions::new().none().name("tracker"))?;
        assert!(Arc::ptr_eq(&named, &same));
        assert_eq!(core.hierarchies().len(), 3);
        Ok(())
    }

    #[test]
    fn test_mount_option_errors() {
        let (core, _log) = new_core(&["a"]);
        let cases = [
            (MountOptions::new().subsys(&["nope"]), "unknown"),
            (MountOptions::new().none(), "none without name"),
            (MountOptions::new().none().subsys(&["a"]).name("x"), "none with controllers"),
            (MountOptions::new().subsys(&["all", "a"]), "all with names"),
            (MountOptions::new().none().name("bad name"), "bad name"),
        ];
        for (opts, what) in cases {
            let err = core.mount(&opts).expect_err(what);
            assert!(
                matches!(err, CgroupError::InvalidArgument(_) | CgroupError::NoEntry(_)),
                "{what}: {err:?}"
            );
        }
        assert!(matches!(
            core.mount(&MountOptions::new().subsys(&["nope"])),
            Err(CgroupError::NoEntry(_))
        ));
    }

    #[test]
    fn test_no_v1_controllers_are_refused() {
        let (core, _log) = new_core_with_config(
            &["a", "b"],
            CoreConfig {
                grace_period_ms: 0,
                no_v1: vec!["b".into()],
                ..Default::default()
            },
        );
        assert!(matches!(
            core.mount(&MountOptions::new().subsys(&["b"])),
            Err(CgroupError::NoEntry(_))
        ));
        let h = core.mount(&MountOptions::new()).expect("mount all");
        assert_eq!(h.subsys_mask().iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_controller_in_use_on_default_hierarchy() {
        let (core, _log) = new_core(&["a"]);
        let root = core.default_root();
        core.write_file(&root, "cgroup.subtree_control", "+a", None)
            .expect("enable");
        let c = core.mkdir(&root, "c").expect("mkdir");
        let err = core
            .mount(&MountOptions::new().subsys(&["a"]))
            .expect_err("a has child states");
        assert!(matches!(err, CgroupError::Busy(_)));
        assert!(core.controller_hierarchy(0).expect("a").is_dfl());

        core.rmdir(&c).expect("rmdir");
        core.flush_destruction();
        core.mount(&MountOptions::new().subsys(&["a"]))
            .expect("mount once unused");
    }

    #[test]
    fn test_umount_returns_controllers() -> Result<()> {
        let (core, log) = new_core(&["a"]);
        let h = core.mount(&MountOptions::new().subsys(&["a"]))?;
        let g = core.mkdir(h.root_cgroup(), "g")?;
        assert!(matches!(core.umount(&h), Err(CgroupError::Busy(_))));
        assert!(matches!(
            core.umount(&core.default_hierarchy()),
            Err(CgroupError::InvalidArgument(_))
        ));

        core.rmdir(&g)?;
        core.flush_destruction();
        log.clear();
        core.umount(&h)?;
        core.flush_destruction();
        assert_eq!(core.hierarchies().len(), 1);
        assert!(core.controller_hierarchy(0).expect("a").is_dfl());
        assert!(core.default_root().file("a.knob").is_some());
        let css = core.default_root().css(0).expect("root state is back");
        assert!(css.is_visible());
        assert_eq!(core.read_file(&core.default_root(), "a.knob", None)?, "0\n");
        assert!(log.calls().contains(&HookCall::Bind("a")));
        assert!(matches!(core.umount(&h), Err(CgroupError::NoDevice)));

        let again = core.mount(&MountOptions::new().subsys(&["a"]))?;
        assert_eq!(again.id(), 1);
        Ok(())
    }

    #[test]
    fn test_umount_unlinks_tasks() -> Result<()> {
        let (core, _log) = new_core(&["a"]);
        core.fork(None, pid(10))?;
        let h = core.mount(&MountOptions::new().none().name("n"))?;
        assert!(core.task_cgroup(pid(10), &h).is_some());
        core.umount(&h)?;
        core.flush_destruction();
        assert!(core.task_cgroup(pid(10), &h).is_none());
        let cgrp = core
            .task_cgroup(pid(10), &core.default_hierarchy())
            .expect("still on the default hierarchy");
        assert!(Arc::ptr_eq(&cgrp, &core.default_root()));
        Ok(())
    }
}
