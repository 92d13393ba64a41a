//! Controller enable/disable across a subtree.
//!
//! A change runs as: save masks, update `subtree_control`, propagate the
//! masks down, create newly needed states, move every task of the subtree to
//! freshly resolved sets, and finally kill or hide states that are no longer
//! needed. On failure the saved masks are restored before the last step so
//! everything created along the way is torn down again.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::cgroup::Cgroup;
use crate::common::CgroupError;
use crate::core::{CoreState, Shared};
use crate::css::Css;
use crate::iter::{live_descendants_post, live_descendants_pre};
use crate::mask::SubsysMask;

impl Shared {
    /// Closure of `subtree_control` under dependencies and implicit
    /// controllers, limited to what the group itself has.
    pub(crate) fn calc_subtree_ss_mask(
        &self,
        subtree_control: SubsysMask,
        this_ss_mask: SubsysMask,
    ) -> SubsysMask {
        let mut cur = subtree_control | self.dfl_implicit;
        loop {
            let mut new = cur;
            for ssid in cur.iter() {
                new |= self.subsys[ssid].depends_on;
            }
            new &= this_ss_mask;
            if new == cur {
                return cur;
            }
            cur = new;
        }
    }

    /// Recomputes the masks of every live group of the subtree, top-down.
    pub(crate) fn propagate_control(&self, cgrp: &Arc<Cgroup>) {
        for dsct in live_descendants_pre(cgrp) {
            dsct.set_subtree_control(dsct.subtree_control() & dsct.control());
            dsct.set_subtree_ss_mask(
                self.calc_subtree_ss_mask(dsct.subtree_control(), dsct.ss_mask()),
            );
        }
    }

    fn save_control(&self, cgrp: &Arc<Cgroup>) {
        for dsct in live_descendants_pre(cgrp) {
            dsct.save_control();
        }
    }

    fn restore_control(&self, cgrp: &Arc<Cgroup>) {
        for dsct in live_descendants_pre(cgrp) {
            dsct.restore_control();
        }
    }

    /// Whether the files of `css` should be shown.
    pub(crate) fn css_visible(&self, css: &Css) -> bool {
        let Some(cgrp) = css.cgroup() else {
            return false;
        };
        let ssid = css.ssid();
        if cgrp.control().contains(ssid) {
            return true;
        }
        if !cgrp.ss_mask().contains(ssid) {
            return false;
        }
        cgrp.is_on_dfl() && self.subsys[ssid].implicit_on_dfl
    }

    /// Creates missing states top-down and shows the visible ones.
    pub(crate) fn apply_control_enable(&self, cgrp: &Arc<Cgroup>) -> Result<(), CgroupError> {
        for dsct in live_descendants_pre(cgrp) {
            for ssid in 0..self.nr_subsys() {
                if !dsct.ss_mask().contains(ssid) {
                    continue;
                }
                let css = match dsct.css(ssid) {
                    Some(css) => css,
                    None => self.css_create(&dsct, ssid)?,
                };
                if self.css_visible(&css) {
                    self.css_populate_dir(&css);
                }
            }
        }
        Ok(())
    }

    /// Kills unneeded states bottom-up and hides the invisible ones.
    pub(crate) fn apply_control_disable(&self, cgrp: &Arc<Cgroup>) {
        for dsct in live_descendants_post(cgrp) {
            for ssid in 0..self.nr_subsys() {
                let Some(css) = dsct.css(ssid) else { continue };
                if css.parent().is_some() && !dsct.ss_mask().contains(ssid) {
                    self.kill_css(&css);
                } else if !self.css_visible(&css) {
                    self.css_clear_dir(&css);
                    self.subsys[ssid].ctrl.css_reset(&css);
                }
            }
        }
    }

    pub(crate) fn apply_control(&self, cgrp: &Arc<Cgroup>) -> Result<(), CgroupError> {
        self.propagate_control(cgrp);
        self.apply_control_enable(cgrp)?;
        self.update_dfl_csses(cgrp)
    }

    pub(crate) fn finalize_control(&self, cgrp: &Arc<Cgroup>, result: &Result<(), CgroupError>) {
        if result.is_err() {
            self.restore_control(cgrp);
            self.propagate_control(cgrp);
        }
        self.apply_control_disable(cgrp);
    }

    /// Takes the structural lock once no state in the subtree is dying.
    pub(crate) fn lock_and_drain_offline(&self, cgrp: &Arc<Cgroup>) -> MutexGuard<'_, CoreState> {
        'restart: loop {
            let state = self.state.lock();
            for dsct in live_descendants_post(cgrp) {
                for ssid in 0..self.nr_subsys() {
                    let Some(css) = dsct.css(ssid) else { continue };
                    if !css.refcnt.is_dying() {
                        continue;
                    }
                    let seen = dsct.offline_waitq.generation();
                    drop(state);
                    tracing::debug!(cgroup = %dsct.path(), ss = self.subsys[ssid].name, "waiting for css to go offline");
                    dsct.offline_waitq.wait_past(seen);
                    continue 'restart;
                }
            }
            return state;
        }
    }

    /// Parses a `+name -name` control write into enable and disable masks.
    pub(crate) fn parse_subtree_control(
        &self,
        buf: &str,
    ) -> Result<(SubsysMask, SubsysMask), CgroupError> {
        let mut enable = SubsysMask::EMPTY;
        let mut disable = SubsysMask::EMPTY;
        for tok in buf.split_whitespace() {
            let (on, name) = if let Some(name) = tok.strip_prefix('+') {
                (true, name)
            } else if let Some(name) = tok.strip_prefix('-') {
                (false, name)
            } else {
                return Err(CgroupError::invalid(format!("bad control token {tok:?}")));
            };
            let ss = self
                .subsys
                .iter()
                .find(|ss| ss.enabled && !self.dfl_inhibit.contains(ss.id) && ss.name == name)
                .ok_or_else(|| CgroupError::invalid(format!("unknown controller {name:?}")))?;
            if on {
                enable.insert(ss.id);
                disable.remove(ss.id);
            } else {
                disable.insert(ss.id);
                enable.remove(ss.id);
            }
        }
        Ok((enable, disable))
    }

    /// Handles a write to `cgroup.subtree_control`.
    pub(crate) fn subtree_control_write(
        &self,
        cgrp: &Arc<Cgroup>,
        buf: &str,
    ) -> Result<(), CgroupError> {
        let (mut enable, mut disable) = self.parse_subtree_control(buf)?;

        let _state = self.lock_and_drain_offline(cgrp);
        if cgrp.is_dead() {
            return Err(CgroupError::NoDevice);
        }

        for ssid in enable.iter() {
            if cgrp.subtree_control().contains(ssid) {
                enable.remove(ssid);
                continue;
            }
            if !cgrp.control().contains(ssid) {
                return Err(CgroupError::NoEntry(self.subsys[ssid].name.to_owned()));
            }
        }
        for ssid in disable.iter() {
            if !cgrp.subtree_control().contains(ssid) {
                disable.remove(ssid);
                continue;
            }
            let in_use = cgrp
                .children()
                .iter()
                .any(|child| !child.is_dead() && child.subtree_control().contains(ssid));
            if in_use {
                return Err(CgroupError::busy(format!(
                    "{} is still enabled below {}",
                    self.subsys[ssid].name,
                    cgrp.path()
                )));
            }
        }

        if enable.is_empty() && disable.is_empty() {
            return Ok(());
        }

        // Only leaves and the root may hold tasks while controllers are
        // enabled for the children.
        if !enable.is_empty() && cgrp.parent().is_some() {
            let mb = self.css_set.lock();
            if mb
                .cgroup_csets(cgrp)
                .iter()
                .any(|cset| mb.populated(cset))
            {
                return Err(CgroupError::busy(format!("{} has tasks", cgrp.path())));
            }
        }

        self.save_control(cgrp);
        cgrp.set_subtree_control((cgrp.subtree_control() | enable) - disable);

        let result = self.apply_control(cgrp);
        self.finalize_control(cgrp, &result);
        tracing::debug!(
            cgroup = %cgrp.path(),
            enabled = ?self.mask_names(enable, true),
            disabled = ?self.mask_names(disable, true),
            ok = result.is_ok(),
            "subtree_control updated"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::common::CgroupError;
    use crate::mask::SubsysMask;
    use crate::test::{new_core, new_core_with, pid, ControllerSpec};

    #[test]
    fn test_dependency_closure() {
        let (core, _log) = new_core_with(vec![
            ControllerSpec::new("a"),
            ControllerSpec::new("b").depends_on(&["a"]),
            ControllerSpec::new("c").depends_on(&["b"]),
        ]);
        let shared = core.shared();
        let all = SubsysMask::first(3);
        let got = shared.calc_subtree_ss_mask(SubsysMask::single(2), all);
        assert_eq!(got, all);
        let got = shared.calc_subtree_ss_mask(SubsysMask::single(2), SubsysMask::single(2));
        assert_eq!(got, SubsysMask::single(2));
    }

    #[test]
    fn test_dependency_enabled_but_hidden() {
        let (core, _log) = new_core_with(vec![
            ControllerSpec::new("a"),
            ControllerSpec::new("b").depends_on(&["a"]),
        ]);
        let root = core.default_root();
        core.write_file(&root, "cgroup.subtree_control", "+b", None)
            .expect("enable b");
        let c = core.mkdir(&root, "c").expect("mkdir");
        let a = c.css(0).expect("a pulled in by b");
        let b = c.css(1).expect("b enabled");
        assert!(b.is_visible());
        assert!(!a.is_visible());
        assert_eq!(root.subtree_control(), SubsysMask::single(1));
        assert_eq!(root.subtree_ss_mask(), SubsysMask::first(2));
        assert_eq!(
            core.read_file(&c, "cgroup.controllers", None).expect("read"),
            "b\n"
        );
    }

    #[test]
    fn test_implicit_controller_everywhere() {
        let (core, _log) = new_core_with(vec![
            ControllerSpec::new("a"),
            ControllerSpec::new("perf").implicit_on_dfl(),
        ]);
        let root = core.default_root();
        let c = core.mkdir(&root, "c").expect("mkdir");
        let perf = c.css(1).expect("implicit state exists");
        assert!(perf.is_visible());
        assert!(c.css(0).is_none());
        assert_eq!(
            core.read_file(&root, "cgroup.controllers", None).expect("read"),
            "a\n"
        );
        let err = core
            .write_file(&root, "cgroup.subtree_control", "+perf", None)
            .expect_err("implicit controllers cannot be toggled");
        assert!(matches!(err, CgroupError::NoEntry(_)));
    }

    #[test]
    fn test_control_write_errors() {
        let (core, _log) = new_core(&["a", "b"]);
        let root = core.default_root();
        let p = core.mkdir(&root, "p").expect("mkdir p");

        for bad in ["a", "+x", "+", "*a"] {
            let err = core
                .write_file(&root, "cgroup.subtree_control", bad, None)
                .expect_err(bad);
            assert!(matches!(err, CgroupError::InvalidArgument(_)), "{bad}");
        }

        // Not enabled on the parent yet.
        let err = core
            .write_file(&p, "cgroup.subtree_control", "+a", None)
            .expect_err("not available");
        assert!(matches!(err, CgroupError::NoEntry(_)));

        core.write_file(&root, "cgroup.subtree_control", "+a +b", None)
            .expect("enable on root");
        core.write_file(&p, "cgroup.subtree_control", "+a", None)
            .expect("enable on p");
        let err = core
            .write_file(&root, "cgroup.subtree_control", "-a", None)
            .expect_err("still used by p");
        assert!(matches!(err, CgroupError::Busy(_)));

        // Internal tasks are not allowed once controllers are enabled.
        let q = core.mkdir(&root, "q").expect("mkdir q");
        core.fork(None, pid(10)).expect("fork");
        core.attach(&q, pid(10), false).expect("attach");
        let err = core
            .write_file(&q, "cgroup.subtree_control", "+b", None)
            .expect_err("q has tasks");
        assert!(matches!(err, CgroupError::Busy(_)));

        // No-op writes succeed.
        core.write_file(&root, "cgroup.subtree_control", "+a -x", None)
            .expect_err("unknown name still rejected");
        core.write_file(&root, "cgroup.subtree_control", "+a", None)
            .expect("already enabled");
        core.write_file(&q, "cgroup.subtree_control", "-b", None)
            .expect("not enabled");
    }

    #[test]
    fn test_enable_moves_tasks_to_new_states() {
        let (core, _log) = new_core(&["a"]);
        let root = core.default_root();
        let c = core.mkdir(&root, "c").expect("mkdir");
        core.fork(None, pid(10)).expect("fork");
        core.attach(&c, pid(10), false).expect("attach");
        let root_css = root.css(0).expect("root css");
        assert!(Arc::ptr_eq(&core.task_css(pid(10), 0).expect("css"), &root_css));

        core.write_file(&root, "cgroup.subtree_control", "+a", None)
            .expect("enable");
        let c_css = c.css(0).expect("c css");
        assert!(Arc::ptr_eq(&core.task_css(pid(10), 0).expect("css"), &c_css));

        core.write_file(&root, "cgroup.subtree_control", "-a", None)
            .expect("disable");
        assert!(Arc::ptr_eq(&core.task_css(pid(10), 0).expect("css"), &root_css));
        core.flush_destruction();
        assert!(c_css.is_released());
        assert!(c.css(0).is_none());
    }

    #[test]
    fn test_failed_enable_restores_masks() {
        let (core, log) = new_core(&["a", "b"]);
        let root = core.default_root();
        let c = core.mkdir(&root, "c").expect("mkdir");
        log.fail_alloc("b", true);
        let err = core
            .write_file(&root, "cgroup.subtree_control", "+a +b", None)
            .expect_err("b cannot allocate");
        assert!(matches!(err, CgroupError::Controller { .. }));
        assert_eq!(root.subtree_control(), SubsysMask::EMPTY);
        core.flush_destruction();
        assert!(c.css(0).is_none());
        assert!(c.css(1).is_none());
    }
}
