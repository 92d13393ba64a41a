//! Creation and the four-stage destruction of groups and controller states.
//!
//! kill (synchronous, structural lock) -> confirmed killed / offline (queue)
//! -> release on last reference (queue) -> free after the grace delay (queue).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cgroup::{Cgroup, CgroupFlags, CgroupInit};
use crate::common::{CgroupError, ControllerError};
use crate::core::Shared;
use crate::css::{Css, CssFlags};
use crate::subsys::SubsysId;

impl Shared {
    /// Runs the online hook and publishes `css` on its group.
    pub(crate) fn online_css(&self, css: &Arc<Css>) -> Result<(), ControllerError> {
        let ss = &self.subsys[css.ss];
        ss.ctrl.css_online(css)?;
        css.set_flag(CssFlags::ONLINE);
        css.online_cnt.fetch_add(1, Ordering::AcqRel);
        if let Some(parent) = css.parent() {
            parent.online_cnt.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(cgrp) = css.cgroup() {
            cgrp.subsys.write()[css.ss] = Some(css.clone());
        }
        Ok(())
    }

    fn offline_css(&self, css: &Arc<Css>) {
        if !css.is_online() {
            return;
        }
        let ss = &self.subsys[css.ss];
        ss.ctrl.css_reset(css);
        ss.ctrl.css_offline(css);
        css.clear_flag(CssFlags::ONLINE);
        if let Some(cgrp) = css.cgroup() {
            let mut slots = cgrp.subsys.write();
            if slots[css.ss]
                .as_ref()
                .map_or(false, |cur| Arc::ptr_eq(cur, css))
            {
                slots[css.ss] = None;
            }
            drop(slots);
            cgrp.offline_waitq.wake_all();
        }
        tracing::debug!(ss = ss.name, id = css.id, "css offline");
    }

    /// Creates and onlines the state of `ssid` on `cgrp`.
    ///
    /// Caller holds the structural lock.
    pub(crate) fn css_create(
        &self,
        cgrp: &Arc<Cgroup>,
        ssid: SubsysId,
    ) -> Result<Arc<Css>, CgroupError> {
        let ss = &self.subsys[ssid];
        let parent = cgrp.parent().ok_or(CgroupError::NoDevice)?;
        let parent_css = match parent.css(ssid) {
            Some(css) => css,
            None => self.cgroup_e_css(parent, ssid),
        };

        let private = ss
            .ctrl
            .css_alloc(Some(parent_css.clone()))
            .map_err(|source| CgroupError::Controller {
                controller: ss.name.to_owned(),
                source,
            })?;
        let id = ss
            .css_idr
            .lock()
            .alloc(2, None)
            .ok_or(CgroupError::NoMemory("css id"))?;

        let css = Arc::new(Css::new(
            ssid,
            id,
            self.next_serial(),
            cgrp,
            Some(parent_css.clone()),
            private,
            self.me.clone(),
        ));
        cgrp.get();
        parent_css.get();
        parent_css.children.write().push(css.clone());
        ss.css_idr.lock().replace(id, Some(Arc::downgrade(&css)));

        if let Err(source) = self.online_css(&css) {
            parent_css
                .children
                .write()
                .retain(|c| !Arc::ptr_eq(c, &css));
            css.set_flag(CssFlags::RELEASED);
            self.queue_css_free(css);
            return Err(CgroupError::Controller {
                controller: ss.name.to_owned(),
                source,
            });
        }
        tracing::debug!(ss = ss.name, id, cgroup = %cgrp.path(), "css online");
        Ok(css)
    }

    /// Starts destruction of `css`. Idempotent.
    ///
    /// Caller holds the structural lock.
    pub(crate) fn kill_css(&self, css: &Arc<Css>) {
        if css.set_flag(CssFlags::DYING) {
            return;
        }
        self.css_clear_dir(css);
        // Keeps the state alive until it has gone offline.
        css.get();
        let released = css.refcnt.kill();
        debug_assert!(!released);
        tracing::debug!(ss = self.subsys[css.ss].name, id = css.id, "css killed");

        let css = css.clone();
        let me = self.me.clone();
        self.destroy_wq.queue(move || {
            if let Some(shared) = me.upgrade() {
                shared.css_killed(css);
            }
        });
    }

    // Children always go offline before their parent: a parent's online
    // count includes every online child.
    fn css_killed(&self, css: Arc<Css>) {
        if css.online_cnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let _state = self.state.lock();
        let mut cur = css;
        loop {
            self.offline_css(&cur);
            cur.put();
            let Some(parent) = cur.parent().cloned() else { break };
            if parent.online_cnt.fetch_sub(1, Ordering::AcqRel) != 1 {
                break;
            }
            cur = parent;
        }
    }

    pub(crate) fn queue_css_release(&self, css: Arc<Css>) {
        let me = self.me.clone();
        self.destroy_wq.queue(move || {
            if let Some(shared) = me.upgrade() {
                shared.css_release(css);
            }
        });
    }

    fn css_release(&self, css: Arc<Css>) {
        let ss = &self.subsys[css.ss];
        {
            let _state = self.state.lock();
            css.set_flag(CssFlags::RELEASED);
            if let Some(parent) = css.parent() {
                parent.children.write().retain(|c| !Arc::ptr_eq(c, &css));
            }
            ss.css_idr.lock().replace(css.id, None);
            ss.ctrl.css_released(&css);
        }
        tracing::debug!(ss = ss.name, id = css.id, "css released");
        self.queue_css_free(css);
    }

    fn queue_css_free(&self, css: Arc<Css>) {
        let me = self.me.clone();
        self.destroy_wq
            .queue_delayed(self.config.grace_period(), move || {
                if let Some(shared) = me.upgrade() {
                    shared.css_free(css);
                }
            });
    }

    fn css_free(&self, css: Arc<Css>) {
        let ss = &self.subsys[css.ss];
        ss.ctrl.css_free(&css);
        ss.css_idr.lock().remove(css.id);
        if let Some(cgrp) = css.cgroup() {
            cgrp.put();
        }
        if let Some(parent) = css.parent() {
            parent.put();
        }
        tracing::debug!(ss = ss.name, id = css.id, "css freed");
    }

    pub(crate) fn queue_cgroup_release(&self, cgrp: Arc<Cgroup>) {
        let me = self.me.clone();
        self.destroy_wq.queue(move || {
            if let Some(shared) = me.upgrade() {
                shared.cgroup_release(cgrp);
            }
        });
    }

    fn cgroup_release(&self, cgrp: Arc<Cgroup>) {
        {
            let _state = self.state.lock();
            cgrp.set_flag(CgroupFlags::RELEASED, true);
            if let Some(parent) = cgrp.parent() {
                parent.children.write().retain(|c| !Arc::ptr_eq(c, &cgrp));
                if let Some(root) = cgrp.root() {
                    root.cgroup_idr.lock().remove(cgrp.id);
                }
            }
        }
        tracing::debug!(cgroup = %cgrp.path(), "cgroup released");
        let me = self.me.clone();
        self.destroy_wq
            .queue_delayed(self.config.grace_period(), move || {
                if let Some(shared) = me.upgrade() {
                    shared.cgroup_free(cgrp);
                }
            });
    }

    fn cgroup_free(&self, cgrp: Arc<Cgroup>) {
        let root = cgrp.root();
        if let Some(root) = &root {
            root.nr_cgrps.fetch_sub(1, Ordering::AcqRel);
        }
        self.pidlist_destroy_all(&cgrp);
        match cgrp.parent() {
            Some(parent) => parent.put(),
            None => {
                if let Some(root) = root {
                    self.destroy_root(&root);
                }
            }
        }
        tracing::debug!(cgroup = %cgrp.path(), "cgroup freed");
    }

    fn cgroup_create(&self, parent: &Arc<Cgroup>, name: &str) -> Result<Arc<Cgroup>, CgroupError> {
        let root = parent.root().ok_or(CgroupError::NoDevice)?;
        let id = root
            .cgroup_idr
            .lock()
            .alloc(2, None)
            .ok_or(CgroupError::NoMemory("cgroup id"))?;

        let cgrp = Arc::new(Cgroup::new(CgroupInit {
            id,
            serial_nr: self.next_serial(),
            name: name.to_owned(),
            parent: Some(parent.clone()),
            hierarchy_id: root.id(),
            root: Arc::downgrade(&root),
            core: self.me.clone(),
            nr_subsys: self.nr_subsys(),
            immortal: false,
        }));
        cgrp.set_flag(CgroupFlags::NOTIFY_ON_RELEASE, parent.notify_on_release());
        cgrp.set_flag(CgroupFlags::CLONE_CHILDREN, parent.clone_children());

        parent.get();
        parent.children.write().push(cgrp.clone());
        root.nr_cgrps.fetch_add(1, Ordering::AcqRel);
        root.cgroup_idr
            .lock()
            .replace(id, Some(Arc::downgrade(&cgrp)));

        // Legacy hierarchies enable everything available everywhere.
        if !cgrp.is_on_dfl() {
            cgrp.set_subtree_control(cgrp.control());
        }
        self.propagate_control(&cgrp);
        Ok(cgrp)
    }

    pub(crate) fn mkdir(&self, parent: &Arc<Cgroup>, name: &str) -> Result<Arc<Cgroup>, CgroupError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\n']) {
            return Err(CgroupError::invalid(format!("invalid cgroup name {name:?}")));
        }
        let _state = self.state.lock();
        if parent.is_dead() {
            return Err(CgroupError::NoDevice);
        }
        if parent.child(name).is_some() || parent.file(name).is_some() {
            return Err(CgroupError::Exists(name.to_owned()));
        }

        let cgrp = self.cgroup_create(parent, name)?;
        self.populate_core_files(&cgrp);
        if let Err(err) = self.apply_control_enable(&cgrp) {
            if let Err(destroy_err) = self.destroy_locked(&cgrp) {
                tracing::warn!(?destroy_err, cgroup = %cgrp.path(), "failed to undo mkdir");
            }
            return Err(err);
        }
        tracing::debug!(cgroup = %cgrp.path(), hierarchy = cgrp.hierarchy_id(), "mkdir");
        Ok(cgrp)
    }

    pub(crate) fn rmdir(&self, cgrp: &Arc<Cgroup>) -> Result<(), CgroupError> {
        let _state = self.state.lock();
        if cgrp.is_dead() {
            return Err(CgroupError::NoDevice);
        }
        if cgrp.parent().is_none() {
            return Err(CgroupError::busy("cannot remove a hierarchy root"));
        }
        self.destroy_locked(cgrp)?;
        tracing::debug!(cgroup = %cgrp.path(), "rmdir");
        Ok(())
    }

    /// Caller holds the structural lock.
    pub(crate) fn destroy_locked(&self, cgrp: &Arc<Cgroup>) -> Result<(), CgroupError> {
        if cgrp.is_populated() {
            return Err(CgroupError::busy(format!("{} has tasks", cgrp.path())));
        }
        if cgrp.has_online_children() {
            return Err(CgroupError::busy(format!("{} has children", cgrp.path())));
        }

        cgrp.set_flag(CgroupFlags::DEAD, true);
        {
            let mut mb = self.css_set.lock();
            for cset in mb.cgroup_csets(cgrp) {
                mb.node_mut(&cset).dead = true;
            }
        }
        for ssid in 0..self.nr_subsys() {
            if let Some(css) = cgrp.css(ssid) {
                self.kill_css(&css);
            }
        }
        cgrp.files.clear();
        self.pidlist_destroy_all(cgrp);
        if let Some(parent) = cgrp.parent() {
            self.check_for_release(parent);
        }
        if cgrp.refcnt.kill() {
            cgrp.released();
        }
        Ok(())
    }
}
