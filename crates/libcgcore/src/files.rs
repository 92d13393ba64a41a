//! Interface files of groups: creation, removal, reads, writes and polling.

use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Pid;

use crate::cftype::{file_mode, CfTypeFlags, CgroupFile, CoreFile, FileKind};
use crate::cgroup::{Cgroup, CgroupFlags};
use crate::common::{
    parse_bool_flag, parse_id, CgroupError, CGROUP_CLONE_CHILDREN, CGROUP_CONTROLLERS,
    CGROUP_EVENTS, CGROUP_NOTIFY_ON_RELEASE, CGROUP_PROCS, CGROUP_RELEASE_AGENT,
    CGROUP_SANE_BEHAVIOR, CGROUP_SUBTREE_CONTROL, CGROUP_TASKS,
};
use crate::core::{CgroupCore, Shared};
use crate::css::{Css, CssFlags};
use crate::pidlist::PidlistKind;

struct CoreFileDesc {
    name: &'static str,
    file: CoreFile,
    writable: bool,
    flags: CfTypeFlags,
}

const fn desc(name: &'static str, file: CoreFile, writable: bool, flags: CfTypeFlags) -> CoreFileDesc {
    CoreFileDesc {
        name,
        file,
        writable,
        flags,
    }
}

const DFL_FILES: &[CoreFileDesc] = &[
    desc(CGROUP_PROCS, CoreFile::Procs, true, CfTypeFlags::empty()),
    desc(CGROUP_CONTROLLERS, CoreFile::Controllers, false, CfTypeFlags::empty()),
    desc(CGROUP_SUBTREE_CONTROL, CoreFile::SubtreeControl, true, CfTypeFlags::empty()),
    desc(CGROUP_EVENTS, CoreFile::Events, false, CfTypeFlags::NOT_ON_ROOT),
];

const LEGACY_FILES: &[CoreFileDesc] = &[
    desc(CGROUP_PROCS, CoreFile::Procs, true, CfTypeFlags::empty()),
    desc(CGROUP_TASKS, CoreFile::Tasks, true, CfTypeFlags::empty()),
    desc(CGROUP_CLONE_CHILDREN, CoreFile::CloneChildren, true, CfTypeFlags::empty()),
    desc(CGROUP_NOTIFY_ON_RELEASE, CoreFile::NotifyOnRelease, true, CfTypeFlags::empty()),
    desc(CGROUP_SANE_BEHAVIOR, CoreFile::SaneBehavior, false, CfTypeFlags::ONLY_ON_ROOT),
    desc(CGROUP_RELEASE_AGENT, CoreFile::ReleaseAgent, true, CfTypeFlags::ONLY_ON_ROOT),
];

fn flag_line(on: bool) -> String {
    format!("{}\n", u8::from(on))
}

impl Shared {
    /// Creates the engine's own files on `cgrp`.
    pub(crate) fn populate_core_files(&self, cgrp: &Arc<Cgroup>) {
        let is_root = cgrp.parent().is_none();
        let table = if cgrp.is_on_dfl() {
            DFL_FILES
        } else {
            LEGACY_FILES
        };
        for d in table {
            if is_root && d.flags.contains(CfTypeFlags::NOT_ON_ROOT)
                || !is_root && d.flags.contains(CfTypeFlags::ONLY_ON_ROOT)
            {
                continue;
            }
            let mode = file_mode(true, d.writable, d.flags);
            cgrp.files.add(CgroupFile::new(
                d.name.to_owned(),
                mode,
                FileKind::Core(d.file),
            ));
        }
    }

    /// Shows the controller files of `css` on its group. Idempotent.
    pub(crate) fn css_populate_dir(&self, css: &Arc<Css>) {
        let Some(cgrp) = css.cgroup() else { return };
        if css.set_flag(CssFlags::VISIBLE) {
            return;
        }
        let ss = &self.subsys[css.ss];
        let is_root = cgrp.parent().is_none();
        let noprefix = cgrp.root().map_or(false, |root| root.noprefix());
        for cft in ss.files_for(cgrp.is_on_dfl()) {
            if !cft.applies_to(is_root) {
                continue;
            }
            let name = cft.file_name(Some(ss.name), noprefix);
            cgrp.files.add(CgroupFile::new(
                name,
                cft.mode(),
                FileKind::Subsys {
                    css: Arc::downgrade(css),
                    cft: cft.clone(),
                },
            ));
        }
    }

    pub(crate) fn css_clear_dir(&self, css: &Arc<Css>) {
        if !css.is_visible() {
            return;
        }
        css.clear_flag(CssFlags::VISIBLE);
        if let Some(cgrp) = css.cgroup() {
            cgrp.files.remove_css(css);
        }
    }

    fn read_core_file(
        &self,
        cgrp: &Arc<Cgroup>,
        file: CoreFile,
        ns: u64,
    ) -> Result<String, CgroupError> {
        let out = match file {
            CoreFile::Procs | CoreFile::Tasks => {
                let kind = if file == CoreFile::Procs {
                    PidlistKind::Procs
                } else {
                    PidlistKind::Tasks
                };
                let pids = self.pidlist_load(cgrp, kind, ns);
                let mut out = String::with_capacity(pids.len() * 8);
                for pid in pids.iter() {
                    out.push_str(&pid.to_string());
                    out.push('\n');
                }
                out
            }
            CoreFile::Controllers => self.mask_names(cgrp.control(), true).join(" ") + "\n",
            CoreFile::SubtreeControl => {
                self.mask_names(cgrp.subtree_control(), true).join(" ") + "\n"
            }
            CoreFile::Events => format!("populated {}\n", u8::from(cgrp.is_populated())),
            CoreFile::CloneChildren => flag_line(cgrp.clone_children()),
            CoreFile::NotifyOnRelease => flag_line(cgrp.notify_on_release()),
            CoreFile::SaneBehavior => flag_line(false),
            CoreFile::ReleaseAgent => {
                let _state = self.state.lock();
                let root = cgrp.root().ok_or(CgroupError::NoDevice)?;
                root.release_agent_path() + "\n"
            }
        };
        Ok(out)
    }

    fn write_core_file(
        &self,
        cgrp: &Arc<Cgroup>,
        file: CoreFile,
        buf: &str,
        caller: Option<Pid>,
    ) -> Result<(), CgroupError> {
        match file {
            CoreFile::Procs | CoreFile::Tasks => {
                let pid = match parse_id(buf)? {
                    0 => caller.ok_or_else(|| CgroupError::invalid("no writing task for id 0"))?,
                    id => Pid::from_raw(id as i32),
                };
                self.attach(cgrp, pid, file == CoreFile::Procs)
            }
            CoreFile::SubtreeControl => self.subtree_control_write(cgrp, buf),
            CoreFile::CloneChildren => {
                cgrp.set_flag(CgroupFlags::CLONE_CHILDREN, parse_bool_flag(buf)?);
                Ok(())
            }
            CoreFile::NotifyOnRelease => {
                cgrp.set_flag(CgroupFlags::NOTIFY_ON_RELEASE, parse_bool_flag(buf)?);
                Ok(())
            }
            CoreFile::ReleaseAgent => {
                let path = buf.trim();
                if path.contains('\n') {
                    return Err(CgroupError::invalid("release agent path spans lines"));
                }
                let _state = self.state.lock();
                let root = cgrp.root().ok_or(CgroupError::NoDevice)?;
                root.set_release_agent_path(path);
                tracing::debug!(hierarchy = root.id(), path, "release agent set");
                Ok(())
            }
            CoreFile::Controllers | CoreFile::Events | CoreFile::SaneBehavior => {
                Err(CgroupError::invalid("file is read-only"))
            }
        }
    }
}

impl CgroupCore {
    pub fn resolve_file(&self, cgrp: &Arc<Cgroup>, name: &str) -> Option<Arc<CgroupFile>> {
        cgrp.file(name)
    }

    /// Reads a file of `cgrp`. `ns` selects the pid namespace of
    /// `cgroup.procs` and `tasks` listings, the initial one by default.
    pub fn read_file(
        &self,
        cgrp: &Arc<Cgroup>,
        name: &str,
        ns: Option<u64>,
    ) -> Result<String, CgroupError> {
        let file = cgrp
            .file(name)
            .ok_or_else(|| CgroupError::NoEntry(name.to_owned()))?;
        match &file.kind {
            FileKind::Core(core_file) => {
                self.shared()
                    .read_core_file(cgrp, *core_file, ns.unwrap_or_default())
            }
            FileKind::Subsys { css, cft } => {
                let css = css.upgrade().ok_or(CgroupError::NoDevice)?;
                let read = cft
                    .read
                    .as_ref()
                    .ok_or_else(|| CgroupError::invalid(format!("{name} is not readable")))?;
                read(&css).map_err(|source| CgroupError::Controller {
                    controller: self.shared().subsys[css.ssid()].name.to_owned(),
                    source,
                })
            }
        }
    }

    /// Writes `buf` to a file of `cgrp`. `caller` is the writing task, which
    /// an id of `0` in `cgroup.procs` and `tasks` refers to.
    pub fn write_file(
        &self,
        cgrp: &Arc<Cgroup>,
        name: &str,
        buf: &str,
        caller: Option<Pid>,
    ) -> Result<(), CgroupError> {
        let file = cgrp
            .file(name)
            .ok_or_else(|| CgroupError::NoEntry(name.to_owned()))?;
        match &file.kind {
            FileKind::Core(core_file) => {
                self.shared()
                    .write_core_file(cgrp, *core_file, buf, caller)
            }
            FileKind::Subsys { css, cft } => {
                let css = css.upgrade().ok_or(CgroupError::NoDevice)?;
                let write = cft
                    .write
                    .as_ref()
                    .ok_or_else(|| CgroupError::invalid(format!("{name} is not writable")))?;
                write(&css, buf).map_err(|source| CgroupError::Controller {
                    controller: self.shared().subsys[css.ssid()].name.to_owned(),
                    source,
                })
            }
        }
    }

    /// Waits for a notification on a file, see [`CgroupFile::poll`].
    pub fn poll_file(
        &self,
        cgrp: &Arc<Cgroup>,
        name: &str,
        seen: u64,
        timeout: Duration,
    ) -> Result<u64, CgroupError> {
        let file = cgrp
            .file(name)
            .ok_or_else(|| CgroupError::NoEntry(name.to_owned()))?;
        Ok(file.poll(seen, timeout))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;

    use crate::cftype::{CfType, CfTypeFlags};
    use crate::common::{CgroupError, ControllerError};
    use crate::test::{new_core, new_core_with, pid, ControllerSpec};
    use crate::MountOptions;

    fn counter_file() -> CfType {
        CfType::new("max")
            .read(|css| Ok(format!("{}\n", css.id())))
            .write(|_, buf| match buf.trim() {
                "max" => Ok(()),
                other => Err(ControllerError::Invalid(other.to_owned())),
            })
    }

    #[test]
    fn test_default_hierarchy_core_files() {
        let (core, _log) = new_core(&[]);
        let root = core.default_root();
        let c = core.mkdir(&root, "c").expect("mkdir");
        assert_eq!(
            root.file_names(),
            vec!["cgroup.controllers", "cgroup.procs", "cgroup.subtree_control"]
        );
        assert_eq!(
            c.file_names(),
            vec![
                "cgroup.controllers",
                "cgroup.events",
                "cgroup.procs",
                "cgroup.subtree_control"
            ]
        );
        let events = core.resolve_file(&c, "cgroup.events").expect("events");
        assert_eq!(events.mode(), 0o444);
        assert!(events.css().is_none());
        assert_eq!(core.resolve_file(&c, "cgroup.procs").expect("procs").mode(), 0o644);
    }

    #[test]
    fn test_legacy_core_files() {
        let (core, _log) = new_core(&[]);
        let h = core
            .mount(&MountOptions::new().none().name("named"))
            .expect("mount");
        let root = h.root_cgroup().clone();
        let g = core.mkdir(&root, "g").expect("mkdir");
        for name in ["tasks", "release_agent", "cgroup.sane_behavior", "notify_on_release"] {
            assert!(root.file(name).is_some(), "{name}");
        }
        assert!(g.file("release_agent").is_none());
        assert!(g.file("cgroup.sane_behavior").is_none());
        assert!(g.file("cgroup.subtree_control").is_none());
        assert_eq!(core.read_file(&root, "cgroup.sane_behavior", None).expect("read"), "0\n");
    }

    #[test]
    fn test_controller_files_follow_visibility() {
        let (core, _log) = new_core_with(vec![ControllerSpec::new("a")
            .dfl_file(counter_file())
            .dfl_file(CfType::new("stat").flags(CfTypeFlags::NO_PREFIX | CfTypeFlags::NOT_ON_ROOT))]);
        let root = core.default_root();
        assert!(root.file("a.max").is_some());
        assert!(root.file("stat").is_none());
        let c = core.mkdir(&root, "c").expect("mkdir");
        assert!(c.file("a.max").is_none());

        core.write_file(&root, "cgroup.subtree_control", "+a", None)
            .expect("enable");
        let file = c.file("a.max").expect("file shown");
        let css = file.css().expect("owned by a state");
        assert!(Arc::ptr_eq(&css, &c.css(0).expect("css")));
        assert!(c.file("stat").is_some());
        assert_eq!(
            core.read_file(&c, "a.max", None).expect("read"),
            format!("{}\n", css.id())
        );
        core.write_file(&c, "a.max", "max\n", None).expect("write");
        let err = core.write_file(&c, "a.max", "7", None).expect_err("bad value");
        assert!(matches!(err, CgroupError::Controller { ref controller, .. } if controller == "a"));
        assert!(matches!(
            core.write_file(&c, "stat", "1", None),
            Err(CgroupError::InvalidArgument(_))
        ));

        core.write_file(&root, "cgroup.subtree_control", "-a", None)
            .expect("disable");
        assert!(c.file("a.max").is_none());
        assert!(c.file("stat").is_none());
    }

    #[test]
    fn test_noprefix_mount() {
        let (core, _log) = new_core_with(vec![ControllerSpec::new("a").legacy_file(counter_file())]);
        let h = core
            .mount(&MountOptions::new().subsys(&["a"]).noprefix())
            .expect("mount");
        let g = core.mkdir(h.root_cgroup(), "g").expect("mkdir");
        assert!(g.file("max").is_some());
        assert!(g.file("a.max").is_none());
    }

    #[test]
    fn test_procs_write_resolves_caller() -> Result<()> {
        let (core, _log) = new_core(&[]);
        let root = core.default_root();
        let c = core.mkdir(&root, "c")?;
        core.fork(None, pid(10))?;
        core.fork_thread(pid(10), pid(11))?;

        let err = core
            .write_file(&c, "cgroup.procs", "0", None)
            .expect_err("no caller");
        assert!(matches!(err, CgroupError::InvalidArgument(_)));
        core.write_file(&c, "cgroup.procs", "0", Some(pid(11)))?;
        assert_eq!(core.cgroup_tasks(&c).count(), 2);
        assert_eq!(core.read_file(&c, "cgroup.procs", None)?, "10\n");

        core.write_file(&root, "cgroup.procs", "0xa\n", None)?;
        assert!(!c.is_populated());
        assert!(matches!(
            core.write_file(&root, "cgroup.procs", "-1", None),
            Err(CgroupError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_legacy_tasks_write_moves_one_thread() -> Result<()> {
        let (core, _log) = new_core(&["a"]);
        let h = core.mount(&MountOptions::new().subsys(&["a"]))?;
        let g = core.mkdir(h.root_cgroup(), "g")?;
        core.fork(None, pid(10))?;
        core.fork_thread(pid(10), pid(11))?;
        core.write_file(&g, "tasks", "11", None)?;
        assert_eq!(core.read_file(&g, "tasks", None)?, "11\n");
        assert_eq!(core.read_file(&g, "cgroup.procs", None)?, "10\n");
        Ok(())
    }

    #[test]
    fn test_events_notify_on_population_change() {
        let (core, _log) = new_core(&[]);
        let root = core.default_root();
        let p = core.mkdir(&root, "p").expect("mkdir p");
        let c = core.mkdir(&p, "c").expect("mkdir c");
        let seen = core
            .resolve_file(&p, "cgroup.events")
            .expect("events")
            .generation();
        assert_eq!(core.read_file(&p, "cgroup.events", None).expect("read"), "populated 0\n");

        core.fork(None, pid(10)).expect("fork");
        let poller = {
            let core = core.clone();
            let p = p.clone();
            std::thread::spawn(move || core.poll_file(&p, "cgroup.events", seen, Duration::from_secs(5)))
        };
        core.attach(&c, pid(10), false).expect("attach");
        let after = poller.join().expect("join").expect("poll");
        assert!(after > seen);
        assert_eq!(core.read_file(&p, "cgroup.events", None).expect("read"), "populated 1\n");
        assert_eq!(core.read_file(&c, "cgroup.events", None).expect("read"), "populated 1\n");
    }

    #[test]
    fn test_flag_files() -> Result<()> {
        let (core, _log) = new_core(&[]);
        let h = core.mount(&MountOptions::new().none().name("n"))?;
        let root = h.root_cgroup().clone();
        core.write_file(&root, "notify_on_release", "1", None)?;
        core.write_file(&root, "cgroup.clone_children", "1", None)?;
        let g = core.mkdir(&root, "g")?;
        assert_eq!(core.read_file(&g, "notify_on_release", None)?, "1\n");
        assert_eq!(core.read_file(&g, "cgroup.clone_children", None)?, "1\n");

        core.write_file(&root, "release_agent", "/sbin/agent\n", None)?;
        assert_eq!(core.read_file(&root, "release_agent", None)?, "/sbin/agent\n");
        assert!(matches!(
            core.write_file(&g, "nonexistent", "1", None),
            Err(CgroupError::NoEntry(_))
        ));
        Ok(())
    }

    #[test]
    fn test_read_only_files_reject_writes() {
        let (core, _log) = new_core(&["a"]);
        let root = core.default_root();
        assert!(matches!(
            core.write_file(&root, "cgroup.controllers", "+a", None),
            Err(CgroupError::InvalidArgument(_))
        ));
        assert_eq!(
            core.read_file(&root, "cgroup.subtree_control", None).expect("read"),
            "\n"
        );
        core.write_file(&root, "cgroup.subtree_control", "+a", None)
            .expect("enable");
        assert_eq!(
            core.read_file(&root, "cgroup.subtree_control", None).expect("read"),
            "a\n"
        );
    }
}
