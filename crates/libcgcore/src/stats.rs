use std::fmt::{self, Display, Write as _};
use std::sync::Arc;

use nix::unistd::Pid;
use serde::Serialize;

use crate::cgroup::Cgroup;
use crate::common::CgroupError;
use crate::core::CgroupCore;

/// Per-controller summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CgroupStat {
    /// Legacy name of the controller
    pub name: String,
    /// Id of the hierarchy the controller is bound to
    pub hierarchy: u32,
    /// Number of groups in that hierarchy
    pub num_cgroups: usize,
    pub enabled: bool,
}

/// Membership of a task on one hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCgroup {
    pub hierarchy: u32,
    /// Legacy names of the bound controllers, empty on the default hierarchy
    pub controllers: Vec<String>,
    /// Name of a named hierarchy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
}

impl Display for TaskCgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hierarchy, self.controllers.join(","))?;
        if let Some(name) = &self.name {
            if !self.controllers.is_empty() {
                f.write_char(',')?;
            }
            write!(f, "name={name}")?;
        }
        write!(f, ":{}", self.path)
    }
}

const CGROUPSTATS_HEADER: &str = "#subsys_name\thierarchy\tnum_cgroups\tenabled";

impl CgroupCore {
    /// One row per registered controller, in slot order.
    pub fn cgroupstats(&self) -> Vec<CgroupStat> {
        let shared = self.shared();
        let _state = shared.state.lock();
        shared
            .subsys
            .iter()
            .map(|ss| {
                let root = ss.root();
                CgroupStat {
                    name: ss.legacy_name.to_owned(),
                    hierarchy: root.id(),
                    num_cgroups: root.nr_cgrps(),
                    enabled: ss.enabled,
                }
            })
            .collect()
    }

    /// [`cgroupstats`](Self::cgroupstats) as a tab separated table.
    pub fn cgroupstats_text(&self) -> String {
        let mut out = String::from(CGROUPSTATS_HEADER);
        out.push('\n');
        for stat in self.cgroupstats() {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}",
                stat.name,
                stat.hierarchy,
                stat.num_cgroups,
                u8::from(stat.enabled)
            );
        }
        out
    }

    /// Groups of `pid` on every hierarchy, most recently mounted first and
    /// the default hierarchy last.
    pub fn task_cgroups(&self, pid: Pid) -> Result<Vec<TaskCgroup>, CgroupError> {
        let shared = self.shared();
        let state = shared.state.lock();
        let mb = shared.css_set.lock();
        let cset = mb.task(pid).ok_or(CgroupError::NoSuchTask(pid))?.cset.clone();

        let mut out = Vec::with_capacity(state.roots.len());
        for root in state.roots.iter().rev() {
            let cgrp = mb
                .cset_cgroup(&cset, root.id())
                .unwrap_or_else(|| root.root_cgroup().clone());
            let controllers = if root.is_dfl() {
                Vec::new()
            } else {
                shared
                    .mask_names(root.subsys_mask(), false)
                    .into_iter()
                    .map(str::to_owned)
                    .collect()
            };
            out.push(TaskCgroup {
                hierarchy: root.id(),
                controllers,
                name: (!root.name().is_empty()).then(|| root.name().to_owned()),
                path: cgrp.path(),
            });
        }
        Ok(out)
    }

    pub fn task_cgroups_text(&self, pid: Pid) -> Result<String, CgroupError> {
        let mut out = String::new();
        for line in self.task_cgroups(pid)? {
            let _ = writeln!(out, "{line}");
        }
        Ok(out)
    }

    pub fn cgroup_path(&self, cgrp: &Arc<Cgroup>) -> String {
        cgrp.path()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::test::{new_core, new_core_with_config, pid};
    use crate::{CoreConfig, MountOptions};

    #[test]
    fn test_cgroupstats_text() -> Result<()> {
        let (core, _log) = new_core_with_config(
            &["cpu", "memory"],
            CoreConfig {
                grace_period_ms: 0,
                disabled: vec!["memory".into()],
                ..Default::default()
            },
        );
        let root = core.default_root();
        core.mkdir(&root, "a")?;
        let h = core.mount(&MountOptions::new().subsys(&["cpu"]))?;
        assert_eq!(h.nr_cgrps(), 1);

        assert_eq!(
            core.cgroupstats_text(),
            "#subsys_name\thierarchy\tnum_cgroups\tenabled\n\
             cpu\t1\t1\t1\n\
             memory\t0\t2\t0\n"
        );
        Ok(())
    }

    #[test]
    fn test_cgroupstats_serialize() -> Result<()> {
        let (core, _log) = new_core(&["cpu"]);
        let json = serde_json::to_value(core.cgroupstats())?;
        assert_eq!(
            json,
            serde_json::json!([
                {"name": "cpu", "hierarchy": 0, "num_cgroups": 1, "enabled": true}
            ])
        );
        Ok(())
    }

    #[test]
    fn test_task_cgroups() -> Result<()> {
        let (core, _log) = new_core(&["cpu", "memory", "pids"]);
        let cpu_mem = core.mount(&MountOptions::new().subsys(&["cpu", "memory"]))?;
        let named = core.mount(&MountOptions::new().none().name("systemd"))?;
        let dfl = core.default_root();
        let a = core.mkdir(&dfl, "a")?;
        let b = core.mkdir(cpu_mem.root_cgroup(), "b")?;
        let s = core.mkdir(named.root_cgroup(), "s")?;
        core.fork(None, pid(10))?;
        core.attach(&a, pid(10), false)?;
        core.attach(&b, pid(10), false)?;
        core.attach(&s, pid(10), false)?;

        assert_eq!(
            core.task_cgroups_text(pid(10))?,
            "2:name=systemd:/s\n1:cpu,memory:/b\n0::/a\n"
        );
        let rows = core.task_cgroups(pid(10))?;
        assert_eq!(rows[1].controllers, vec!["cpu".to_owned(), "memory".to_owned()]);
        assert_eq!(core.cgroup_path(&b), "/b");
        assert!(matches!(
            core.task_cgroups(pid(99)),
            Err(CgroupError::NoSuchTask(_))
        ));
        Ok(())
    }

    #[test]
    fn test_named_hierarchy_with_controllers() {
        let line = TaskCgroup {
            hierarchy: 3,
            controllers: vec!["cpu".into()],
            name: Some("x".into()),
            path: "/".into(),
        };
        assert_eq!(line.to_string(), "3:cpu,name=x:/");
    }
}
