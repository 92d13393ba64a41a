//! Fork, exit and free of tasks.

use nix::unistd::Pid;

use crate::common::CgroupError;
use crate::core::{CgroupCore, Shared};
use crate::css_set::TaskEntry;

impl Shared {
    /// Links a new task. `parent` is any task of the thread group it is
    /// forked from; `thread` joins that thread group instead of starting a
    /// new one.
    pub(crate) fn fork(&self, parent: Option<Pid>, child: Pid, thread: bool) -> Result<(), CgroupError> {
        let _barrier = self.threadgroup.read();
        {
            let mb = self.css_set.lock();
            if mb.task(child).is_some() {
                return Err(CgroupError::Exists(format!("task {child}")));
            }
            if let Some(parent) = parent {
                mb.task(parent).ok_or(CgroupError::NoSuchTask(parent))?;
            }
        }

        let can_fork: Vec<_> = self.hooks.can_fork.iter().collect();
        for (idx, &ssid) in can_fork.iter().enumerate() {
            if let Err(source) = self.subsys[ssid].ctrl.can_fork(child) {
                for &prev in &can_fork[..idx] {
                    if self.hooks.cancel_fork.contains(prev) {
                        self.subsys[prev].ctrl.cancel_fork(child);
                    }
                }
                tracing::debug!(ss = self.subsys[ssid].name, %child, "fork refused");
                return Err(CgroupError::Controller {
                    controller: self.subsys[ssid].name.to_owned(),
                    source,
                });
            }
        }

        {
            let mut mb = self.css_set.lock();
            let (cset, tgid) = match parent.and_then(|p| mb.task(p)) {
                Some(p) => (p.cset.clone(), if thread { p.tgid } else { child }),
                None => (self.init_cset.clone(), child),
            };
            cset.get();
            mb.tasks.insert(child, TaskEntry::new(child, tgid, cset.clone()));
            mb.threads.entry(tgid).or_default().push(child);
            self.css_set_move_task(&mut mb, child, None, Some(&cset));
        }

        for ssid in self.hooks.fork.iter() {
            self.subsys[ssid].ctrl.fork(child);
        }
        Ok(())
    }

    pub(crate) fn exit_begin(&self, pid: Pid) -> Result<(), CgroupError> {
        let mut mb = self.css_set.lock();
        let task = mb.task_entry_mut(pid).ok_or(CgroupError::NoSuchTask(pid))?;
        task.exiting = true;
        Ok(())
    }

    /// Unlinks `pid` and parks it on the initial set until it is freed.
    pub(crate) fn exit(&self, pid: Pid) -> Result<(), CgroupError> {
        {
            let _barrier = self.threadgroup.read();
            let mut mb = self.css_set.lock();
            let task = mb.task_entry_mut(pid).ok_or(CgroupError::NoSuchTask(pid))?;
            task.exiting = true;
            if task.linked {
                let cset = task.cset.clone();
                self.css_set_move_task(&mut mb, pid, Some(&cset), None);
                self.init_cset.get();
                if let Some(task) = mb.task_entry_mut(pid) {
                    task.cset = self.init_cset.clone();
                }
                self.put_css_set_locked(&mut mb, &cset);
            }
        }
        for ssid in self.hooks.exit.iter() {
            self.subsys[ssid].ctrl.exit(pid);
        }
        Ok(())
    }

    /// Forgets `pid` entirely.
    pub(crate) fn free(&self, pid: Pid) -> Result<(), CgroupError> {
        if self.css_set.lock().task(pid).is_none() {
            return Err(CgroupError::NoSuchTask(pid));
        }
        for ssid in self.hooks.free.iter() {
            self.subsys[ssid].ctrl.free(pid);
        }

        let _barrier = self.threadgroup.read();
        let mut mb = self.css_set.lock();
        let Some((cset, linked, tgid)) = mb
            .task(pid)
            .map(|task| (task.cset.clone(), task.linked, task.tgid))
        else {
            return Ok(());
        };
        if linked {
            self.css_set_move_task(&mut mb, pid, Some(&cset), None);
        }
        mb.tasks.remove(&pid);
        if let Some(threads) = mb.threads.get_mut(&tgid) {
            threads.retain(|&tid| tid != pid);
            if threads.is_empty() {
                mb.threads.remove(&tgid);
            }
        }
        self.put_css_set_locked(&mut mb, &cset);
        Ok(())
    }

    pub(crate) fn set_no_migrate(&self, pid: Pid, no_migrate: bool) -> Result<(), CgroupError> {
        let mut mb = self.css_set.lock();
        let task = mb.task_entry_mut(pid).ok_or(CgroupError::NoSuchTask(pid))?;
        task.no_migrate = no_migrate;
        Ok(())
    }
}

impl CgroupCore {
    /// Registers a new process. Without a parent it starts in the initial
    /// set, i.e. the root group of every hierarchy.
    pub fn fork(&self, parent: Option<Pid>, child: Pid) -> Result<(), CgroupError> {
        self.shared().fork(parent, child, false)
    }

    /// Registers a new thread in the thread group of `parent`.
    pub fn fork_thread(&self, parent: Pid, child: Pid) -> Result<(), CgroupError> {
        self.shared().fork(Some(parent), child, true)
    }

    /// Marks a task exiting; migrations leave it alone from now on.
    pub fn exit_begin(&self, pid: Pid) -> Result<(), CgroupError> {
        self.shared().exit_begin(pid)
    }

    pub fn exit(&self, pid: Pid) -> Result<(), CgroupError> {
        self.shared().exit(pid)
    }

    pub fn free(&self, pid: Pid) -> Result<(), CgroupError> {
        self.shared().free(pid)
    }

    /// Kernel threads refuse migration through `cgroup.procs` and `tasks`.
    pub fn set_no_migrate(&self, pid: Pid, no_migrate: bool) -> Result<(), CgroupError> {
        self.shared().set_no_migrate(pid, no_migrate)
    }

    /// Thread group id of a registered task.
    pub fn task_tgid(&self, pid: Pid) -> Option<Pid> {
        self.shared().css_set.lock().task(pid).map(|task| task.tgid)
    }
}
