//! Sorted pid snapshots behind `cgroup.procs` and `tasks`.
//!
//! One list per (kind, namespace) is cached on the group and reused while
//! the group's membership is unchanged. An unused list expires after the
//! linger delay.

use std::sync::Arc;
use std::time::Instant;

use nix::unistd::Pid;

use crate::cgroup::Cgroup;
use crate::core::{CgroupCore, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PidlistKind {
    /// Thread group ids, deduplicated.
    Procs,
    /// Every task id.
    Tasks,
}

pub(crate) struct Pidlist {
    kind: PidlistKind,
    ns: u64,
    pids: Arc<Vec<Pid>>,
    generation: u64,
    expires: Instant,
}

/// Swaps every two adjacent bits, so the order of a sorted list says
/// nothing about the pids themselves.
pub(crate) fn pid_fry(pid: Pid) -> i32 {
    let raw = pid.as_raw() as u32;
    (((raw & 0x5555_5555) << 1) | ((raw & 0xAAAA_AAAA) >> 1)) as i32
}

impl Shared {
    /// Returns the pids of `cgrp` as seen from namespace `ns`, building the
    /// list only when the group's membership changed since the last build.
    pub(crate) fn pidlist_load(&self, cgrp: &Arc<Cgroup>, kind: PidlistKind, ns: u64) -> Arc<Vec<Pid>> {
        let linger = self.config.pidlist_linger();
        let mut lists = cgrp.pidlists.lock();
        let idx = lists.iter().position(|l| l.kind == kind && l.ns == ns);

        let pids = match idx {
            Some(idx) if lists[idx].generation == cgrp.membership_gen() => {
                lists[idx].expires = Instant::now() + linger;
                lists[idx].pids.clone()
            }
            _ => {
                let (pids, generation) = self.pidlist_build(cgrp, kind);
                let pids = Arc::new(pids);
                let list = Pidlist {
                    kind,
                    ns,
                    pids: pids.clone(),
                    generation,
                    expires: Instant::now() + linger,
                };
                match idx {
                    Some(idx) => lists[idx] = list,
                    None => lists.push(list),
                }
                tracing::trace!(cgroup = %cgrp.path(), ?kind, len = pids.len(), "pidlist built");
                pids
            }
        };
        drop(lists);

        let owner = Arc::downgrade(cgrp);
        self.pidlist_wq.queue_delayed(linger, move || {
            if let Some(cgrp) = owner.upgrade() {
                let now = Instant::now();
                cgrp.pidlists
                    .lock()
                    .retain(|l| !(l.kind == kind && l.ns == ns && l.expires <= now));
            }
        });
        pids
    }

    fn pidlist_build(&self, cgrp: &Cgroup, kind: PidlistKind) -> (Vec<Pid>, u64) {
        let mb = self.css_set.lock();
        // Moves bump the generation under this lock.
        let generation = cgrp.membership_gen();
        let mut pids: Vec<Pid> = mb
            .cgroup_csets(cgrp)
            .iter()
            .flat_map(|cset| mb.cset_tasks(cset))
            .filter_map(|pid| mb.task(pid))
            .map(|task| match kind {
                PidlistKind::Procs => task.tgid,
                PidlistKind::Tasks => task.pid,
            })
            .filter(|pid| pid.as_raw() > 0)
            .collect();
        drop(mb);

        if cgrp.is_on_dfl() {
            pids.sort_unstable_by_key(|pid| pid_fry(*pid));
        } else {
            pids.sort_unstable();
        }
        if kind == PidlistKind::Procs {
            pids.dedup();
        }
        (pids, generation)
    }

    pub(crate) fn pidlist_destroy_all(&self, cgrp: &Cgroup) {
        cgrp.pidlists.lock().clear();
    }
}

impl CgroupCore {
    /// Sorted snapshot of the pids in `cgrp`. The snapshot may be stale
    /// relative to migrations running concurrently.
    pub fn pidlist(&self, cgrp: &Arc<Cgroup>, kind: PidlistKind, ns: u64) -> Arc<Vec<Pid>> {
        self.shared().pidlist_load(cgrp, kind, ns)
    }
}
