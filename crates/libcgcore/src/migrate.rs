//! Task migration: preload source and destination sets, ask every bound
//! controller for admission, commit under the membership lock, then notify.

use std::sync::Arc;

use nix::unistd::Pid;

use crate::cgroup::Cgroup;
use crate::common::CgroupError;
use crate::core::Shared;
use crate::css_set::{CssSet, Membership};
use crate::iter::live_descendants_pre;
use crate::mask::SubsysMask;
use crate::subsys::{SubsysId, TaskSet, TaskSetEntry};

struct MigrationSrc {
    cset: Arc<CssSet>,
    dst_cgrp: Arc<Cgroup>,
    dst_cset: Option<Arc<CssSet>>,
}

/// Pinned sets of one migration. Must be finished with
/// [`Shared::migrate_finish`].
pub(crate) struct MigrationContext {
    srcs: Vec<MigrationSrc>,
    dsts: Vec<Arc<CssSet>>,
    /// Controllers asked for admission and notified on attach.
    ss_mask: SubsysMask,
}

impl MigrationContext {
    pub fn new(ss_mask: SubsysMask) -> Self {
        Self {
            srcs: Vec::new(),
            dsts: Vec::new(),
            ss_mask,
        }
    }

    fn src_of(&self, cset: &Arc<CssSet>) -> Option<&MigrationSrc> {
        self.srcs.iter().find(|src| Arc::ptr_eq(&src.cset, cset))
    }
}

struct TaskMove {
    pid: Pid,
    tgid: Pid,
    from: Arc<CssSet>,
    to: Arc<CssSet>,
}

fn taskset_for(ssid: SubsysId, moves: &[TaskMove]) -> TaskSet {
    TaskSet {
        ssid,
        entries: moves
            .iter()
            .map(|m| TaskSetEntry {
                pid: m.pid,
                tgid: m.tgid,
                src: m.from.subsys[ssid].clone(),
                dst: m.to.subsys[ssid].clone(),
            })
            .collect(),
    }
}

impl Shared {
    /// Pins `cset` as a source whose tasks go to `dst_cgrp`. Dead and
    /// already added sets are ignored.
    pub(crate) fn migrate_add_src(
        &self,
        mb: &Membership,
        ctx: &mut MigrationContext,
        cset: &Arc<CssSet>,
        dst_cgrp: &Arc<Cgroup>,
    ) {
        if mb.node(cset).dead || ctx.src_of(cset).is_some() {
            return;
        }
        cset.get();
        ctx.srcs.push(MigrationSrc {
            cset: cset.clone(),
            dst_cgrp: dst_cgrp.clone(),
            dst_cset: None,
        });
    }

    /// Resolves one destination per distinct source. Sources that already
    /// are their own destination are dropped.
    ///
    /// Caller holds the structural lock.
    pub(crate) fn migrate_prepare_dst(&self, ctx: &mut MigrationContext) -> Result<(), CgroupError> {
        let mut idx = 0;
        while idx < ctx.srcs.len() {
            let (cset, dst_cgrp) = (ctx.srcs[idx].cset.clone(), ctx.srcs[idx].dst_cgrp.clone());
            let dst = self.find_css_set(&cset, &dst_cgrp)?;
            if Arc::ptr_eq(&dst, &ctx.srcs[idx].cset) {
                let src = ctx.srcs.remove(idx);
                self.put_css_set(&src.cset);
                self.put_css_set(&dst);
                continue;
            }
            if ctx.dsts.iter().any(|d| Arc::ptr_eq(d, &dst)) {
                self.put_css_set(&dst);
            } else {
                ctx.dsts.push(dst.clone());
            }
            ctx.srcs[idx].dst_cset = Some(dst);
            idx += 1;
        }
        Ok(())
    }

    /// Drops every reference the context holds.
    pub(crate) fn migrate_finish(&self, ctx: &mut MigrationContext) {
        let mut mb = self.css_set.lock();
        for src in ctx.srcs.drain(..) {
            self.put_css_set_locked(&mut mb, &src.cset);
        }
        for dst in ctx.dsts.drain(..) {
            self.put_css_set_locked(&mut mb, &dst);
        }
    }

    /// Migrates the preloaded tasks among `pids` atomically. Returns how
    /// many tasks moved.
    ///
    /// Caller holds the structural lock and the thread-group barrier
    /// exclusively.
    pub(crate) fn migrate_execute(
        &self,
        ctx: &MigrationContext,
        pids: &[Pid],
    ) -> Result<usize, CgroupError> {
        let moves: Vec<TaskMove> = {
            let mb = self.css_set.lock();
            pids.iter()
                .filter_map(|pid| {
                    let task = mb.task(*pid)?;
                    if task.exiting || !task.linked {
                        return None;
                    }
                    let to = ctx.src_of(&task.cset)?.dst_cset.clone()?;
                    Some(TaskMove {
                        pid: task.pid,
                        tgid: task.tgid,
                        from: task.cset.clone(),
                        to,
                    })
                })
                .collect()
        };
        if moves.is_empty() {
            return Ok(0);
        }

        let mut admitted: Vec<(SubsysId, TaskSet)> = Vec::new();
        for ssid in ctx.ss_mask.iter() {
            let tset = taskset_for(ssid, &moves);
            if let Err(source) = self.subsys[ssid].ctrl.can_attach(&tset) {
                for (prev, tset) in admitted.iter().rev() {
                    self.subsys[*prev].ctrl.cancel_attach(tset);
                }
                tracing::debug!(
                    ss = self.subsys[ssid].name,
                    tasks = moves.len(),
                    "migration refused"
                );
                return Err(CgroupError::Denied {
                    controller: self.subsys[ssid].name.to_owned(),
                    source,
                });
            }
            admitted.push((ssid, tset));
        }

        {
            let mut mb = self.css_set.lock();
            for m in &moves {
                m.to.get();
                self.css_set_move_task(&mut mb, m.pid, Some(&m.from), Some(&m.to));
                self.put_css_set_locked(&mut mb, &m.from);
            }
        }

        for (ssid, tset) in &admitted {
            self.subsys[*ssid].ctrl.attach(tset);
        }
        tracing::debug!(tasks = moves.len(), "migrated");
        Ok(moves.len())
    }

    /// On the default hierarchy only the root and leaves without enabled
    /// controllers may hold tasks.
    pub(crate) fn may_migrate_to(&self, dst: &Cgroup) -> Result<(), CgroupError> {
        if dst.is_on_dfl() && dst.parent().is_some() && !dst.subtree_control().is_empty() {
            return Err(CgroupError::busy(format!(
                "{} has controllers enabled for its children",
                dst.path()
            )));
        }
        Ok(())
    }

    /// Moves `pids` to `dst` in one batch.
    ///
    /// Caller holds the structural lock and the thread-group barrier
    /// exclusively.
    fn attach_tasks(&self, dst: &Arc<Cgroup>, pids: &[Pid]) -> Result<usize, CgroupError> {
        self.may_migrate_to(dst)?;
        let mut ctx = MigrationContext::new(dst.root_mask());
        {
            let mb = self.css_set.lock();
            for pid in pids {
                if let Some(task) = mb.task(*pid) {
                    let cset = task.cset.clone();
                    self.migrate_add_src(&mb, &mut ctx, &cset, dst);
                }
            }
        }
        let result = self
            .migrate_prepare_dst(&mut ctx)
            .and_then(|()| self.migrate_execute(&ctx, pids));
        self.migrate_finish(&mut ctx);
        result
    }

    /// Moves a task, or its whole thread group, to `dst`.
    pub(crate) fn attach(
        &self,
        dst: &Arc<Cgroup>,
        pid: Pid,
        threadgroup: bool,
    ) -> Result<(), CgroupError> {
        let state = self.state.lock();
        if dst.is_dead() {
            return Err(CgroupError::NoDevice);
        }
        let result = {
            let _barrier = self.threadgroup.write();
            self.attach_locked(dst, pid, threadgroup)
        };
        drop(state);
        let moved = result?;
        if moved > 0 {
            for ss in &self.subsys {
                ss.ctrl.post_attach();
            }
        }
        Ok(())
    }

    /// Returns how many tasks changed sets.
    fn attach_locked(&self, dst: &Arc<Cgroup>, pid: Pid, threadgroup: bool) -> Result<usize, CgroupError> {
        let pids = {
            let mb = self.css_set.lock();
            let task = mb.task(pid).ok_or(CgroupError::NoSuchTask(pid))?;
            let leader = if threadgroup { task.tgid } else { pid };
            let leader_task = mb.task(leader).ok_or(CgroupError::NoSuchTask(leader))?;
            if leader_task.no_migrate {
                return Err(CgroupError::invalid(format!("task {leader} cannot be migrated")));
            }
            if threadgroup {
                mb.threads.get(&leader).cloned().unwrap_or_else(|| vec![leader])
            } else {
                vec![pid]
            }
        };
        let moved = self.attach_tasks(dst, &pids)?;
        tracing::debug!(cgroup = %dst.path(), %pid, threadgroup, moved, "attach");
        Ok(moved)
    }

    /// Moves every task out of `from` into `to`, one task at a time.
    pub(crate) fn transfer_tasks(&self, to: &Arc<Cgroup>, from: &Arc<Cgroup>) -> Result<(), CgroupError> {
        self.may_migrate_to(to)?;
        if Arc::ptr_eq(to, from) {
            return Ok(());
        }
        let _state = self.state.lock();
        let _barrier = self.threadgroup.write();

        let mut ctx = MigrationContext::new(to.root_mask());
        {
            let mb = self.css_set.lock();
            for cset in mb.cgroup_csets(from) {
                self.migrate_add_src(&mb, &mut ctx, &cset, to);
            }
        }
        let mut result = self.migrate_prepare_dst(&mut ctx).map(|()| 0);
        while result.is_ok() {
            let next = {
                let mb = self.css_set.lock();
                mb.cgroup_csets(from).iter().find_map(|cset| {
                    mb.cset_tasks(cset)
                        .into_iter()
                        .find(|pid| mb.task(*pid).map_or(false, |t| !t.exiting))
                })
            };
            let Some(pid) = next else { break };
            match self.migrate_execute(&ctx, &[pid]) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => result = Err(err),
            }
        }
        self.migrate_finish(&mut ctx);
        result.map(|_| ())
    }

    /// Puts `task` into the groups of `from` on every legacy hierarchy.
    pub(crate) fn attach_task_all(&self, from: Pid, task: Pid) -> Result<(), CgroupError> {
        let state = self.state.lock();
        let _barrier = self.threadgroup.write();
        for root in state.roots.iter().filter(|root| !root.is_dfl()) {
            let from_cgrp = {
                let mb = self.css_set.lock();
                let cset = mb.task(from).ok_or(CgroupError::NoSuchTask(from))?.cset.clone();
                mb.cset_cgroup(&cset, root.id())
                    .unwrap_or_else(|| root.root_cgroup().clone())
            };
            self.attach_tasks(&from_cgrp, &[task])?;
        }
        Ok(())
    }

    /// Re-resolves the sets of every task in the subtree after a control
    /// change.
    ///
    /// Caller holds the structural lock.
    pub(crate) fn update_dfl_csses(&self, cgrp: &Arc<Cgroup>) -> Result<(), CgroupError> {
        let _barrier = self.threadgroup.write();
        let mut ctx = MigrationContext::new(cgrp.root_mask());
        {
            let mb = self.css_set.lock();
            for dsct in live_descendants_pre(cgrp) {
                for cset in mb.cgroup_csets(&dsct) {
                    self.migrate_add_src(&mb, &mut ctx, &cset, &dsct);
                }
            }
        }
        let result = self.migrate_prepare_dst(&mut ctx).and_then(|()| {
            let pids: Vec<Pid> = {
                let mb = self.css_set.lock();
                ctx.srcs
                    .iter()
                    .flat_map(|src| mb.cset_tasks(&src.cset))
                    .collect()
            };
            self.migrate_execute(&ctx, &pids)
        });
        self.migrate_finish(&mut ctx);
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockall::Sequence;
    use nix::unistd::Pid;

    use crate::common::{CgroupError, ControllerError};
    use crate::subsys::{Controller, MockController};
    use crate::test::{new_core, pid, HookCall};
    use crate::CgroupCore;

    /// A mock that accepts every lifecycle call and leaves the migration
    /// hooks to the caller.
    fn lifecycle_mock(name: &'static str) -> MockController {
        let mut mock = MockController::new();
        mock.expect_name().return_const(name);
        mock.expect_legacy_name().return_const(name);
        mock.expect_depends_on().returning(Vec::new);
        mock.expect_implicit_on_dfl().return_const(false);
        mock.expect_dfl_files().returning(Vec::new);
        mock.expect_legacy_files().returning(Vec::new);
        mock.expect_task_hooks()
            .returning(crate::subsys::TaskHooks::empty);
        mock.expect_css_alloc()
            .returning(|_| Ok(Box::new(()) as crate::subsys::CssPrivate));
        mock.expect_css_online().returning(|_| Ok(()));
        mock.expect_css_offline().return_const(());
        mock.expect_css_released().return_const(());
        mock.expect_css_free().return_const(());
        mock.expect_css_reset().return_const(());
        mock.expect_post_attach().return_const(());
        mock
    }

    fn mock_core(mocks: Vec<MockController>) -> CgroupCore {
        let mut builder = CgroupCore::builder().config(crate::CoreConfig {
            grace_period_ms: 0,
            ..Default::default()
        });
        for mock in mocks {
            builder = builder.controller(Box::new(mock));
        }
        builder.build().expect("build core")
    }

    #[test]
    fn test_enable_scenario_resolves_nearest_state() {
        let (core, _log) = new_core(&["a", "b"]);
        let root = core.default_root();
        core.write_file(&root, "cgroup.subtree_control", "+a", None)
            .expect("enable a");
        let c1 = core.mkdir(&root, "c1").expect("mkdir");
        core.fork(None, pid(100)).expect("fork");
        core.attach(&c1, pid(100), true).expect("attach");

        let a = core.task_css(pid(100), 0).expect("a");
        let b = core.task_css(pid(100), 1).expect("b");
        assert!(Arc::ptr_eq(&a, &c1.css(0).expect("c1 a")));
        assert!(Arc::ptr_eq(&b, &root.css(1).expect("root b")));
        let cgrp = core
            .task_cgroup(pid(100), &core.default_hierarchy())
            .expect("task group");
        assert!(Arc::ptr_eq(&cgrp, &c1));
    }

    #[test]
    fn test_refused_migration_rolls_back() {
        let mut seq = Sequence::new();
        let mut first = lifecycle_mock("first");
        let mut second = lifecycle_mock("second");
        first
            .expect_can_attach()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|tset| {
                assert_eq!(tset.len(), 1);
                Ok(())
            });
        second
            .expect_can_attach()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ControllerError::Denied("quota".into())));
        first
            .expect_cancel_attach()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        second.expect_cancel_attach().never();
        first.expect_attach().never();
        second.expect_attach().never();

        let core = mock_core(vec![first, second]);
        let root = core.default_root();
        core.write_file(&root, "cgroup.subtree_control", "+first +second", None)
            .expect("enable both");
        let child = core.mkdir(&root, "child").expect("mkdir");
        core.fork(None, pid(10)).expect("fork");
        let before = core.task_css_set(pid(10)).expect("cset");
        let refs = before.refcount();

        let err = core
            .attach(&child, pid(10), false)
            .expect_err("second refuses");
        assert!(matches!(err, CgroupError::Denied { ref controller, .. } if controller == "second"));
        assert_eq!(err.errno(), nix::errno::Errno::EACCES);
        let after = core.task_css_set(pid(10)).expect("cset");
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.refcount(), refs);
        assert!(!child.is_populated());
    }

    #[test]
    fn test_attach_hooks_run_in_slot_order() {
        let mut seq = Sequence::new();
        let mut first = lifecycle_mock("first");
        let mut second = lifecycle_mock("second");
        first.expect_can_attach().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        second.expect_can_attach().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        first.expect_attach().times(1).in_sequence(&mut seq).return_const(());
        second
            .expect_attach()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|tset| {
                let entry = tset.iter().next().expect("one task");
                assert_eq!(entry.pid, Pid::from_raw(10));
                assert_ne!(entry.src.serial_nr(), entry.dst.serial_nr());
            });
        first.expect_cancel_attach().never();
        second.expect_cancel_attach().never();

        let core = mock_core(vec![first, second]);
        let root = core.default_root();
        core.write_file(&root, "cgroup.subtree_control", "+first +second", None)
            .expect("enable both");
        let child = core.mkdir(&root, "child").expect("mkdir");
        core.fork(None, pid(10)).expect("fork");
        core.attach(&child, pid(10), false).expect("attach");
        assert!(child.is_populated());
    }

    #[test]
    fn test_attach_to_current_group_is_a_noop() {
        let (core, log) = new_core(&["a"]);
        let root = core.default_root();
        let child = core.mkdir(&root, "c").expect("mkdir");
        core.fork(None, pid(10)).expect("fork");
        core.attach(&child, pid(10), false).expect("attach");
        let cset = core.task_css_set(pid(10)).expect("cset");
        let refs = cset.refcount();
        let gen = child.membership_gen();
        log.clear();

        core.attach(&child, pid(10), false).expect("attach again");
        assert!(log.calls().is_empty(), "{:?}", log.calls());
        assert_eq!(cset.refcount(), refs);
        assert_eq!(child.membership_gen(), gen);
        assert_eq!(child.population(), 1);
    }

    #[test]
    fn test_threadgroup_attach_skips_exiting_thread() {
        let (core, log) = new_core(&["a"]);
        let root = core.default_root();
        core.write_file(&root, "cgroup.subtree_control", "+a", None)
            .expect("enable");
        let g = core.mkdir(&root, "g").expect("mkdir");
        core.fork(None, pid(100)).expect("fork leader");
        for tid in 101..104 {
            core.fork_thread(pid(100), pid(tid)).expect("spawn thread");
        }
        core.exit_begin(pid(102)).expect("thread exiting");
        log.clear();

        core.attach(&g, pid(101), true).expect("attach process");
        let mut moved: Vec<i32> = core.cgroup_tasks(&g).map(|p| p.as_raw()).collect();
        moved.sort_unstable();
        assert_eq!(moved, vec![100, 101, 103]);
        let stayed: Vec<Pid> = core.cgroup_tasks(&root).collect();
        assert_eq!(stayed, vec![pid(102)]);

        let admitted = log
            .calls()
            .into_iter()
            .find_map(|call| match call {
                HookCall::CanAttach("a", pids) => Some(pids),
                _ => None,
            })
            .expect("can_attach called");
        assert_eq!(admitted.len(), 3);
    }

    #[test]
    fn test_attach_errors() {
        let (core, _log) = new_core(&["a"]);
        let root = core.default_root();
        let p = core.mkdir(&root, "p").expect("mkdir");
        assert!(matches!(
            core.attach(&p, pid(99), false),
            Err(CgroupError::NoSuchTask(_))
        ));

        core.fork(None, pid(2)).expect("fork kthread");
        core.set_no_migrate(pid(2), true).expect("mark kthread");
        assert!(matches!(
            core.attach(&p, pid(2), false),
            Err(CgroupError::InvalidArgument(_))
        ));

        core.write_file(&root, "cgroup.subtree_control", "+a", None)
            .expect("enable on root");
        core.write_file(&p, "cgroup.subtree_control", "+a", None)
            .expect("enable on p");
        core.fork(None, pid(10)).expect("fork");
        assert!(matches!(
            core.attach(&p, pid(10), false),
            Err(CgroupError::Busy(_))
        ));
        core.attach(&root, pid(10), false).expect("root always accepts tasks");

        let q = core.mkdir(&root, "q").expect("mkdir q");
        core.rmdir(&q).expect("rmdir q");
        assert!(matches!(
            core.attach(&q, pid(10), false),
            Err(CgroupError::NoDevice)
        ));
    }

    #[test]
    fn test_transfer_tasks_on_legacy_hierarchy() {
        let (core, _log) = new_core(&["a"]);
        let h = core
            .mount(&crate::MountOptions::new().subsys(&["a"]))
            .expect("mount");
        let root = h.root_cgroup().clone();
        let src = core.mkdir(&root, "src").expect("mkdir src");
        let dst = core.mkdir(&root, "dst").expect("mkdir dst");
        for p in 10..14 {
            core.fork(None, pid(p)).expect("fork");
            core.attach(&src, pid(p), false).expect("attach");
        }
        core.exit_begin(pid(13)).expect("exiting");

        core.transfer_tasks(&dst, &src).expect("transfer");
        let mut moved: Vec<i32> = core.cgroup_tasks(&dst).map(|p| p.as_raw()).collect();
        moved.sort_unstable();
        assert_eq!(moved, vec![10, 11, 12]);
        let left: Vec<Pid> = core.cgroup_tasks(&src).collect();
        assert_eq!(left, vec![pid(13)]);
    }

    #[test]
    fn test_attach_task_all_follows_legacy_groups() {
        let (core, _log) = new_core(&["a", "b"]);
        let ha = core
            .mount(&crate::MountOptions::new().subsys(&["a"]))
            .expect("mount a");
        let hb = core
            .mount(&crate::MountOptions::new().subsys(&["b"]))
            .expect("mount b");
        let ga = core.mkdir(ha.root_cgroup(), "x").expect("mkdir a/x");
        let gb = core.mkdir(hb.root_cgroup(), "y").expect("mkdir b/y");
        core.fork(None, pid(10)).expect("fork 10");
        core.fork(None, pid(11)).expect("fork 11");
        core.attach(&ga, pid(10), false).expect("attach a");
        core.attach(&gb, pid(10), false).expect("attach b");

        core.attach_task_all(pid(10), pid(11)).expect("attach all");
        assert!(Arc::ptr_eq(&core.task_cgroup(pid(11), &ha).expect("on a"), &ga));
        assert!(Arc::ptr_eq(&core.task_cgroup(pid(11), &hb).expect("on b"), &gb));
        assert!(Arc::ptr_eq(
            &core.task_css_set(pid(10)).expect("10"),
            &core.task_css_set(pid(11)).expect("11")
        ));
    }
}
