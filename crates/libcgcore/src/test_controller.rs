//! A controller that records every hook call, for exercising the engine.

use std::collections::HashSet;
use std::sync::Arc;

use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::cftype::CfType;
use crate::common::ControllerError;
use crate::css::Css;
use crate::subsys::{Controller, CssPrivate, TaskHooks, TaskSet};

/// One recorded hook invocation. States are identified by their id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCall {
    Alloc(&'static str),
    Online(&'static str, u32),
    Offline(&'static str, u32),
    Released(&'static str, u32),
    Free(&'static str, u32),
    Reset(&'static str, u32),
    Bind(&'static str),
    CanAttach(&'static str, Vec<Pid>),
    CancelAttach(&'static str, Vec<Pid>),
    Attach(&'static str, Vec<Pid>),
    PostAttach(&'static str),
    CanFork(&'static str, Pid),
    CancelFork(&'static str, Pid),
    Fork(&'static str, Pid),
    Exit(&'static str, Pid),
    TaskFree(&'static str, Pid),
}

#[derive(Default)]
struct LogInner {
    calls: Vec<HookCall>,
    fail_alloc: HashSet<&'static str>,
    fail_online: HashSet<&'static str>,
    fail_can_fork: HashSet<&'static str>,
    deny_attach: HashSet<&'static str>,
}

/// Call log shared by every [`RecordingController`] of one engine, plus
/// switches to make individual hooks fail.
#[derive(Clone, Default)]
pub struct HookLog {
    inner: Arc<Mutex<LogInner>>,
}

fn toggle(set: &mut HashSet<&'static str>, name: &'static str, on: bool) {
    if on {
        set.insert(name);
    } else {
        set.remove(name);
    }
}

impl HookLog {
    pub fn calls(&self) -> Vec<HookCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn fail_alloc(&self, name: &'static str, on: bool) {
        toggle(&mut self.inner.lock().fail_alloc, name, on);
    }

    pub fn fail_online(&self, name: &'static str, on: bool) {
        toggle(&mut self.inner.lock().fail_online, name, on);
    }

    pub fn fail_can_fork(&self, name: &'static str, on: bool) {
        toggle(&mut self.inner.lock().fail_can_fork, name, on);
    }

    pub fn deny_attach(&self, name: &'static str, on: bool) {
        toggle(&mut self.inner.lock().deny_attach, name, on);
    }

    fn record(&self, call: HookCall) {
        self.inner.lock().calls.push(call);
    }
}

/// Static shape of a [`RecordingController`].
#[derive(Clone)]
pub struct ControllerSpec {
    name: &'static str,
    depends_on: Vec<&'static str>,
    implicit_on_dfl: bool,
    task_hooks: TaskHooks,
    dfl_files: Vec<CfType>,
    legacy_files: Vec<CfType>,
}

impl ControllerSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            depends_on: Vec::new(),
            implicit_on_dfl: false,
            task_hooks: TaskHooks::empty(),
            dfl_files: Vec::new(),
            legacy_files: Vec::new(),
        }
    }

    pub fn depends_on(mut self, deps: &[&'static str]) -> Self {
        self.depends_on = deps.to_vec();
        self
    }

    pub fn implicit_on_dfl(mut self) -> Self {
        self.implicit_on_dfl = true;
        self
    }

    /// Subscribes to every task lifecycle hook.
    pub fn fork_hooks(mut self) -> Self {
        self.task_hooks = TaskHooks::all();
        self
    }

    pub fn dfl_file(mut self, cft: CfType) -> Self {
        self.dfl_files.push(cft);
        self
    }

    pub fn legacy_file(mut self, cft: CfType) -> Self {
        self.legacy_files.push(cft);
        self
    }
}

pub struct RecordingController {
    spec: ControllerSpec,
    log: HookLog,
}

impl RecordingController {
    pub fn new(spec: ControllerSpec, log: HookLog) -> Self {
        Self { spec, log }
    }

    fn pids(tset: &TaskSet) -> Vec<Pid> {
        tset.iter().map(|entry| entry.pid).collect()
    }

    fn fails(&self, pick: impl FnOnce(&LogInner) -> &HashSet<&'static str>) -> bool {
        let inner = self.log.inner.lock();
        pick(&inner).contains(self.spec.name)
    }
}

impl Controller for RecordingController {
    fn name(&self) -> &'static str {
        self.spec.name
    }

    fn depends_on(&self) -> Vec<&'static str> {
        self.spec.depends_on.clone()
    }

    fn implicit_on_dfl(&self) -> bool {
        self.spec.implicit_on_dfl
    }

    fn dfl_files(&self) -> Vec<CfType> {
        self.spec.dfl_files.clone()
    }

    fn legacy_files(&self) -> Vec<CfType> {
        self.spec.legacy_files.clone()
    }

    fn task_hooks(&self) -> TaskHooks {
        self.spec.task_hooks
    }

    fn css_alloc(&self, _parent: Option<Arc<Css>>) -> Result<CssPrivate, ControllerError> {
        self.log.record(HookCall::Alloc(self.spec.name));
        if self.fails(|l| &l.fail_alloc) {
            return Err(ControllerError::NoMemory(format!("{} allocation", self.spec.name)));
        }
        Ok(Box::new(()))
    }

    fn css_online(&self, css: &Css) -> Result<(), ControllerError> {
        self.log.record(HookCall::Online(self.spec.name, css.id()));
        if self.fails(|l| &l.fail_online) {
            return Err(ControllerError::Busy(format!("{} online", self.spec.name)));
        }
        Ok(())
    }

    fn css_offline(&self, css: &Css) {
        self.log.record(HookCall::Offline(self.spec.name, css.id()));
    }

    fn css_released(&self, css: &Css) {
        self.log.record(HookCall::Released(self.spec.name, css.id()));
    }

    fn css_free(&self, css: &Css) {
        self.log.record(HookCall::Free(self.spec.name, css.id()));
    }

    fn css_reset(&self, css: &Css) {
        self.log.record(HookCall::Reset(self.spec.name, css.id()));
    }

    fn bind(&self, _root_css: &Css) {
        self.log.record(HookCall::Bind(self.spec.name));
    }

    fn can_attach(&self, tset: &TaskSet) -> Result<(), ControllerError> {
        self.log
            .record(HookCall::CanAttach(self.spec.name, Self::pids(tset)));
        if self.fails(|l| &l.deny_attach) {
            return Err(ControllerError::Denied(format!("{} refuses", self.spec.name)));
        }
        Ok(())
    }

    fn cancel_attach(&self, tset: &TaskSet) {
        self.log
            .record(HookCall::CancelAttach(self.spec.name, Self::pids(tset)));
    }

    fn attach(&self, tset: &TaskSet) {
        self.log
            .record(HookCall::Attach(self.spec.name, Self::pids(tset)));
    }

    fn post_attach(&self) {
        self.log.record(HookCall::PostAttach(self.spec.name));
    }

    fn can_fork(&self, task: Pid) -> Result<(), ControllerError> {
        self.log.record(HookCall::CanFork(self.spec.name, task));
        if self.fails(|l| &l.fail_can_fork) {
            return Err(ControllerError::Denied(format!("{} is full", self.spec.name)));
        }
        Ok(())
    }

    fn cancel_fork(&self, task: Pid) {
        self.log.record(HookCall::CancelFork(self.spec.name, task));
    }

    fn fork(&self, task: Pid) {
        self.log.record(HookCall::Fork(self.spec.name, task));
    }

    fn exit(&self, task: Pid) {
        self.log.record(HookCall::Exit(self.spec.name, task));
    }

    fn free(&self, task: Pid) {
        self.log.record(HookCall::TaskFree(self.spec.name, task));
    }
}
