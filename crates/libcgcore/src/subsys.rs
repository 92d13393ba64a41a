use std::any::Any;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
#[cfg(test)]
use mockall::automock;
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};

use crate::cftype::CfType;
use crate::common::ControllerError;
use crate::css::Css;
use crate::hierarchy::Hierarchy;
use crate::idr::Idr;
use crate::mask::SubsysMask;

/// Slot index of a registered controller.
pub type SubsysId = usize;

/// Opaque per-group state owned by a controller.
pub type CssPrivate = Box<dyn Any + Send + Sync>;

bitflags! {
    /// Task lifecycle hooks a controller wants to be called for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskHooks: u32 {
        const CAN_FORK = 1 << 0;
        const CANCEL_FORK = 1 << 1;
        const FORK = 1 << 2;
        const EXIT = 1 << 3;
        const FREE = 1 << 4;
    }
}

/// A resource controller plugged into the engine.
///
/// Only `name` and `css_alloc` are mandatory. Hooks run with the structural
/// lock held unless noted otherwise and must not call back into the engine.
#[cfg_attr(test, automock)]
pub trait Controller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Name used on legacy hierarchies.
    fn legacy_name(&self) -> &'static str {
        self.name()
    }

    /// Controllers that have to be enabled whenever this one is.
    fn depends_on(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Enabled on every group of the default hierarchy without being visible
    /// in `cgroup.subtree_control`.
    fn implicit_on_dfl(&self) -> bool {
        false
    }

    fn dfl_files(&self) -> Vec<CfType> {
        Vec::new()
    }

    fn legacy_files(&self) -> Vec<CfType> {
        Vec::new()
    }

    fn task_hooks(&self) -> TaskHooks {
        TaskHooks::empty()
    }

    fn css_alloc(&self, parent: Option<Arc<Css>>) -> Result<CssPrivate, ControllerError>;

    fn css_online(&self, _css: &Css) -> Result<(), ControllerError> {
        Ok(())
    }

    fn css_offline(&self, _css: &Css) {}

    fn css_released(&self, _css: &Css) {}

    /// Called from the destruction queue without the structural lock.
    fn css_free(&self, _css: &Css) {}

    /// Return the state to its defaults while it stays attached but hidden.
    fn css_reset(&self, _css: &Css) {}

    /// The root state moved to another hierarchy.
    fn bind(&self, _root_css: &Css) {}

    fn can_attach(&self, _tset: &TaskSet) -> Result<(), ControllerError> {
        Ok(())
    }

    fn cancel_attach(&self, _tset: &TaskSet) {}

    fn attach(&self, _tset: &TaskSet) {}

    /// Runs after a procs/tasks write, with no locks held.
    fn post_attach(&self) {}

    /// Runs under the shared thread-group barrier.
    fn can_fork(&self, _task: Pid) -> Result<(), ControllerError> {
        Ok(())
    }

    fn cancel_fork(&self, _task: Pid) {}

    fn fork(&self, _task: Pid) {}

    fn exit(&self, _task: Pid) {}

    fn free(&self, _task: Pid) {}
}

/// One task in a migration batch along with its destination state for the
/// controller currently being asked.
#[derive(Clone)]
pub struct TaskSetEntry {
    pub pid: Pid,
    pub tgid: Pid,
    pub src: Arc<Css>,
    pub dst: Arc<Css>,
}

/// The tasks being migrated, as seen by one controller.
pub struct TaskSet {
    pub(crate) ssid: SubsysId,
    pub(crate) entries: Vec<TaskSetEntry>,
}

impl TaskSet {
    pub fn ssid(&self) -> SubsysId {
        self.ssid
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskSetEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destination state of the first task.
    pub fn first_dst(&self) -> Option<&Arc<Css>> {
        self.entries.first().map(|e| &e.dst)
    }
}

/// A registered controller and the engine's bookkeeping around it.
pub(crate) struct Subsys {
    pub id: SubsysId,
    pub name: &'static str,
    pub legacy_name: &'static str,
    pub ctrl: Box<dyn Controller>,
    pub depends_on: SubsysMask,
    pub implicit_on_dfl: bool,
    pub enabled: bool,
    pub no_v1: bool,
    pub dfl_files: Vec<Arc<CfType>>,
    pub legacy_files: Vec<Arc<CfType>>,
    pub root: RwLock<Arc<Hierarchy>>,
    pub css_idr: Mutex<Idr<Weak<Css>>>,
}

impl Subsys {
    pub fn root(&self) -> Arc<Hierarchy> {
        self.root.read().clone()
    }

    pub fn files_for(&self, on_dfl: bool) -> &[Arc<CfType>] {
        if on_dfl {
            &self.dfl_files
        } else {
            &self.legacy_files
        }
    }
}

/// Hook dispatch masks computed once at registration.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HookMasks {
    pub can_fork: SubsysMask,
    pub cancel_fork: SubsysMask,
    pub fork: SubsysMask,
    pub exit: SubsysMask,
    pub free: SubsysMask,
}

impl HookMasks {
    pub fn record(&mut self, ssid: SubsysId, hooks: TaskHooks) {
        if hooks.contains(TaskHooks::CAN_FORK) {
            self.can_fork.insert(ssid);
        }
        if hooks.contains(TaskHooks::CANCEL_FORK) {
            self.cancel_fork.insert(ssid);
        }
        if hooks.contains(TaskHooks::FORK) {
            self.fork.insert(ssid);
        }
        if hooks.contains(TaskHooks::EXIT) {
            self.exit.insert(ssid);
        }
        if hooks.contains(TaskHooks::FREE) {
            self.free.insert(ssid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_masks() {
        let mut masks = HookMasks::default();
        masks.record(0, TaskHooks::FORK | TaskHooks::EXIT);
        masks.record(2, TaskHooks::CAN_FORK | TaskHooks::CANCEL_FORK);
        assert_eq!(masks.fork.iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(masks.exit.iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(masks.can_fork.iter().collect::<Vec<_>>(), vec![2]);
        assert!(masks.free.is_empty());
    }

    #[test]
    fn test_mock_controller_defaults_are_overridable() {
        let mut mock = MockController::new();
        mock.expect_name().return_const("mock");
        mock.expect_can_fork()
            .returning(|_| Err(ControllerError::Denied("full".into())));
        assert_eq!(mock.name(), "mock");
        assert!(mock.can_fork(Pid::from_raw(1)).is_err());
    }
}
