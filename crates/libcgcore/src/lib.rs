//! In-process core of a control group engine: hierarchies of groups,
//! per-controller state attached to them, task membership and migration,
//! and the interface files seen by userspace.
//!
//! Controllers plug in through [`Controller`]. Everything else, from
//! `mkdir` to mounting a legacy hierarchy, goes through [`CgroupCore`].
#[cfg(test)]
#[macro_use]
extern crate quickcheck;


mod cftype;
mod cgroup;
pub mod common;
mod config;
mod control;
mod core;
mod css;
mod css_set;
mod files;
mod hierarchy;
mod idr;
mod iter;
mod lifecycle;
mod mask;
mod migrate;
mod mount;
mod pidlist;
mod refcnt;
mod release;
pub mod stats;
mod subsys;
mod task;
pub mod test_controller;
mod workqueue;

pub use crate::cftype::{file_mode, CfType, CfTypeFlags, CgroupFile, ReadFn, WriteFn};
pub use crate::cgroup::Cgroup;
pub use crate::common::{
    parse_bool_flag, parse_id, CgroupError, ControllerError, CGROUP_CLONE_CHILDREN,
    CGROUP_CONTROLLERS, CGROUP_EVENTS, CGROUP_NOTIFY_ON_RELEASE, CGROUP_PROCS,
    CGROUP_RELEASE_AGENT, CGROUP_SANE_BEHAVIOR, CGROUP_SUBTREE_CONTROL, CGROUP_TASKS,
};
pub use crate::config::{ConfigError, CoreConfig};
pub use crate::core::{BuildError, CgroupCore, CgroupCoreBuilder};
pub use crate::css::Css;
pub use crate::css_set::CssSet;
pub use crate::hierarchy::{Hierarchy, MountOptions, DFL_HIERARCHY_ID};
pub use crate::iter::{
    css_has_online_children, leftmost_descendant, next_child, next_descendant_post,
    next_descendant_pre, rightmost_descendant, CssTaskIter, DescendantsPost, DescendantsPre,
    TreeNode,
};
pub use crate::mask::{SubsysMask, SubsysMaskIter, SUBSYS_COUNT_MAX};
pub use crate::pidlist::PidlistKind;
pub use crate::release::{ReleaseAgent, UsermodeReleaseAgent};
pub use crate::stats::{CgroupStat, TaskCgroup};
pub use crate::subsys::{Controller, CssPrivate, SubsysId, TaskHooks, TaskSet, TaskSetEntry};
pub use crate::workqueue::WorkQueueError;
