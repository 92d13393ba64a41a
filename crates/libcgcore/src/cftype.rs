use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::common::ControllerError;
use crate::css::Css;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CfTypeFlags: u32 {
        /// Not created on a hierarchy root.
        const NOT_ON_ROOT = 1 << 0;
        /// Only created on a hierarchy root.
        const ONLY_ON_ROOT = 1 << 1;
        /// Not prefixed with the controller name.
        const NO_PREFIX = 1 << 2;
        /// Writable by everyone rather than only the owner.
        const WORLD_WRITABLE = 1 << 3;
    }
}

pub type ReadFn = Arc<dyn Fn(&Css) -> Result<String, ControllerError> + Send + Sync>;
pub type WriteFn = Arc<dyn Fn(&Css, &str) -> Result<(), ControllerError> + Send + Sync>;

/// Descriptor of an interface file a controller exposes on each group.
#[derive(Clone)]
pub struct CfType {
    pub name: String,
    pub flags: CfTypeFlags,
    pub read: Option<ReadFn>,
    pub write: Option<WriteFn>,
}

impl CfType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: CfTypeFlags::empty(),
            read: None,
            write: None,
        }
    }

    pub fn flags(mut self, flags: CfTypeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn read(
        mut self,
        f: impl Fn(&Css) -> Result<String, ControllerError> + Send + Sync + 'static,
    ) -> Self {
        self.read = Some(Arc::new(f));
        self
    }

    pub fn write(
        mut self,
        f: impl Fn(&Css, &str) -> Result<(), ControllerError> + Send + Sync + 'static,
    ) -> Self {
        self.write = Some(Arc::new(f));
        self
    }

    pub fn mode(&self) -> u32 {
        file_mode(self.read.is_some(), self.write.is_some(), self.flags)
    }

    /// Whether the file belongs on a group at the given position.
    pub(crate) fn applies_to(&self, is_root: bool) -> bool {
        !(is_root && self.flags.contains(CfTypeFlags::NOT_ON_ROOT)
            || !is_root && self.flags.contains(CfTypeFlags::ONLY_ON_ROOT))
    }

    pub(crate) fn file_name(&self, prefix: Option<&str>, noprefix: bool) -> String {
        match prefix {
            Some(ss) if !noprefix && !self.flags.contains(CfTypeFlags::NO_PREFIX) => {
                format!("{}.{}", ss, self.name)
            }
            _ => self.name.clone(),
        }
    }
}

impl fmt::Debug for CfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CfType")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("mode", &format_args!("{:o}", self.mode()))
            .finish()
    }
}

/// Permission bits of an interface file.
pub fn file_mode(readable: bool, writable: bool, flags: CfTypeFlags) -> u32 {
    let mut mode = 0;
    if readable {
        mode |= 0o444;
    }
    if writable {
        if flags.contains(CfTypeFlags::WORLD_WRITABLE) {
            mode |= 0o222;
        } else {
            mode |= 0o200;
        }
    }
    mode
}

/// Files the engine itself provides on every group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoreFile {
    Procs,
    Tasks,
    Controllers,
    SubtreeControl,
    Events,
    CloneChildren,
    SaneBehavior,
    NotifyOnRelease,
    ReleaseAgent,
}

#[derive(Clone)]
pub(crate) enum FileKind {
    Core(CoreFile),
    Subsys { css: Weak<Css>, cft: Arc<CfType> },
}

/// A file in a group's file table.
pub struct CgroupFile {
    name: String,
    mode: u32,
    pub(crate) kind: FileKind,
    event: Mutex<u64>,
    changed: Condvar,
}

impl CgroupFile {
    pub(crate) fn new(name: String, mode: u32, kind: FileKind) -> Self {
        Self {
            name,
            mode,
            kind,
            event: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Owning controller state, `None` for engine files.
    pub fn css(&self) -> Option<Arc<Css>> {
        match &self.kind {
            FileKind::Core(_) => None,
            FileKind::Subsys { css, .. } => css.upgrade(),
        }
    }

    /// Current notification generation.
    pub fn generation(&self) -> u64 {
        *self.event.lock()
    }

    pub(crate) fn notify(&self) {
        let mut event = self.event.lock();
        *event += 1;
        self.changed.notify_all();
    }

    /// Waits until the generation moves past `seen`. Returns the current
    /// generation, which equals `seen` on timeout.
    pub fn poll(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut event = self.event.lock();
        while *event == seen {
            if self.changed.wait_until(&mut event, deadline).timed_out() {
                break;
            }
        }
        *event
    }
}

impl fmt::Debug for CgroupFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupFile")
            .field("name", &self.name)
            .field("mode", &format_args!("{:o}", self.mode))
            .finish()
    }
}

/// Name-indexed files of one group.
#[derive(Debug, Default)]
pub(crate) struct FileTable {
    files: RwLock<BTreeMap<String, Arc<CgroupFile>>>,
}

impl FileTable {
    pub fn add(&self, file: CgroupFile) -> Arc<CgroupFile> {
        let file = Arc::new(file);
        self.files
            .write()
            .insert(file.name().to_owned(), file.clone());
        file
    }

    pub fn get(&self, name: &str) -> Option<Arc<CgroupFile>> {
        self.files.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    /// Removes every file owned by `css`.
    pub fn remove_css(&self, css: &Arc<Css>) {
        self.files.write().retain(|_, file| match &file.kind {
            FileKind::Subsys { css: owner, .. } => !std::ptr::eq(owner.as_ptr(), Arc::as_ptr(css)),
            FileKind::Core(_) => true,
        });
    }

    pub fn remove_core(&self) {
        self.files
            .write()
            .retain(|_, file| !matches!(file.kind, FileKind::Core(_)));
    }

    pub fn clear(&self) {
        self.files.write().clear();
    }
}
