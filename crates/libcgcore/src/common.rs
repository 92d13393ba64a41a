use nix::errno::Errno;
use nix::unistd::Pid;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_TASKS: &str = "tasks";
pub const CGROUP_CONTROLLERS: &str = "cgroup.controllers";
pub const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";
pub const CGROUP_EVENTS: &str = "cgroup.events";
pub const CGROUP_CLONE_CHILDREN: &str = "cgroup.clone_children";
pub const CGROUP_SANE_BEHAVIOR: &str = "cgroup.sane_behavior";
pub const CGROUP_NOTIFY_ON_RELEASE: &str = "notify_on_release";
pub const CGROUP_RELEASE_AGENT: &str = "release_agent";

/// Errors reported back to callers of the engine.
#[derive(thiserror::Error, Debug)]
pub enum CgroupError {
    #[error("{controller} refused the migration: {source}")]
    Denied {
        controller: String,
        #[source]
        source: ControllerError,
    },
    #[error("out of memory allocating {0}")]
    NoMemory(&'static str),
    #[error("busy: {0}")]
    Busy(String),
    #[error("cgroup is gone")]
    NoDevice,
    #[error("{0} is not available here")]
    NoEntry(String),
    #[error("no such task: {0}")]
    NoSuchTask(Pid),
    #[error("{0} already exists")]
    Exists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{controller} failed: {source}")]
    Controller {
        controller: String,
        #[source]
        source: ControllerError,
    },
}

impl CgroupError {
    pub fn errno(&self) -> Errno {
        match self {
            CgroupError::Denied { source, .. } => match source {
                ControllerError::Denied(_) => Errno::EACCES,
                other => other.errno(),
            },
            CgroupError::NoMemory(_) => Errno::ENOMEM,
            CgroupError::Busy(_) => Errno::EBUSY,
            CgroupError::NoDevice => Errno::ENODEV,
            CgroupError::NoEntry(_) => Errno::ENOENT,
            CgroupError::NoSuchTask(_) => Errno::ESRCH,
            CgroupError::Exists(_) => Errno::EEXIST,
            CgroupError::InvalidArgument(_) => Errno::EINVAL,
            CgroupError::Controller { source, .. } => source.errno(),
        }
    }

    pub(crate) fn busy(reason: impl Into<String>) -> Self {
        CgroupError::Busy(reason.into())
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        CgroupError::InvalidArgument(reason.into())
    }
}

/// Errors returned by controller hooks.
#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("out of resources: {0}")]
    NoMemory(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ControllerError {
    pub fn errno(&self) -> Errno {
        match self {
            ControllerError::Denied(_) => Errno::EACCES,
            ControllerError::NoMemory(_) => Errno::ENOMEM,
            ControllerError::Invalid(_) => Errno::EINVAL,
            ControllerError::Busy(_) => Errno::EBUSY,
            ControllerError::Other(_) => Errno::EIO,
        }
    }
}

/// Parses a non-negative integer the way id writes are accepted: optional
/// surrounding whitespace, `0x`/`0X` for hex, a leading `0` for octal.
pub fn parse_id(input: &str) -> Result<u32, CgroupError> {
    let s = input.trim();
    let invalid = || CgroupError::invalid(format!("{s:?} is not a valid id"));
    if s.is_empty() || s.starts_with('-') {
        return Err(invalid());
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return Err(invalid());
    }
    let value = u32::from_str_radix(digits, radix).map_err(|_| invalid())?;
    if value > i32::MAX as u32 {
        return Err(invalid());
    }
    Ok(value)
}

/// Parses a `0`/`1` flag write.
pub fn parse_bool_flag(input: &str) -> Result<bool, CgroupError> {
    match parse_id(input)? {
        0 => Ok(false),
        _ => Ok(true),
    }
}
