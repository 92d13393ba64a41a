//! Release notification for abandoned groups.

use std::process::{Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cgroup::Cgroup;
use crate::core::Shared;

/// Receives a notification when a `notify_on_release` group became empty.
pub trait ReleaseAgent: Send + Sync {
    /// `agent` is the hierarchy's configured program, `path` the group path
    /// relative to the hierarchy root.
    fn notify(&self, agent: &str, path: &str);
}

/// Spawns the configured program with the group path as its only argument.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsermodeReleaseAgent;

impl ReleaseAgent for UsermodeReleaseAgent {
    fn notify(&self, agent: &str, path: &str) {
        if agent.is_empty() {
            return;
        }
        let spawned = Command::new(agent)
            .arg(path)
            .env_clear()
            .env("HOME", "/")
            .env("PATH", "/sbin:/bin:/usr/sbin:/usr/bin")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .current_dir("/")
            .spawn();
        match spawned {
            Ok(mut child) => {
                tracing::debug!(agent, path, pid = child.id(), "release agent started");
                // Reaped off the caller's thread.
                std::thread::spawn(move || {
                    if let Err(err) = child.wait() {
                        tracing::warn!(?err, "failed to reap release agent");
                    }
                });
            }
            Err(err) => tracing::warn!(agent, path, ?err, "failed to start release agent"),
        }
    }
}

impl Shared {
    fn releasable(cgrp: &Cgroup) -> bool {
        cgrp.parent().is_some()
            && cgrp.notify_on_release()
            && !cgrp.is_populated()
            && !cgrp.has_online_children()
            && !cgrp.is_dead()
    }

    /// Schedules one release notification for `cgrp` if it is abandoned.
    /// May be called with the membership lock held.
    pub(crate) fn check_for_release(&self, cgrp: &Arc<Cgroup>) {
        if !Self::releasable(cgrp) {
            return;
        }
        if cgrp.release_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let cgrp = cgrp.clone();
        let me = self.me.clone();
        self.destroy_wq.queue(move || {
            if let Some(shared) = me.upgrade() {
                shared.release_agent_work(&cgrp);
            }
        });
    }

    fn release_agent_work(&self, cgrp: &Arc<Cgroup>) {
        let target = {
            let _state = self.state.lock();
            cgrp.release_pending.store(false, Ordering::Release);
            cgrp.root()
                .map(|root| (root.release_agent_path(), cgrp.path()))
        };
        let Some((agent, path)) = target else { return };
        if agent.is_empty() {
            tracing::trace!(%path, "no release agent configured");
            return;
        }
        tracing::debug!(%agent, %path, "notifying release agent");
        self.release_agent.notify(&agent, &path);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use parking_lot::Mutex;

    use super::*;
    use crate::test::pid;
    use crate::test_controller::{ControllerSpec, HookLog, RecordingController};
    use crate::{CgroupCore, MountOptions};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl ReleaseAgent for Recorder {
        fn notify(&self, agent: &str, path: &str) {
            self.seen.lock().push((agent.to_owned(), path.to_owned()));
        }
    }

    fn core_with_agent() -> (CgroupCore, Arc<Recorder>) {
        let agent = Arc::new(Recorder::default());
        let log = HookLog::default();
        let core = CgroupCore::builder()
            .config(crate::CoreConfig {
                grace_period_ms: 0,
                ..Default::default()
            })
            .controller(Box::new(RecordingController::new(
                ControllerSpec::new("a"),
                log,
            )))
            .release_agent(agent.clone())
            .build()
            .expect("build core");
        (core, agent)
    }

    #[test]
    fn test_release_notified_once_when_emptied() -> Result<()> {
        let (core, agent) = core_with_agent();
        let h = core.mount(&MountOptions::new().subsys(&["a"]).release_agent("/bin/agent"))?;
        let root = h.root_cgroup().clone();
        let g = core.mkdir(&root, "g")?;
        core.write_file(&g, "notify_on_release", "1", None)?;
        core.fork(None, pid(10))?;
        core.fork(None, pid(11))?;
        core.attach(&g, pid(10), false)?;
        core.attach(&g, pid(11), false)?;

        core.attach(&root, pid(10), false)?;
        core.flush_destruction();
        assert!(agent.seen.lock().is_empty());

        core.attach(&root, pid(11), false)?;
        core.flush_destruction();
        assert_eq!(
            *agent.seen.lock(),
            vec![("/bin/agent".to_owned(), "/g".to_owned())]
        );
        Ok(())
    }

    #[test]
    fn test_release_waits_for_children() -> Result<()> {
        let (core, agent) = core_with_agent();
        let h = core.mount(&MountOptions::new().none().name("n").release_agent("/bin/agent"))?;
        let root = h.root_cgroup().clone();
        core.write_file(&root, "notify_on_release", "1", None)?;
        let p = core.mkdir(&root, "p")?;
        let c = core.mkdir(&p, "c")?;
        core.fork(None, pid(10))?;
        core.attach(&c, pid(10), false)?;
        core.attach(&root, pid(10), false)?;
        core.flush_destruction();
        // p still has a child.
        assert_eq!(*agent.seen.lock(), vec![("/bin/agent".to_owned(), "/p/c".to_owned())]);

        core.rmdir(&c)?;
        core.flush_destruction();
        assert_eq!(agent.seen.lock().len(), 2);
        assert_eq!(agent.seen.lock()[1].1, "/p");
        Ok(())
    }

    #[test]
    fn test_no_notification_without_flag() -> Result<()> {
        let (core, agent) = core_with_agent();
        let h = core.mount(&MountOptions::new().subsys(&["a"]).release_agent("/bin/agent"))?;
        let g = core.mkdir(h.root_cgroup(), "g")?;
        core.fork(None, pid(10))?;
        core.attach(&g, pid(10), false)?;
        core.attach(h.root_cgroup(), pid(10), false)?;
        core.flush_destruction();
        assert!(agent.seen.lock().is_empty());
        Ok(())
    }

    #[test]
    fn test_usermode_agent_spawns_program() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("released");
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, format!("echo \"$PATH\" > {}\n", out.display()))?;
        // The shell is the agent, the script stands in for the group path.
        UsermodeReleaseAgent.notify("/bin/sh", &script.to_string_lossy());
        for _ in 0..500 {
            if std::fs::read_to_string(&out).map_or(false, |s| s == "/sbin:/bin:/usr/sbin:/usr/bin\n") {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        anyhow::bail!("release agent did not run");
    }

    #[test]
    fn test_usermode_agent_tolerates_missing_program() {
        UsermodeReleaseAgent.notify("/nonexistent/agent", "/g");
        UsermodeReleaseAgent.notify("", "/g");
    }
}
