use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, trace};

use crate::container;

/// Time a process group gets between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// SIGTERM the child's process group, then SIGKILL whatever is left after `grace`.
///
/// The child must have been spawned as a process-group leader.
#[cfg(target_family = "unix")]
pub async fn kill_graceful(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            trace!(target: "pilot.exec.proc", pid, "process group terminated");
            signal_group(pid, libc::SIGKILL);
            return Ok(());
        }
        debug!(target: "pilot.exec.proc", pid, "process group ignored SIGTERM; killing");
        signal_group(pid, libc::SIGKILL);
    }
    let _ = child.kill().await;
    child.wait().await.map(|_| ())
}

#[cfg(target_family = "windows")]
pub async fn kill_graceful(child: &mut Child, _grace: Duration) -> std::io::Result<()> {
    child.kill().await
}

#[cfg(target_family = "unix")]
fn signal_group(pid: u32, sig: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: plain syscall on a process group we spawned; failures (ESRCH) are ignored.
    unsafe {
        libc::kill(-pid, sig);
    }
}

/// SIGKILLs the process group of a child when dropped while still armed, and `docker kill`s the
/// named container the child was running, if any.
///
/// Covers the case where the task future is dropped (engine abort) before the child was reaped.
pub struct GroupGuard {
    pid: Option<u32>,
    container: Option<String>,
}

impl GroupGuard {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            container: None,
        }
    }

    pub fn with_container(mut self, name: Option<String>) -> Self {
        self.container = name;
        self
    }

    pub fn disarm(&mut self) {
        self.pid = None;
        self.container = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(name) = self.container.take() {
            debug!(target: "pilot.exec.container", container = %name, "execution dropped; killing container");
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move { container::kill_container(&name).await });
                }
                Err(_) => {
                    let _ = std::process::Command::new("docker")
                        .arg("kill")
                        .arg(&name)
                        .stdin(std::process::Stdio::null())
                        .stdout(std::process::Stdio::null())
                        .stderr(std::process::Stdio::null())
                        .spawn();
                }
            }
        }
        #[cfg(target_family = "unix")]
        {
            if let Some(pid) = self.pid.take() {
                debug!(target: "pilot.exec.proc", pid, "execution dropped; killing process group");
                signal_group(pid, libc::SIGKILL);
            }
        }
    }
}
