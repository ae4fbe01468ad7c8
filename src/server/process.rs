//! Child process ownership: spawn, liveness, termination.

use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use super::command::LaunchCommand;
use crate::error::{Result, ServerError};
use crate::log_filter::spawn_stderr_filter;

/// How long a terminated server gets to exit before it is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the spawned llama-server. Dropping it stops the process.
#[derive(Debug)]
pub struct ServerProcess {
    child: Option<Child>,
}

impl ServerProcess {
    /// Spawn the server and attach the stderr filter thread.
    pub fn spawn(launch: &LaunchCommand) -> Result<Self> {
        let mut child = launch
            .to_command()
            .spawn()
            .map_err(|source| ServerError::Spawn {
                binary: launch.program.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            // Without the filter the pipe would fill up and block the server
            if let Err(e) = spawn_stderr_filter(stderr) {
                warn!("[SERVER] Could not start stderr filter thread: {e}");
            }
        }

        info!("[SERVER] Spawned llama-server (pid {})", child.id());
        Ok(Self { child: Some(child) })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// `Some(status)` once the process has exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("[SERVER] Failed to query process status: {e}");
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.child.is_some() && self.exit_status().is_none()
    }

    /// Terminate, wait up to `STOP_TIMEOUT`, then kill. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        info!("[SERVER] Stopping llama-server (pid {})", child.id());
        request_termination(&mut child);

        if wait_with_timeout(&mut child, STOP_TIMEOUT).is_none() {
            warn!(
                "[SERVER] llama-server did not exit within {}s, killing",
                STOP_TIMEOUT.as_secs()
            );
            let _ = child.kill();
            let _ = child.wait(); // Reap
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: plain syscall on a pid we own and have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.kill();
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
            _ => return None,
        }
    }
}
