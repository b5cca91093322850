//! OS process and service control used by the patch engine

use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;

/// Process and service control surface
#[async_trait]
pub trait HostControl: Send + Sync {
    /// PIDs of running processes whose name matches exactly
    async fn list_processes(&self, name: &str) -> Result<Vec<u32>, AgentError>;

    async fn kill(&self, pid: u32) -> Result<(), AgentError>;

    /// Whether `pid` exited within `timeout`
    async fn wait_exit(&self, pid: u32, timeout: Duration) -> Result<bool, AgentError>;

    /// Stop `service` and reboot the host from a detached script.
    async fn schedule_restart(&self, service: &str) -> Result<(), AgentError>;
}

/// [`HostControl`] for the machine the agent runs on
pub struct SystemHost {
    scripts_dir: Dir,
    system: Mutex<System>,
    restart_delay_secs: u64,
}

impl SystemHost {
    pub fn new(scripts_dir: Dir) -> Self {
        Self {
            scripts_dir,
            system: Mutex::new(System::new()),
            restart_delay_secs: 5,
        }
    }

    fn refresh<T>(&self, f: impl FnOnce(&System) -> T) -> T {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::All, true);
        f(&system)
    }

    fn is_running(&self, pid: u32) -> bool {
        self.refresh(|system| system.process(Pid::from_u32(pid)).is_some())
    }
}

/// Service names end up in a shell script, so only allow a conservative set.
fn validate_service_name(service: &str) -> Result<(), AgentError> {
    let valid = !service.is_empty()
        && service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(AgentError::ValidationError(format!(
            "Invalid service name: {:?}",
            service
        )))
    }
}

/// Script that stops `service` and reboots after `delay_secs`.
pub fn restart_script(service: &str, delay_secs: u64) -> String {
    if cfg!(windows) {
        format!(
            "@echo off\r\ntimeout /t {delay} /nobreak >nul\r\nsc stop \"{service}\"\r\nshutdown /r /t 0\r\n",
            delay = delay_secs,
            service = service
        )
    } else {
        format!(
            "#!/bin/sh\nsleep {delay}\nsystemctl stop '{service}'\nsystemctl reboot || shutdown -r now\n",
            delay = delay_secs,
            service = service
        )
    }
}

#[async_trait]
impl HostControl for SystemHost {
    async fn list_processes(&self, name: &str) -> Result<Vec<u32>, AgentError> {
        let own_pid = std::process::id();
        Ok(self.refresh(|system| {
            system
                .processes_by_exact_name(OsStr::new(name))
                .map(|process| process.pid().as_u32())
                .filter(|pid| *pid != own_pid)
                .collect()
        }))
    }

    async fn kill(&self, pid: u32) -> Result<(), AgentError> {
        let killed = self.refresh(|system| {
            system
                .process(Pid::from_u32(pid))
                .map(|process| process.kill())
        });
        match killed {
            Some(true) | None => Ok(()),
            Some(false) => Err(AgentError::PatchError(format!("Failed to signal process {}", pid))),
        }
    }

    async fn wait_exit(&self, pid: u32, timeout: Duration) -> Result<bool, AgentError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_running(pid) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn schedule_restart(&self, service: &str) -> Result<(), AgentError> {
        validate_service_name(service)?;
        self.scripts_dir.create().await?;

        let name = if cfg!(windows) { "restart.bat" } else { "restart.sh" };
        let script = self.scripts_dir.file(name);
        script
            .write_string(&restart_script(service, self.restart_delay_secs))
            .await?;

        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(script.path());
            c
        } else {
            let mut c = Command::new("sh");
            c.arg(script.path());
            c
        };

        // Detached: the script outlives the agent it is about to stop
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| AgentError::PatchError(format!("Failed to launch restart script: {}", e)))?;

        info!(
            "Scheduled restart of {} via {} (pid {:?})",
            service,
            script.path().display(),
            child.id()
        );
        Ok(())
    }
}

/// Kill every process named in `names` and confirm none remain.
pub async fn stop_processes(
    host: &dyn HostControl,
    names: &[String],
    timeout: Duration,
) -> Result<usize, AgentError> {
    let mut stopped = 0;

    for name in names {
        for pid in host.list_processes(name).await? {
            debug!("Stopping {} (pid {})", name, pid);
            if let Err(e) = host.kill(pid).await {
                warn!("Kill of {} (pid {}) failed: {}", name, pid, e);
            }
            if host.wait_exit(pid, timeout).await? {
                stopped += 1;
            } else {
                warn!("{} (pid {}) did not exit within {:?}", name, pid, timeout);
            }
        }

        let remaining = host.list_processes(name).await?;
        if !remaining.is_empty() {
            return Err(AgentError::PatchError(format!(
                "{} still running (pids {:?})",
                name, remaining
            )));
        }
    }

    Ok(stopped)
}
