//! Starting tenant backends and owning their handles

use crate::config::BackendConfig;
use crate::error::InstanceError;
use crate::tenant::TenantId;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running backend. Owned by exactly one instance.
#[derive(Debug)]
pub enum ProcessHandle {
    /// Local process spawned directly
    Local(Child),
    /// Backend served by a task inside this process
    Task(JoinHandle<()>),
}

impl ProcessHandle {
    /// OS process id, if this is a live local process
    pub fn id(&self) -> Option<u32> {
        match self {
            ProcessHandle::Local(child) => child.id(),
            ProcessHandle::Task(_) => None,
        }
    }

    /// Returns a description of how the backend died, or `None` while it is still running
    pub fn exit_status(&mut self) -> Option<String> {
        match self {
            ProcessHandle::Local(child) => match child.try_wait() {
                Ok(Some(status)) => Some(format!("backend process exited ({})", status)),
                Ok(None) => None,
                Err(e) => Some(format!("backend process state unknown: {}", e)),
            },
            ProcessHandle::Task(task) => task
                .is_finished()
                .then(|| "backend task finished".to_string()),
        }
    }

    /// Stop the backend: SIGTERM, then SIGKILL once `grace_period` has elapsed
    pub async fn terminate(&mut self, tenant: &str, grace_period: Duration) {
        match self {
            ProcessHandle::Local(child) => terminate_local(tenant, child, grace_period).await,
            ProcessHandle::Task(task) => {
                task.abort();
                debug!(tenant, "Backend task aborted");
            }
        }
    }

    /// Stop the backend immediately without a grace period
    pub fn kill_now(&mut self) {
        match self {
            ProcessHandle::Local(child) => {
                let _ = child.start_kill();
            }
            ProcessHandle::Task(task) => task.abort(),
        }
    }
}

async fn terminate_local(tenant: &str, child: &mut Child, grace_period: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    info!(tenant, pid, "Sending SIGTERM to backend");

    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(tenant, ?status, "Backend process exited");
        }
        Ok(Err(e)) => {
            warn!(tenant, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                tenant,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Starts one backend for a tenant on a given port.
///
/// Must return as soon as the backend is started; readiness is checked separately.
pub trait BackendLauncher: Send + Sync {
    fn launch(&self, tenant: &TenantId, port: u16) -> Result<ProcessHandle, InstanceError>;
}

/// Launches backends as child processes from the `[backend]` configuration
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: BackendConfig,
}

impl ProcessLauncher {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Build the command without spawning it
    fn command(&self, tenant: &TenantId, port: u16) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(
            self.config
                .args
                .iter()
                .map(|arg| substitute(arg, tenant, port)),
        );
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, substitute(value, tenant, port));
        }

        cmd.env("PORT", port.to_string());
        cmd.env("TENANT", tenant.as_str());
        cmd
    }
}

impl BackendLauncher for ProcessLauncher {
    fn launch(&self, tenant: &TenantId, port: u16) -> Result<ProcessHandle, InstanceError> {
        info!(tenant = %tenant, port, command = %self.config.command, "Starting backend");

        let mut child = self
            .command(tenant, port)
            .spawn()
            .map_err(|e| InstanceError::LaunchFailed {
                tenant: tenant.to_string(),
                reason: e.to_string(),
            })?;

        let pid = child.id().unwrap_or(0);
        info!(tenant = %tenant, pid, port, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, tenant.to_string(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, tenant.to_string(), "stderr");
        }

        Ok(ProcessHandle::Local(child))
    }
}

/// Replace `{tenant}` and `{port}` placeholders
fn substitute(template: &str, tenant: &TenantId, port: u16) -> String {
    template
        .replace("{tenant}", tenant.as_str())
        .replace("{port}", &port.to_string())
}

/// Forward a child's output stream into the log, one line per event
fn forward_output<R>(reader: R, tenant: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        debug!(target: "backend", tenant, stream, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(tenant, stream, error = %e, "Backend output stream closed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    #[test]
    fn test_substitute_placeholders() {
        let t = tenant("abc");
        assert_eq!(substitute("data/{tenant}", &t, 4000), "data/abc");
        assert_eq!(substitute("127.0.0.1:{port}", &t, 4000), "127.0.0.1:4000");
        assert_eq!(substitute("plain", &t, 4000), "plain");
    }

    #[tokio::test]
    async fn test_launch_missing_command_fails() {
        let launcher = ProcessLauncher::new(BackendConfig::local("/nonexistent/tenant-backend"));
        let err = launcher.launch(&tenant("abc"), 4000).unwrap_err();
        assert_eq!(err.kind(), "launch_failed");
        assert!(err.to_string().contains("tenant 'abc'"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_terminate() {
        let launcher =
            ProcessLauncher::new(BackendConfig::local("sleep").with_args(vec!["60".to_string()]));
        let mut handle = launcher.launch(&tenant("abc"), 4000).unwrap();

        assert!(handle.id().is_some());
        assert!(handle.exit_status().is_none());

        handle.terminate("abc", Duration::from_secs(2)).await;
        assert!(handle.exit_status().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_reports_early_exit() {
        let launcher = ProcessLauncher::new(
            BackendConfig::local("sh").with_args(vec!["-c".to_string(), "exit 3".to_string()]),
        );
        let mut handle = launcher.launch(&tenant("abc"), 4000).unwrap();

        let mut status = None;
        for _ in 0..100 {
            status = handle.exit_status();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(status.unwrap().contains("exited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_and_tenant_env() {
        let env = HashMap::from([("DATA_DIR".to_string(), "/srv/{tenant}/{port}".to_string())]);
        let launcher = ProcessLauncher::new(
            BackendConfig::local("sh")
                .with_args(vec![
                    "-c".to_string(),
                    "test \"$PORT\" = 4321 && test \"$TENANT\" = abc && test \"$1\" = abc-4321 \
                     && test \"$DATA_DIR\" = /srv/abc/4321"
                        .to_string(),
                    "sh".to_string(),
                    "{tenant}-{port}".to_string(),
                ])
                .with_env(env),
        );
        let mut handle = launcher.launch(&tenant("abc"), 4321).unwrap();

        let status = match handle {
            ProcessHandle::Local(ref mut child) => child.wait().await.unwrap(),
            ProcessHandle::Task(_) => unreachable!(),
        };
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_task_handle_abort() {
        let mut handle = ProcessHandle::Task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        assert!(handle.id().is_none());
        assert!(handle.exit_status().is_none());

        handle.terminate("abc", Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.exit_status().is_some());
    }
}
