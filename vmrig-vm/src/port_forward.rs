//! Host-to-guest port forwarding through `ssh -L`
//!
//! One background ssh process per forwarded host port. Its pid is written to
//! the machine data directory so a later run can tear it down.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use vmrig_core::config::{ConnectionSettings, SshSettings};
use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::machine_data::MachineDataDir;
use vmrig_core::types::ForwardedPort;

/// Host ports below this need root to bind
const PRIVILEGED_PORT_LIMIT: u16 = 1024;

/// Trait for executing commands - allows mocking in tests
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, std::io::Error>;

    /// Start a detached process and return it with its pid
    async fn spawn(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<(Option<Child>, u32), std::io::Error>;

    /// Send SIGTERM; a process that is already gone is not an error
    async fn kill(&self, pid: u32) -> Result<(), std::io::Error>;
}

pub struct CommandOutput {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Default command executor that runs real commands
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, std::io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await?;

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<(Option<Child>, u32), std::io::Error> {
        let mut cmd = Command::new(program);
        // The process outlives this run, so it must not hold our pipes.
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "Failed to get process ID")
        })?;

        Ok((Some(child), pid))
    }

    async fn kill(&self, pid: u32) -> Result<(), std::io::Error> {
        let pid = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }
}

/// Where the forwarding ssh process connects to
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub address: Ipv4Addr,
    pub settings: SshSettings,
    /// Hypervisor host to jump through for remote connections
    pub jump_host: Option<String>,
}

impl SshTarget {
    pub fn new(address: Ipv4Addr, ssh: &SshSettings, connection: &ConnectionSettings) -> Self {
        let jump_host = connection.host.as_ref().map(|host| match &connection.username {
            Some(user) => format!("{}@{}", user, host),
            None => host.clone(),
        });
        Self {
            address,
            settings: ssh.clone(),
            jump_host,
        }
    }
}

/// Build the `ssh -N -L` argument list for one forwarded port
pub fn ssh_args(target: &SshTarget, port: &ForwardedPort) -> Vec<String> {
    let guest_ip = port
        .guest_ip
        .clone()
        .unwrap_or_else(|| "localhost".to_string());

    let mut args = vec![
        "-o".to_string(),
        format!("User={}", target.settings.username),
        "-o".to_string(),
        format!("Port={}", target.settings.port),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=5".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
    ];
    if let Some(key) = &target.settings.private_key_path {
        args.push("-i".to_string());
        args.push(key.to_string_lossy().into_owned());
    }
    if let Some(jump) = &target.jump_host {
        args.push("-J".to_string());
        args.push(jump.clone());
    }
    if port.gateway_ports {
        args.push("-g".to_string());
    }
    args.push("-L".to_string());
    args.push(format!(
        "{}:{}:{}:{}",
        port.host_ip, port.host_port, guest_ip, port.guest_port
    ));
    args.push("-N".to_string());
    args.push(target.address.to_string());
    args
}

/// Starts and stops the forwarding processes of one machine
pub struct PortForwarder {
    executor: Arc<dyn CommandExecutor>,
}

impl PortForwarder {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Spawn a forwarding process and record its pid
    pub async fn forward(
        &self,
        data: &MachineDataDir,
        target: &SshTarget,
        port: &ForwardedPort,
    ) -> VmrigResult<u32> {
        let args = ssh_args(target, port);
        let mut argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let program = if port.host_port < PRIVILEGED_PORT_LIMIT {
            argv.insert(0, "ssh");
            "sudo"
        } else {
            "ssh"
        };

        info!(
            "Forwarding host {}:{} to guest port {}",
            port.host_ip, port.host_port, port.guest_port
        );
        let (_child, pid) = self
            .executor
            .spawn(program, &argv, None)
            .await
            .map_err(|e| {
                VmrigError::internal(format!(
                    "failed to start port forward for host port {}: {}",
                    port.host_port, e
                ))
            })?;
        data.write_pid(port.host_port, pid).await?;
        debug!("Port forward for {} running as pid {}", port.host_port, pid);
        Ok(pid)
    }

    /// Stop every recorded forwarding process and drop its pid file.
    ///
    /// A pid that now belongs to something other than ssh is left alone.
    pub async fn clear(&self, data: &MachineDataDir) -> VmrigResult<usize> {
        let pids = data.pids().await?;
        for (port, pid) in &pids {
            if self.is_ssh_process(*pid).await {
                debug!("Stopping port forward for {} (pid {})", port, pid);
                if let Err(e) = self.executor.kill(*pid).await {
                    warn!("Failed to stop port forward pid {}: {}", pid, e);
                }
            } else {
                debug!("Pid {} for port {} is not an ssh process", pid, port);
            }
            data.remove_pid(*port).await?;
        }
        Ok(pids.len())
    }

    async fn is_ssh_process(&self, pid: u32) -> bool {
        let pid = pid.to_string();
        match self
            .executor
            .execute("ps", &["-o", "command=", "-p", pid.as_str()], None)
            .await
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).contains("ssh")
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Cannot inspect pid {}: {}", pid, e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Mock command executor for testing
    #[derive(Default)]
    pub struct MockCommandExecutor {
        next_pid: AtomicU32,
        pub spawned: Mutex<Vec<(String, Vec<String>)>>,
        pub killed: Mutex<Vec<u32>>,
    }

    #[async_trait::async_trait]
    impl CommandExecutor for MockCommandExecutor {
        /// Answers `ps` for spawned pids that were not killed yet
        async fn execute(
            &self,
            _program: &str,
            args: &[&str],
            _cwd: Option<&Path>,
        ) -> Result<CommandOutput, std::io::Error> {
            let pid: Option<u32> = args.last().and_then(|a| a.parse().ok());
            let alive = pid.map_or(false, |pid| {
                pid >= 1000
                    && pid < 1000 + self.next_pid.load(Ordering::SeqCst)
                    && !self.killed.lock().contains(&pid)
            });
            Ok(CommandOutput {
                status: std::process::ExitStatus::from_raw(if alive { 0 } else { 1 << 8 }),
                stdout: if alive { b"ssh -N\n".to_vec() } else { vec![] },
                stderr: vec![],
            })
        }

        async fn spawn(
            &self,
            program: &str,
            args: &[&str],
            _cwd: Option<&Path>,
        ) -> Result<(Option<Child>, u32), std::io::Error> {
            self.spawned.lock().push((
                program.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
            ));
            Ok((None, 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst)))
        }

        async fn kill(&self, pid: u32) -> Result<(), std::io::Error> {
            self.killed.lock().push(pid);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockCommandExecutor;
    use super::*;
    use tempfile::TempDir;

    fn target() -> SshTarget {
        SshTarget::new(
            Ipv4Addr::new(192, 168, 121, 10),
            &SshSettings::default(),
            &ConnectionSettings::default(),
        )
    }

    fn port(host_port: u16, guest_port: u16) -> ForwardedPort {
        ForwardedPort {
            host_port,
            guest_port,
            ..Default::default()
        }
    }

    #[test]
    fn test_ssh_args() {
        let args = ssh_args(&target(), &port(8080, 80));
        assert!(args.contains(&"User=vagrant".to_string()));
        assert!(args.contains(&"127.0.0.1:8080:localhost:80".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("192.168.121.10"));
        assert!(!args.contains(&"-J".to_string()));
    }

    #[test]
    fn test_remote_connection_jumps_through_host() {
        let connection = ConnectionSettings {
            host: Some("hv1".to_string()),
            username: Some("root".to_string()),
            ..Default::default()
        };
        let target = SshTarget::new(
            Ipv4Addr::new(192, 168, 121, 10),
            &SshSettings::default(),
            &connection,
        );
        let args = ssh_args(&target, &port(8080, 80));
        let jump = args.iter().position(|a| a == "-J").unwrap();
        assert_eq!(args[jump + 1], "root@hv1");
    }

    #[tokio::test]
    async fn test_forward_and_clear() {
        let dir = TempDir::new().unwrap();
        let data = MachineDataDir::new(dir.path());
        let executor = Arc::new(MockCommandExecutor::default());
        let forwarder = PortForwarder::new(executor.clone());

        let pid = forwarder.forward(&data, &target(), &port(8080, 80)).await.unwrap();
        forwarder.forward(&data, &target(), &port(80, 80)).await.unwrap();
        assert_eq!(data.pids().await.unwrap().len(), 2);

        {
            let spawned = executor.spawned.lock();
            assert_eq!(spawned[0].0, "ssh");
            assert_eq!(spawned[1].0, "sudo");
            assert_eq!(spawned[1].1[0], "ssh");
        }

        assert_eq!(forwarder.clear(&data).await.unwrap(), 2);
        assert!(executor.killed.lock().contains(&pid));
        assert!(data.pids().await.unwrap().is_empty());
    }
}
