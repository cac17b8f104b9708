//! Durable per-machine state
//!
//! The host environment owns one data directory per machine. This crate keeps
//! three things in it:
//!
//! - `created_networks`: newline-delimited uuids of networks this machine
//!   caused to be created, consulted at destroy time to decide ownership
//! - `pids/ssh_<port>.pid`: pid of the port-forward process for a host port
//! - `id`: uuid of the machine's domain

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::VmrigResult;

const CREATED_NETWORKS: &str = "created_networks";
const PIDS_DIR: &str = "pids";
const ID_FILE: &str = "id";

#[derive(Debug, Clone)]
pub struct MachineDataDir {
    root: PathBuf,
}

impl MachineDataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn created_networks_path(&self) -> PathBuf {
        self.root.join(CREATED_NETWORKS)
    }

    pub fn pid_path(&self, host_port: u16) -> PathBuf {
        self.root
            .join(PIDS_DIR)
            .join(format!("ssh_{}.pid", host_port))
    }

    /// Append a network uuid to the ledger
    pub async fn record_created_network(&self, uuid: &str) -> VmrigResult<()> {
        fs::create_dir_all(&self.root).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.created_networks_path())
            .await?;
        file.write_all(format!("{}\n", uuid).as_bytes()).await?;
        file.flush().await?;
        debug!("Recorded created network {}", uuid);
        Ok(())
    }

    /// Uuids in the ledger, in creation order
    pub async fn created_networks(&self) -> VmrigResult<Vec<String>> {
        match fs::read_to_string(self.created_networks_path()).await {
            Ok(contents) => Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a uuid from the ledger; the file is removed once empty
    pub async fn remove_created_network(&self, uuid: &str) -> VmrigResult<()> {
        let remaining: Vec<String> = self
            .created_networks()
            .await?
            .into_iter()
            .filter(|entry| entry != uuid)
            .collect();

        let path = self.created_networks_path();
        if remaining.is_empty() {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            let mut contents = remaining.join("\n");
            contents.push('\n');
            fs::write(&path, contents).await?;
        }
        Ok(())
    }

    pub async fn write_pid(&self, host_port: u16, pid: u32) -> VmrigResult<()> {
        let path = self.pid_path(host_port);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, pid.to_string()).await?;
        Ok(())
    }

    /// Recorded port-forward pids keyed by host port
    pub async fn pids(&self) -> VmrigResult<Vec<(u16, u32)>> {
        let dir = self.root.join(PIDS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(port) = file_name
                .to_str()
                .and_then(|name| name.strip_prefix("ssh_"))
                .and_then(|name| name.strip_suffix(".pid"))
                .and_then(|port| port.parse::<u16>().ok())
            else {
                continue;
            };
            let contents = fs::read_to_string(entry.path()).await?;
            if let Ok(pid) = contents.trim().parse::<u32>() {
                pids.push((port, pid));
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    pub async fn remove_pid(&self, host_port: u16) -> VmrigResult<()> {
        match fs::remove_file(self.pid_path(host_port)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_id(&self) -> VmrigResult<Option<String>> {
        match fs::read_to_string(self.root.join(ID_FILE)).await {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_id(&self, id: &str) -> VmrigResult<()> {
        fs::create_dir_all(&self.root).await?;
        fs::write(self.root.join(ID_FILE), id).await?;
        Ok(())
    }

    pub async fn clear_id(&self) -> VmrigResult<()> {
        match fs::remove_file(self.root.join(ID_FILE)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
