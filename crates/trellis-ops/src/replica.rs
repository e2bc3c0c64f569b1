//! Pushing the store to a replica.
//!
//! The store is plain files, so replication is a plain file transfer. The
//! default transport shells out to rsync; peers only ever add or update
//! files, so the transfer runs without deletion. Devices keep writing while
//! the transfer runs, which rsync reports as exit code 24 (files vanished
//! mid-transfer). That is routine here, not a failure.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::{Error, Result};
use crate::sweep::Sweep;

/// rsync's exit code for source files that vanished during the transfer.
pub const VANISHED_FILES_EXIT: i32 = 24;

/// How a replication pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOutcome {
    /// Everything transferred cleanly.
    Synced,
    /// Transferred, but some files changed or vanished mid-transfer. The
    /// next pass picks them up.
    SyncedWithChurn,
}

/// Moves the store's files to a replica.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn replicate(&self) -> Result<ReplicaOutcome>;
}

/// Transport that shells out to rsync.
pub struct RsyncTransport {
    source: PathBuf,
    destination: String,
    rsh: Option<String>,
}

impl RsyncTransport {
    /// `destination` is anything rsync accepts, typically `host:/path`.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            rsh: None,
        }
    }

    /// Use a custom remote shell, e.g. `ssh -p 2222`.
    pub fn with_rsh(mut self, rsh: impl Into<String>) -> Self {
        self.rsh = Some(rsh.into());
        self
    }

    fn arguments(&self) -> Vec<String> {
        let mut args = vec!["-az".to_string()];
        if let Some(rsh) = &self.rsh {
            args.push(format!("--rsh={}", rsh));
        }
        // Trailing slash: transfer the store's contents, not the directory.
        args.push(format!("{}/", self.source.display()));
        args.push(self.destination.clone());
        args
    }
}

#[async_trait]
impl ReplicaTransport for RsyncTransport {
    async fn replicate(&self) -> Result<ReplicaOutcome> {
        let output = Command::new("rsync").args(self.arguments()).output().await?;
        classify_exit(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        )
    }
}

fn classify_exit(code: Option<i32>, stderr: &str) -> Result<ReplicaOutcome> {
    match code {
        Some(0) => Ok(ReplicaOutcome::Synced),
        Some(VANISHED_FILES_EXIT) => Ok(ReplicaOutcome::SyncedWithChurn),
        Some(other) => Err(Error::Transport(format!(
            "rsync exited with status {}: {}",
            other,
            stderr.trim()
        ))),
        None => Err(Error::Transport("rsync was killed by a signal".to_string())),
    }
}

/// Pushes the store to its replica on a fixed cadence.
pub struct ReplicaSweep {
    transport: Arc<dyn ReplicaTransport>,
}

impl ReplicaSweep {
    pub fn new(transport: Arc<dyn ReplicaTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Sweep for ReplicaSweep {
    fn name(&self) -> &str {
        "replica"
    }

    async fn run(&self) -> Result<()> {
        match self.transport.replicate().await? {
            ReplicaOutcome::Synced => info!("Replica synchronized"),
            ReplicaOutcome::SyncedWithChurn => {
                info!("Replica synchronized; some files changed mid-transfer")
            }
        }
        Ok(())
    }
}
