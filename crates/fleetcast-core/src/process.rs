//! Process definitions replicated through the cluster.
//!
//! A process describes one external encoder invocation: its inputs and
//! outputs, reconnect behavior, and resource limits. The cluster stores
//! these definitions in the replicated state machine; the per-node process
//! supervisor turns them into running encoder processes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of a process: the `(id, domain)` pair, unique cluster-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId {
    /// Process id.
    pub id: String,
    /// IAM domain the process belongs to.
    pub domain: String,
}

impl ProcessId {
    /// Creates a process id.
    #[must_use]
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self { id: id.into(), domain: domain.into() }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.domain)
    }
}

/// Cleanup rule attached to a process output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupRule {
    /// Glob pattern of files the rule applies to.
    pub pattern: String,
    /// Keep at most this many files, 0 = unlimited.
    pub max_files: u32,
    /// Remove files older than this many seconds, 0 = unlimited.
    pub max_file_age_seconds: u32,
    /// Also remove matching files when the process is deleted.
    pub purge_on_delete: bool,
}

/// One input or output of an encoder invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigIo {
    /// IO identifier.
    pub id: String,
    /// Source or sink address.
    pub address: String,
    /// Raw encoder options for this IO.
    #[serde(default)]
    pub options: Vec<String>,
    /// Cleanup rules, outputs only.
    #[serde(default)]
    pub cleanup: Vec<CleanupRule>,
}

/// Full definition of an encoder process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Process id.
    pub id: String,
    /// IAM domain the process belongs to.
    #[serde(default)]
    pub domain: String,
    /// Free-form reference, e.g. the stream this process serves.
    #[serde(default)]
    pub reference: String,
    /// Inputs.
    #[serde(default)]
    pub input: Vec<ConfigIo>,
    /// Outputs.
    #[serde(default)]
    pub output: Vec<ConfigIo>,
    /// Global encoder options.
    #[serde(default)]
    pub options: Vec<String>,
    /// Restart the process when it exits.
    #[serde(default)]
    pub reconnect: bool,
    /// Seconds to wait before a reconnect.
    #[serde(default)]
    pub reconnect_delay_seconds: u64,
    /// Start the process as soon as it is added.
    #[serde(default)]
    pub autostart: bool,
    /// Consider the process stale after this many seconds without progress.
    #[serde(default)]
    pub stale_timeout_seconds: u64,
    /// CPU limit in percent of one core, 0 = unlimited.
    #[serde(default)]
    pub limit_cpu: f64,
    /// Memory limit in bytes, 0 = unlimited.
    #[serde(default)]
    pub limit_memory: u64,
    /// Seconds a limit may be exceeded before the supervisor intervenes.
    #[serde(default)]
    pub limit_wait_for_seconds: u64,
}

impl ProcessConfig {
    /// Returns the `(id, domain)` identity of this config.
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        ProcessId::new(self.id.clone(), self.domain.clone())
    }

    /// Returns a content hash over the canonical JSON form.
    ///
    /// Two configs with equal hashes are treated as the same definition;
    /// replacing a config with a hash-equal one is a no-op in the store.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        let data = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&data);
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProcessConfig {
        ProcessConfig {
            id: "p1".to_string(),
            domain: "d".to_string(),
            reference: "stream-1".to_string(),
            input: vec![ConfigIo {
                id: "in".to_string(),
                address: "rtmp://127.0.0.1/live/stream-1".to_string(),
                ..Default::default()
            }],
            output: vec![ConfigIo {
                id: "out".to_string(),
                address: "/memfs/stream-1.m3u8".to_string(),
                options: vec!["-codec".to_string(), "copy".to_string()],
                cleanup: vec![CleanupRule {
                    pattern: "memfs:/stream-1*.ts".to_string(),
                    max_files: 12,
                    ..Default::default()
                }],
            }],
            autostart: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_process_id_display() {
        assert_eq!(ProcessId::new("p1", "d").to_string(), "p1@d");
    }

    #[test]
    fn test_hash_stable() {
        let a = sample();
        let b = sample();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_changes_with_config() {
        let a = sample();
        let mut b = sample();
        b.stale_timeout_seconds = 30;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_serde_round_trip() {
        let cfg = sample();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ProcessConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
