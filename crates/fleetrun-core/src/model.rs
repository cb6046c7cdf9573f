//! Data model for batches, hosts, and execution policies.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch identifier.
pub type BatchId = Uuid;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Secret half of a host credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSecret {
    /// Plain password authentication.
    Password(String),
    /// Path to a private key file.
    PrivateKeyPath(PathBuf),
    /// Defer to an external key agent.
    Agent,
}

/// Credential material for one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMaterial {
    /// Login user on the remote host.
    pub username: String,
    /// How to authenticate as that user.
    pub secret: AuthSecret,
}

/// One resolved target host. Immutable once resolved for a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostTarget {
    /// Stable host identifier, unique within a batch.
    pub host_id: String,
    /// Network address (hostname or IP).
    pub address: String,
    /// Remote shell port.
    pub port: u16,
    /// Credential material.
    pub auth: AuthMaterial,
}

impl HostTarget {
    /// Key under which sessions to this host are cached in the pool.
    ///
    /// Two targets with the same user, address, and port share sessions.
    #[must_use]
    pub fn pool_key(&self) -> String {
        format!("{}@{}:{}", self.auth.username, self.address, self.port)
    }
}

/// Whether batch hosts run concurrently or one-by-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Parallel,
    Sequential,
}

impl Topology {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parallel" => Some(Self::Parallel),
            "sequential" => Some(Self::Sequential),
            _ => None,
        }
    }
}

/// How one batch is executed. Immutable, supplied at submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Parallel or sequential fan-out.
    pub topology: Topology,
    /// Wall-clock limit for a single command execution.
    pub timeout_secs: u64,
    /// Retries after the first attempt; total attempts = `retry_count + 1`.
    pub retry_count: u32,
    /// Delay between attempts on the same host.
    pub retry_delay_secs: u64,
    /// Sequential: skip remaining hosts after a terminal failure.
    /// Parallel: stop siblings after the first terminal failure.
    pub stop_on_first_error: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            topology: Topology::Parallel,
            timeout_secs: 60,
            retry_count: 0,
            retry_delay_secs: 5,
            stop_on_first_error: false,
        }
    }
}

impl ExecutionPolicy {
    /// Total attempts a host may make, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.retry_count + 1
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Batch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created but not yet driving hosts.
    Pending,
    /// Hosts are executing.
    Running,
    /// Terminal: at least one host completed, or none failed.
    Completed,
    /// Terminal: every launched host failed.
    Failed,
    /// Terminal: cancelled by the caller.
    Cancelled,
}

impl BatchStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Per-host status within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl HostStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One command dispatched to a set of target hosts under one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecution {
    pub id: BatchId,
    pub command: String,
    pub policy: ExecutionPolicy,
    /// Host ids in submission order.
    pub target_host_ids: Vec<String>,
    pub status: BatchStatus,
    pub total_hosts: u32,
    pub completed_hosts: u32,
    pub failed_hosts: u32,
    /// Epoch millis; set when the batch starts driving hosts.
    pub started_at: Option<i64>,
    /// Epoch millis; set when the batch goes terminal.
    pub finished_at: Option<i64>,
    pub created_at: i64,
}

/// Fields needed to create a batch record. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub command: String,
    pub policy: ExecutionPolicy,
    pub target_host_ids: Vec<String>,
}

/// Execution record for one host within one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResult {
    pub batch_id: BatchId,
    pub host_id: String,
    pub status: HostStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Attempts made so far; never exceeds `policy.retry_count + 1`.
    pub retry_attempt: u32,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<u64>,
    /// Last error observed, terminal or transient.
    pub error: Option<String>,
}

/// Captured output of one command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Partial update applied to a batch record. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct BatchPatch {
    pub status: Option<BatchStatus>,
    pub completed_hosts: Option<u32>,
    pub failed_hosts: Option<u32>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Partial update applied to a host result row. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct HostResultPatch {
    pub status: Option<HostStatus>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub retry_attempt: Option<u32>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_includes_user_address_port() {
        let target = HostTarget {
            host_id: "web-1".into(),
            address: "10.0.0.5".into(),
            port: 22,
            auth: AuthMaterial {
                username: "deploy".into(),
                secret: AuthSecret::Agent,
            },
        };
        assert_eq!(target.pool_key(), "deploy@10.0.0.5:22");
    }

    #[test]
    fn max_attempts_counts_first_attempt() {
        let policy = ExecutionPolicy {
            retry_count: 2,
            ..ExecutionPolicy::default()
        };
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(ExecutionPolicy::default().max_attempts(), 1);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!HostStatus::Running.is_terminal());
        assert!(HostStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Running,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchStatus::parse("bogus"), None);
    }

    #[test]
    fn statuses_serialize_snake_case() {
        let json = serde_json::to_string(&HostStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let json = serde_json::to_string(&Topology::Sequential).unwrap();
        assert_eq!(json, "\"sequential\"");
    }
}
