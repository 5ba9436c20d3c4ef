use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;

use crate::ledger::append_row;

pub const SEND_LOG_HEADER: [&str; 6] = ["timestamp", "recipient", "flow", "identity", "result", "error"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    Failed,
}

impl SendResult {
    pub fn as_str(self) -> &'static str {
        match self {
            SendResult::Ok => "OK",
            SendResult::Failed => "FAILED",
        }
    }
}

/// Append-only log with one row per send attempt.
pub struct SendOutcomeLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SendOutcomeLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        recipient: &str,
        flow: &str,
        identity: &str,
        result: SendResult,
        error: &str,
    ) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("Send log lock poisoned: {}", e))?;
        let timestamp = Utc::now().to_rfc3339();
        append_row(
            &self.path,
            &SEND_LOG_HEADER,
            &[&timestamp, recipient, flow, identity, result.as_str(), error],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::split_row;

    #[test]
    fn rows_follow_header() {
        let dir = tempfile::tempdir().unwrap();
        let log = SendOutcomeLog::new(dir.path().join("logs").join("send_log.csv"));
        log.append("@alice", "AUTO", "sender_a", SendResult::Ok, "")
            .unwrap();
        log.append("@bob_b", "physics", "sender_b", SendResult::Failed, "flood wait, 30s")
            .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,recipient,flow,identity,result,error");

        let failed = split_row(lines[2]);
        assert_eq!(failed[1], "@bob_b");
        assert_eq!(failed[4], "FAILED");
        assert_eq!(failed[5], "flood wait, 30s");
    }
}
