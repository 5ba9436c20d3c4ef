//! Send-history ledger used to avoid messaging the same recipient with the
//! same message variant inside the cooldown window.
//!
//! The ledger is append-only CSV (`timestamp,recipient,message_variant_key`).
//! Older rows for the same pair may remain; the most recent one wins.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};

use crate::ledger::{append_row, split_row};

pub const HISTORY_HEADER: [&str; 3] = ["timestamp", "recipient", "message_variant_key"];

type HistoryKey = (String, String);

pub struct SendHistoryStore {
    path: PathBuf,
    entries: Mutex<HashMap<HistoryKey, DateTime<Utc>>>,
}

impl SendHistoryStore {
    /// Open the ledger at `path`, loading every parseable row.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = load_ledger(&path)?;
        tracing::info!(
            "Loaded {} send-history entries from {:?}",
            entries.len(),
            path
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<HistoryKey, DateTime<Utc>>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Send history lock poisoned: {}", e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, recipient: &str, variant_key: &str) -> Result<()> {
        self.record_at(recipient, variant_key, Utc::now())
    }

    /// Append a ledger row and update the in-memory view in the same step.
    pub fn record_at(&self, recipient: &str, variant_key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut entries = self.lock_entries()?;
        append_row(
            &self.path,
            &HISTORY_HEADER,
            &[&at.to_rfc3339(), recipient, variant_key],
        )?;
        let key = (recipient.to_string(), variant_key.to_string());
        let slot = entries.entry(key).or_insert(at);
        if at > *slot {
            *slot = at;
        }
        Ok(())
    }

    pub fn last_sent(&self, recipient: &str, variant_key: &str) -> Option<DateTime<Utc>> {
        let entries = self.lock_entries().ok()?;
        entries
            .get(&(recipient.to_string(), variant_key.to_string()))
            .copied()
    }

    pub fn is_within_cooldown(&self, recipient: &str, variant_key: &str, window: Duration) -> bool {
        self.is_within_cooldown_at(recipient, variant_key, window, Utc::now())
    }

    /// True iff a prior send exists and `now - last_sent < window`.
    pub fn is_within_cooldown_at(
        &self,
        recipient: &str,
        variant_key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        match self.last_sent(recipient, variant_key) {
            Some(sent_at) => now - sent_at < window,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_ledger(path: &Path) -> Result<HashMap<HistoryKey, DateTime<Utc>>> {
    let raw = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read history {:?}", path)),
    };

    let mut entries: HashMap<HistoryKey, DateTime<Utc>> = HashMap::new();
    let mut skipped = 0usize;
    for line in raw.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_row(line);
        let parsed = match fields.as_slice() {
            [ts, recipient, key, ..] if !recipient.is_empty() && !key.is_empty() => {
                parse_timestamp(ts).map(|at| ((recipient.clone(), key.clone()), at))
            }
            _ => None,
        };
        match parsed {
            Some((key, at)) => {
                let slot = entries.entry(key).or_insert(at);
                if at > *slot {
                    *slot = at;
                }
            }
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::warn!("Skipped {} malformed rows in {:?}", skipped, path);
    }
    Ok(entries)
}

/// ISO-8601 with offset, or a naive timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
