//! File-backed recipient queue.
//!
//! One token per line, UTF-8, order is send priority. The same file is
//! appended to by ingestion (possibly another process) while a dispatcher
//! removes and reorders entries, so:
//! - every mutation holds an exclusive advisory lock on `<file>.lock`
//!   and re-reads the file under that lock before deciding anything;
//! - appends are in-place appends, never rewrites;
//! - rewrites go to `<file>.tmp` and are renamed over the original, so a
//!   reader never observes a half-written file.
//!
//! Writers other than the dispatcher only ever append.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::ledger::ensure_parent_dir;

#[derive(Debug, Clone)]
pub struct RecipientQueue {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Held for the duration of a read-modify-write.
struct QueueLock {
    file: File,
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl RecipientQueue {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock_path = sidecar(&path, "lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current queue contents, blank lines stripped and duplicates collapsed
    /// to their first occurrence. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<String>> {
        read_unique(&self.path)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.load()?.is_empty())
    }

    /// Append `recipient` unless it is already queued. Returns true when the
    /// line was written.
    pub fn append_if_absent(&self, recipient: &str) -> Result<bool> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Ok(false);
        }

        let _guard = self.lock()?;
        let raw = read_raw(&self.path)?;
        if raw.lines().any(|l| l.trim() == recipient) {
            return Ok(false);
        }

        let mut line = String::new();
        if !raw.is_empty() && !raw.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(recipient);
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open queue {:?} for append", self.path))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to queue {:?}", self.path))?;
        file.sync_data().ok();
        Ok(true)
    }

    /// Rewrite the queue without `recipient`. Absent recipients are a no-op;
    /// the return value says whether anything was removed.
    pub fn remove(&self, recipient: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let lines = read_unique(&self.path)?;
        if !lines.iter().any(|l| l == recipient) {
            return Ok(false);
        }
        let kept: Vec<String> = lines.into_iter().filter(|l| l != recipient).collect();
        self.write_atomic(&kept)?;
        Ok(true)
    }

    /// Move the first occurrence of `recipient` to the end of the queue.
    /// Returns false when it is not queued.
    pub fn move_to_end(&self, recipient: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let mut lines = read_unique(&self.path)?;
        let Some(pos) = lines.iter().position(|l| l == recipient) else {
            return Ok(false);
        };
        let line = lines.remove(pos);
        lines.push(line);
        self.write_atomic(&lines)?;
        Ok(true)
    }

    /// Run a queue operation on the blocking pool. The lock wait and the
    /// file I/O then never stall a runtime worker.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&RecipientQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .with_context(|| format!("Queue task for {:?} did not complete", self.path))?
    }

    fn lock(&self) -> Result<QueueLock> {
        ensure_parent_dir(&self.lock_path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open queue lock {:?}", self.lock_path))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock queue {:?}", self.path))?;
        Ok(QueueLock { file })
    }

    fn write_atomic(&self, lines: &[String]) -> Result<()> {
        let tmp = sidecar(&self.path, "tmp");
        let mut body = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }

        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("Failed to create {:?}", tmp))?;
            file.write_all(body.as_bytes())
                .with_context(|| format!("Failed to write {:?}", tmp))?;
            file.sync_all().ok();
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace queue {:?}", self.path))?;
        Ok(())
    }
}

fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn read_raw(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read queue {:?}", path)),
    }
}

fn read_unique(path: &Path) -> Result<Vec<String>> {
    let raw = read_raw(path)?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if seen.insert(line.to_string()) {
            out.push(line.to_string());
        }
    }
    Ok(out)
}
