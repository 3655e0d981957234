//! The Capacity Broker (C8): a cooperative, cross-instance limit on
//! concurrently running nodes for one shared repository.
//!
//! Leases live in `<workspace_root>/.orchestrator/capacity.json`, guarded by
//! an `fs4` advisory file lock so multiple orchestrator processes sharing a
//! repo never oversubscribe the cap. A lease that isn't renewed within
//! `lease_ttl` is treated as abandoned and reclaimed by the next acquirer.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LeaseFile {
    leases: BTreeMap<Uuid, DateTime<Utc>>,
}

impl Default for LeaseFile {
    fn default() -> Self {
        Self { leases: BTreeMap::new() }
    }
}

/// A held capacity slot. Dropping it does not release the lease — callers
/// must call [`CapacityBroker::release`] explicitly, since release needs
/// the broker to take the file lock again.
#[derive(Clone, Copy, Debug)]
pub struct Lease {
    id: Uuid,
}

impl Lease {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }
}

/// A cooperative cross-instance capacity limiter backed by a locked JSON
/// file.
pub struct CapacityBroker {
    path: PathBuf,
    global_cap: u32,
    lease_ttl: Duration,
}

impl CapacityBroker {
    #[must_use]
    pub fn new(workspace_root: &Path, global_cap: u32, lease_ttl: Duration) -> Self {
        Self { path: workspace_root.join(".orchestrator").join("capacity.json"), global_cap, lease_ttl }
    }

    /// Attempt to acquire one slot. Returns `Ok(None)` if the cap is
    /// currently exhausted (not an error: the scheduler retries later).
    ///
    /// # Errors
    /// Returns an error if the lease file cannot be locked, read, or written.
    pub fn try_acquire(&self) -> Result<Option<Lease>> {
        let mut file = self.open_locked()?;
        let mut leases = read_leases(&mut file)?;
        reap_stale(&mut leases, self.lease_ttl);

        if leases.leases.len() >= self.global_cap as usize {
            FileExt::unlock(&file).map_err(io_err)?;
            return Ok(None);
        }

        let id = Uuid::new_v4();
        leases.leases.insert(id, Utc::now());
        write_leases(&mut file, &leases)?;
        FileExt::unlock(&file).map_err(io_err)?;
        Ok(Some(Lease { id }))
    }

    /// Renew a held lease's timestamp so it is not reclaimed as abandoned.
    ///
    /// # Errors
    /// Returns an error if the lease file cannot be locked, read, or written.
    pub fn renew(&self, lease: Lease) -> Result<()> {
        let mut file = self.open_locked()?;
        let mut leases = read_leases(&mut file)?;
        leases.leases.insert(lease.id, Utc::now());
        write_leases(&mut file, &leases)?;
        FileExt::unlock(&file).map_err(io_err)?;
        Ok(())
    }

    /// Release a held slot.
    ///
    /// # Errors
    /// Returns an error if the lease file cannot be locked, read, or written.
    pub fn release(&self, lease: Lease) -> Result<()> {
        let mut file = self.open_locked()?;
        let mut leases = read_leases(&mut file)?;
        leases.leases.remove(&lease.id);
        write_leases(&mut file, &leases)?;
        FileExt::unlock(&file).map_err(io_err)?;
        Ok(())
    }

    fn open_locked(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).read(true).write(true).open(&self.path)?;
        FileExt::lock_exclusive(&file).map_err(io_err)?;
        Ok(file)
    }
}

fn io_err(e: std::io::Error) -> OrchestratorError {
    OrchestratorError::Io(e)
}

fn read_leases(file: &mut File) -> Result<LeaseFile> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    if contents.trim().is_empty() {
        return Ok(LeaseFile::default());
    }
    serde_json::from_str(&contents)
        .map_err(|e| OrchestratorError::Internal { detail: format!("corrupt capacity lease file: {e}") })
}

fn write_leases(file: &mut File, leases: &LeaseFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(leases)
        .map_err(|e| OrchestratorError::Internal { detail: format!("failed to serialize leases: {e}") })?;
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(&json)?;
    file.flush()?;
    Ok(())
}

fn reap_stale(leases: &mut LeaseFile, ttl: Duration) {
    let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    leases.leases.retain(|_, renewed_at| *renewed_at >= cutoff);
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn acquires_up_to_cap_then_denies() {
        let dir = TempDir::new().unwrap();
        let broker = CapacityBroker::new(dir.path(), 2, Duration::from_secs(30));
        let a = broker.try_acquire().unwrap();
        let b = broker.try_acquire().unwrap();
        let c = broker.try_acquire().unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
    }

    #[test]
    fn release_frees_a_slot() {
        let dir = TempDir::new().unwrap();
        let broker = CapacityBroker::new(dir.path(), 1, Duration::from_secs(30));
        let lease = broker.try_acquire().unwrap().unwrap();
        assert!(broker.try_acquire().unwrap().is_none());
        broker.release(lease).unwrap();
        assert!(broker.try_acquire().unwrap().is_some());
    }

    #[test]
    fn stale_lease_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let broker = CapacityBroker::new(dir.path(), 1, Duration::from_millis(1));
        let _lease = broker.try_acquire().unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(broker.try_acquire().unwrap().is_some());
    }
}
