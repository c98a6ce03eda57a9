//! Snapshot persistence for monitor records and counters
//!
//! One JSON snapshot file holds every monitor record plus lifetime counters.
//! Writes are atomic (temp file, fsync, rename) and rotate timestamped
//! backups with a minimum inter-backup interval independent of save
//! frequency. Critical events flush immediately; everything else sets a
//! dirty flag drained by the periodic flusher.
//!
//! Runtime handles never reach the file: records serialize cleanly and the
//! scheduler rebuilds mutexes and deadlines on load.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::PersistenceError;
use crate::monitor::MonitorRecord;

/// Current snapshot schema. Version 1 predates `last_known_size`.
pub const SCHEMA_VERSION: u32 = 2;

fn schema_v1() -> u32 {
    1
}

/// Lifetime trading counters persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    #[serde(default)]
    pub stats_total_trades: u64,
    #[serde(default)]
    pub stats_total_wins: u64,
    #[serde(default)]
    pub stats_total_losses: u64,
    #[serde(default)]
    pub stats_conservative_trades: u64,
}

/// The full persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    #[serde(default = "schema_v1")]
    pub schema_version: u32,
    #[serde(default)]
    pub monitors: BTreeMap<String, MonitorRecord>,
    #[serde(default)]
    pub counters: Counters,
    /// Epoch seconds of the last rotated backup.
    #[serde(default)]
    pub last_backup_ts: i64,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        EngineSnapshot {
            schema_version: SCHEMA_VERSION,
            monitors: BTreeMap::new(),
            counters: Counters::default(),
            last_backup_ts: 0,
        }
    }
}

/// Atomic snapshot store with backup rotation and a dirty-flag batching
/// layer.
#[derive(Debug)]
pub struct PersistenceStore {
    path: PathBuf,
    max_backups: usize,
    backup_interval: Duration,
    /// Latest snapshot waiting for a batched flush.
    pending: Mutex<Option<EngineSnapshot>>,
    dirty: AtomicBool,
    degraded: AtomicBool,
    /// Epoch seconds of the last rotated backup; survives snapshot rebuilds.
    last_backup_ts: AtomicI64,
}

impl PersistenceStore {
    pub fn new(path: impl AsRef<Path>, max_backups: usize, backup_interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_backups,
            backup_interval,
            pending: Mutex::new(None),
            dirty: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            last_backup_ts: AtomicI64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a save has failed past its retry and the engine is running
    /// on in-memory state only.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Load the snapshot, tolerating a missing file and older schemas.
    pub fn load(&self) -> Result<EngineSnapshot, PersistenceError> {
        if !self.path.exists() {
            debug!("no snapshot at {}; starting fresh", self.path.display());
            return Ok(EngineSnapshot::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        let mut snapshot: EngineSnapshot = serde_json::from_str(&contents)?;

        if snapshot.schema_version > SCHEMA_VERSION {
            return Err(PersistenceError::SchemaTooNew {
                found: snapshot.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        if snapshot.schema_version < 2 {
            migrate_v1(&mut snapshot);
        }
        snapshot.schema_version = SCHEMA_VERSION;
        self.last_backup_ts
            .store(snapshot.last_backup_ts, Ordering::Relaxed);

        info!(
            monitors = snapshot.monitors.len(),
            "loaded snapshot from {}",
            self.path.display()
        );
        Ok(snapshot)
    }

    /// Accept a new state. Critical saves hit disk now (one retry, then the
    /// degraded flag); non-critical saves are batched for the flusher.
    pub fn commit(&self, snapshot: EngineSnapshot, critical: bool) {
        if critical {
            self.write_with_retry(snapshot);
        } else {
            *self.pending.lock().expect("persistence pending poisoned") = Some(snapshot);
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Flush batched state if any. Called by the periodic flusher and at
    /// shutdown.
    pub fn flush(&self) {
        let pending = self
            .pending
            .lock()
            .expect("persistence pending poisoned")
            .take();
        if let Some(snapshot) = pending {
            self.write_with_retry(snapshot);
        }
        self.dirty.store(false, Ordering::Relaxed);
    }

    fn write_with_retry(&self, mut snapshot: EngineSnapshot) {
        match self.write_once(&mut snapshot) {
            Ok(()) => {
                self.dirty.store(false, Ordering::Relaxed);
                self.degraded.store(false, Ordering::Relaxed);
            }
            Err(first) => {
                warn!("snapshot save failed, retrying once: {}", first);
                if let Err(second) = self.write_once(&mut snapshot) {
                    error!(
                        "snapshot save failed twice, continuing in-memory: {}",
                        second
                    );
                    self.degraded.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Atomic write: temp file in the target directory, fsync, rename.
    fn write_once(&self, snapshot: &mut EngineSnapshot) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        self.rotate_backup(snapshot)?;

        snapshot.schema_version = SCHEMA_VERSION;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(serde_json::to_string_pretty(snapshot)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!("snapshot written to {}", self.path.display());
        Ok(())
    }

    /// Copy the previous snapshot aside when the inter-backup interval has
    /// elapsed, keeping at most `max_backups` copies.
    fn rotate_backup(&self, snapshot: &mut EngineSnapshot) -> Result<(), PersistenceError> {
        if self.max_backups == 0 || !self.path.exists() {
            snapshot.last_backup_ts = self.last_backup_ts.load(Ordering::Relaxed);
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let last = self.last_backup_ts.load(Ordering::Relaxed);
        if now - last < self.backup_interval.as_secs() as i64 {
            snapshot.last_backup_ts = last;
            return Ok(());
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let backup_path = self.path.with_extension(format!("json.{}.bak", stamp));
        fs::copy(&self.path, &backup_path)?;
        self.last_backup_ts.store(now, Ordering::Relaxed);
        snapshot.last_backup_ts = now;
        debug!("rotated backup {}", backup_path.display());

        self.prune_backups()?;
        Ok(())
    }

    fn prune_backups(&self) -> Result<(), PersistenceError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();

        let mut backups: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| name.starts_with(&format!("{}.json.", stem)) && name.ends_with(".bak"))
                    .unwrap_or(false)
            })
            .collect();

        // Timestamp format sorts lexicographically; oldest first.
        backups.sort();
        while backups.len() > self.max_backups {
            let oldest = backups.remove(0);
            if let Err(e) = fs::remove_file(&oldest) {
                warn!("failed to prune backup {}: {}", oldest.display(), e);
            }
        }
        Ok(())
    }
}

/// v1 snapshots predate delta tracking: seed `last_known_size` from the
/// observed size so the first pass after upgrade sees no spurious delta.
fn migrate_v1(snapshot: &mut EngineSnapshot) {
    for record in snapshot.monitors.values_mut() {
        if record.last_known_size.is_zero() && !record.current_size.is_zero() {
            record.last_known_size = record.current_size;
        }
    }
    info!("migrated snapshot schema v1 -> v{}", SCHEMA_VERSION);
}
