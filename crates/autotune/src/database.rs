//! Persistent cache of the best schedules found per task.

use anyhow::{Context, Result};
use schedforge_ir::ScheduleDesc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Schedules kept per task unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 10;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TuningRecord {
    pub schedule: ScheduleDesc,
    /// Measured latency in milliseconds.
    pub cost: f64,
    /// Seconds since the Unix epoch.
    pub recorded_at: u64,
}

/// What an insert did to a task's ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new schedule entered the ranking.
    Inserted,
    /// A known schedule got a lower cost.
    Improved,
    /// Known schedule with an equal or better recorded cost.
    Unchanged,
    /// Invalid cost, or worse than every entry of a full ranking.
    Rejected,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    tasks: BTreeMap<String, Vec<TuningRecord>>,
}

/// Task fingerprint to the `capacity` cheapest schedules, ascending by cost.
///
/// Only successful measurements are inserted. Equal costs keep insertion
/// order, so the earlier schedule ranks first.
#[derive(Debug)]
pub struct Database {
    capacity: usize,
    path: Option<PathBuf>,
    tasks: RwLock<BTreeMap<String, Vec<TuningRecord>>>,
}

impl Default for Database {
    fn default() -> Self {
        Self::in_memory(DEFAULT_CAPACITY)
    }
}

impl Database {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            path: None,
            tasks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open the store at `path`.
    ///
    /// A missing or unreadable store yields an empty database; the path is
    /// still used by [`Database::save`].
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let mut database = Self::in_memory(capacity);
        match Self::read_store(&path) {
            Ok(store) => {
                let mut tasks = BTreeMap::new();
                for (fingerprint, records) in store.tasks {
                    let records = database.sanitize(records);
                    if !records.is_empty() {
                        tasks.insert(fingerprint, records);
                    }
                }
                info!(path = %path.display(), tasks = tasks.len(), "loaded tuning database");
                database.tasks = RwLock::new(tasks);
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{:#}", err),
                    "starting with an empty tuning database"
                );
            }
        }
        database.path = Some(path);
        database
    }

    fn read_store(path: &Path) -> Result<StoreFile> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let store: StoreFile = serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        anyhow::ensure!(
            store.version == STORE_VERSION,
            "unsupported store version {}",
            store.version
        );
        Ok(store)
    }

    /// Drop unusable records, restore the ranking and the capacity bound.
    fn sanitize(&self, mut records: Vec<TuningRecord>) -> Vec<TuningRecord> {
        records.retain(|record| record.cost.is_finite() && record.cost >= 0.0);
        records.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        let mut seen = Vec::with_capacity(records.len());
        records.retain(|record| {
            if seen.contains(&record.schedule) {
                return false;
            }
            seen.push(record.schedule.clone());
            true
        });
        records.truncate(self.capacity);
        records
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot of the ranking for `fingerprint`, empty for unknown tasks.
    pub fn lookup(&self, fingerprint: &str) -> Vec<TuningRecord> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.get(fingerprint).cloned().unwrap_or_default()
    }

    pub fn best(&self, fingerprint: &str) -> Option<TuningRecord> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.get(fingerprint).and_then(|records| records.first().cloned())
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn insert(&self, fingerprint: &str, schedule: &ScheduleDesc, cost: f64) -> InsertOutcome {
        if !cost.is_finite() || cost < 0.0 {
            return InsertOutcome::Rejected;
        }
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let records = tasks.entry(fingerprint.to_string()).or_default();

        let mut outcome = InsertOutcome::Inserted;
        if let Some(index) = records.iter().position(|record| &record.schedule == schedule) {
            if cost >= records[index].cost {
                return InsertOutcome::Unchanged;
            }
            records.remove(index);
            outcome = InsertOutcome::Improved;
        }

        let position = records.partition_point(|record| record.cost <= cost);
        if position >= self.capacity {
            if records.is_empty() {
                tasks.remove(fingerprint);
            }
            return InsertOutcome::Rejected;
        }
        records.insert(
            position,
            TuningRecord {
                schedule: schedule.clone(),
                cost,
                recorded_at: unix_seconds(),
            },
        );
        records.truncate(self.capacity);
        debug!(
            task = fingerprint,
            cost,
            rank = position,
            outcome = ?outcome,
            "database insert"
        );
        outcome
    }

    /// Write to the configured path. A no-op for in-memory databases.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    /// Write atomically: a temporary sibling file is renamed over `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = StoreFile {
            version: STORE_VERSION,
            tasks: self
                .tasks
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        let blob = serde_json::to_vec_pretty(&store)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, blob).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        info!(path = %path.display(), tasks = store.tasks.len(), "saved tuning database");
        Ok(())
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
