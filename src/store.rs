use crate::error::{DistributionError, Result};
use crate::types::{DistributionData, DistributionHistogram, DormantFunds, RunStatus, StorageConfig};
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Files making up the persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Accounts,
    Distribution,
    DormantFunds,
    Status,
}

impl ArtifactKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Accounts => "accounts.json",
            ArtifactKind::Distribution => "distribution.json",
            ArtifactKind::DormantFunds => "dormantFunds.json",
            ArtifactKind::Status => "status.json",
        }
    }
}

/// Holds the current generation. Entries are replaced wholesale, never mutated.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entry: RwLock<Option<Arc<DistributionData>>>,
}

impl SnapshotCache {
    pub fn get(&self) -> Option<Arc<DistributionData>> {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn populate(&self, data: Arc<DistributionData>) {
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = Some(data);
    }

    pub fn invalidate(&self) {
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_populated(&self) -> bool {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Durable snapshot artifacts plus the in-memory read path.
///
/// The cache is authoritative once populated; disk is only consulted on a
/// cold start or after `invalidate`.
#[derive(Debug)]
pub struct SnapshotStore {
    data_dir: PathBuf,
    cache: SnapshotCache,
    // Held for writing while a generation is swapped in, for reading while a
    // cold cache loads from disk.
    generation_lock: RwLock<()>,
}

impl SnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| DistributionError::persistence(&data_dir, e))?;

        Ok(Self {
            data_dir,
            cache: SnapshotCache::default(),
            generation_lock: RwLock::new(()),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::new(&config.data_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        self.data_dir.join(kind.file_name())
    }

    /// Both generation artifacts consumers depend on are on disk
    pub fn has_bootstrap_artifacts(&self) -> bool {
        self.artifact_path(ArtifactKind::Distribution).exists()
            && self.artifact_path(ArtifactKind::DormantFunds).exists()
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Current histogram and dormant funds. Never fails: before the first
    /// rebuild this is an empty histogram and an empty map.
    pub fn get_distribution_data(&self) -> Arc<DistributionData> {
        if let Some(cached) = self.cache.get() {
            return cached;
        }

        let _generation = self
            .generation_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        // A writer may have swapped in a generation while we waited
        if let Some(cached) = self.cache.get() {
            return cached;
        }

        let distribution = self
            .read_artifact::<DistributionHistogram>(ArtifactKind::Distribution)
            .filter(|histogram| {
                let ok = histogram.is_well_formed();
                if !ok {
                    warn!("Ignoring distribution artifact with unexpected bucket count");
                }
                ok
            });
        let dormant_funds = self.read_artifact::<DormantFunds>(ArtifactKind::DormantFunds);

        match (distribution, dormant_funds) {
            (Some(distribution), Some(dormant_funds)) => {
                debug!("Loaded distribution snapshot from {}", self.data_dir.display());
                let data = Arc::new(DistributionData {
                    distribution,
                    dormant_funds,
                });
                self.cache.populate(Arc::clone(&data));
                data
            }
            (distribution, dormant_funds) => Arc::new(DistributionData {
                distribution: distribution.unwrap_or_default(),
                dormant_funds: dormant_funds.unwrap_or_default(),
            }),
        }
    }

    /// Status of the last successful rebuild, if any
    pub fn run_status(&self) -> Option<RunStatus> {
        self.read_artifact(ArtifactKind::Status)
    }

    /// Write a complete generation and make it the one served.
    ///
    /// All three artifacts are staged before any of them replaces the
    /// previous generation. Each replaced file is kept as `<name>.prev` until
    /// the whole generation is in place; if any swap fails the files already
    /// swapped are restored, and the cache keeps serving the old generation.
    pub fn persist_generation(&self, data: &DistributionData, status: &RunStatus) -> Result<()> {
        let artifacts = [
            (ArtifactKind::Distribution, serde_json::to_vec_pretty(&data.distribution)?),
            (ArtifactKind::DormantFunds, serde_json::to_vec_pretty(&data.dormant_funds)?),
            (ArtifactKind::Status, serde_json::to_vec_pretty(status)?),
        ];

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(artifacts.len());
        for (kind, bytes) in &artifacts {
            let target = self.artifact_path(*kind);
            match stage(&target, bytes) {
                Ok(tmp) => staged.push((tmp, target)),
                Err(e) => {
                    for (tmp, _) in &staged {
                        let _ = fs::remove_file(tmp);
                    }
                    return Err(DistributionError::persistence(target, e));
                }
            }
        }

        let _generation = self
            .generation_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut swapped: Vec<(PathBuf, Option<PathBuf>)> = Vec::with_capacity(staged.len());
        for (tmp, target) in &staged {
            if let Err(e) = swap_in(tmp, target, &mut swapped) {
                warn!(
                    "Failed to swap in {}, restoring previous generation: {}",
                    target.display(),
                    e
                );
                roll_back(&swapped);
                for (tmp, _) in &staged {
                    let _ = fs::remove_file(tmp);
                }
                sync_dir(&self.data_dir);
                return Err(DistributionError::persistence(target, e));
            }
        }

        for (_, prev) in &swapped {
            if let Some(prev) = prev {
                let _ = fs::remove_file(prev);
            }
        }
        sync_dir(&self.data_dir);

        self.cache.populate(Arc::new(data.clone()));

        info!(
            "💾 Persisted distribution snapshot ({} accounts) to {}",
            data.distribution.total_accounts(),
            self.data_dir.display()
        );
        Ok(())
    }

    /// Advisory account list from the last enumeration
    pub fn save_accounts(&self, accounts: &[String]) -> Result<()> {
        let path = self.artifact_path(ArtifactKind::Accounts);
        let bytes = serde_json::to_vec_pretty(accounts)?;
        write_atomic(&path, &bytes).map_err(|e| DistributionError::persistence(&path, e))?;
        debug!("Saved {} accounts to {}", accounts.len(), path.display());
        Ok(())
    }

    pub fn load_accounts(&self) -> Option<Vec<String>> {
        self.read_artifact(ArtifactKind::Accounts)
    }

    /// Drop the cached generation so the next read reloads from disk
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    fn read_artifact<T: DeserializeOwned>(&self, kind: ArtifactKind) -> Option<T> {
        let path = self.artifact_path(kind);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring corrupt artifact {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    sibling_path(path, ".tmp")
}

fn prev_path(path: &Path) -> PathBuf {
    sibling_path(path, ".prev")
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Keep the current file at `path` as `<path>.prev`; `None` when there is none
fn back_up(path: &Path) -> io::Result<Option<PathBuf>> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
        Ok(_) => {}
    }

    let prev = prev_path(path);
    remove_if_present(&prev)?;
    if fs::hard_link(path, &prev).is_err() {
        fs::copy(path, &prev)?;
    }
    Ok(Some(prev))
}

/// Back up `target`, then rename `tmp` over it. Records the swap on success.
fn swap_in(tmp: &Path, target: &Path, swapped: &mut Vec<(PathBuf, Option<PathBuf>)>) -> io::Result<()> {
    let prev = back_up(target)?;
    if let Err(e) = fs::rename(tmp, target) {
        if let Some(prev) = &prev {
            let _ = fs::remove_file(prev);
        }
        return Err(e);
    }
    swapped.push((target.to_path_buf(), prev));
    Ok(())
}

/// Undo completed swaps, newest first
fn roll_back(swapped: &[(PathBuf, Option<PathBuf>)]) {
    for (target, prev) in swapped.iter().rev() {
        let restored = match prev {
            Some(prev) => fs::rename(prev, target),
            None => remove_if_present(target),
        };
        if let Err(e) = restored {
            warn!("Failed to restore {}: {}", target.display(), e);
        }
    }
}

/// Write `bytes` next to `path` and fsync; returns the temp path
fn stage(path: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let tmp = tmp_path(path);
    let result = File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(tmp)
}

/// Write to `<path>.tmp`, fsync, then rename over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = stage(path, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
