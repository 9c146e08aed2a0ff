// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Durable storage of environment records.
//!
//! Every write goes through a revision check so that concurrent lifecycle
//! operations on the same name cannot silently overwrite each other.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tempfile::NamedTempFile;

use crate::record::{EnvironmentRecord, validate_name};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./registry_test.rs"]
mod registry_test;

/// Directory below the kosher root that holds one file per record.
pub const ENVIRONMENTS_DIR: &str = "environments";

/// Extension of stored record files.
const RECORD_EXTENSION: &str = "yaml";

/// Lock file serializing writers of one registry directory.
pub const LOCK_FILENAME: &str = ".lock";

/// Mutator applied by [`Registry::update`].
pub type Mutator<'a> = dyn FnMut(&mut EnvironmentRecord) -> Result<()> + 'a;

/// A store of environment records keyed by name.
pub trait Registry: Send + Sync {
    /// Insert a new record.
    ///
    /// Fails with [`Error::DuplicateName`] when a live record of that name
    /// exists. A `Deleted` tombstone is overwritten. Returns the record as
    /// stored, with its revision assigned.
    fn put(&self, record: EnvironmentRecord) -> Result<EnvironmentRecord>;

    /// Load a live record.
    fn get(&self, name: &str) -> Result<EnvironmentRecord>;

    /// Replace the stored record if its revision still equals
    /// `expected_revision`.
    fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: EnvironmentRecord,
    ) -> Result<EnvironmentRecord>;

    /// Physically delete a record under the same revision check.
    ///
    /// Removing a record that no longer exists succeeds.
    fn remove(&self, name: &str, expected_revision: u64) -> Result<()>;

    /// Names of all live records, ordered by creation time then name.
    fn index(&self) -> Result<Vec<String>>;

    /// Read a record, apply `mutator` to a copy and write it back.
    fn update(&self, name: &str, mutator: &mut Mutator<'_>) -> Result<EnvironmentRecord> {
        let current = self.get(name)?;
        let mut next = current.clone();
        mutator(&mut next)?;
        self.compare_and_swap(current.revision, next)
    }
}

impl dyn Registry + '_ {
    /// A restartable listing of all live records.
    pub fn list(&self) -> Result<Listing<'_>> {
        Ok(Listing {
            registry: self,
            names: self.index()?,
        })
    }
}

/// Snapshot of the live record names, loading each record on demand.
pub struct Listing<'a> {
    registry: &'a dyn Registry,
    names: Vec<String>,
}

impl<'a> Listing<'a> {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Iterate the records, skipping any deleted since the listing was taken.
    ///
    /// Each call starts from the beginning and reloads the records.
    pub fn iter(&self) -> impl Iterator<Item = Result<EnvironmentRecord>> + '_ {
        self.names
            .iter()
            .filter_map(|name| match self.registry.get(name) {
                Err(Error::NotFound(_)) => None,
                other => Some(other),
            })
    }

    /// Re-read the set of live names.
    pub fn refresh(&mut self) -> Result<()> {
        self.names = self.registry.index()?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records stored as YAML files under `<root>/environments`.
///
/// Every read-check-write holds an exclusive lock on
/// `<root>/environments/.lock`, so writers in other processes (or other
/// instances over the same directory) are serialized too.
#[derive(Debug)]
pub struct FsRegistry {
    dir: PathBuf,
}

/// Exclusive hold on a registry's lock file, released on drop.
struct WriterLock {
    _file: File,
}

impl FsRegistry {
    /// Open (creating if needed) the registry below `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let dir = root.as_ref().join(ENVIRONMENTS_DIR);
        std::fs::create_dir_all(&dir)?;
        let dir = dunce::canonicalize(&dir)?;
        tracing::debug!("opened registry at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing the record called `name`.
    pub fn record_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{RECORD_EXTENSION}")))
    }

    /// Block until this process is the registry's only writer.
    fn lock_writers(&self) -> Result<WriterLock> {
        let path = self.dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|error| Error::ReadFailed {
                path: path.clone(),
                error,
            })?;
        file.lock()
            .map_err(|error| Error::ReadFailed { path, error })?;
        Ok(WriterLock { _file: file })
    }

    fn read(&self, name: &str) -> Result<Option<EnvironmentRecord>> {
        let path = self.record_path(name)?;
        self.read_path(&path)
    }

    fn read_path(&self, path: &Path) -> Result<Option<EnvironmentRecord>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(Error::ReadFailed {
                    path: path.to_path_buf(),
                    error,
                });
            }
        };
        serde_yaml::from_str(&content)
            .map(Some)
            .map_err(|error| Error::InvalidYaml {
                path: path.to_path_buf(),
                error,
            })
    }

    /// Write `record` through a synced temporary file and an atomic rename.
    ///
    /// With `exclusive` the rename fails if the target exists, which makes
    /// a put atomic across processes.
    fn write(&self, record: &EnvironmentRecord, exclusive: bool) -> Result<()> {
        let path = self.record_path(&record.name)?;
        let yaml = serde_yaml::to_string(record).map_err(|error| Error::InvalidYaml {
            path: path.clone(),
            error,
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.as_file().sync_all()?;

        let persisted = if exclusive {
            tmp.persist_noclobber(&path)
        } else {
            tmp.persist(&path)
        };
        match persisted {
            Ok(_) => {}
            Err(err) if exclusive && err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::DuplicateName(record.name.clone()));
            }
            Err(err) => return Err(err.error.into()),
        }
        self.sync_dir()
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<()> {
        std::fs::File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<()> {
        Ok(())
    }
}

impl Registry for FsRegistry {
    fn put(&self, mut record: EnvironmentRecord) -> Result<EnvironmentRecord> {
        record.validate()?;
        let _writer = self.lock_writers()?;
        match self.read(&record.name)? {
            Some(existing) if existing.state.is_live() => {
                Err(Error::DuplicateName(record.name))
            }
            Some(tombstone) => {
                record.revision = tombstone.revision + 1;
                self.write(&record, false)?;
                Ok(record)
            }
            None => {
                record.revision = 1;
                self.write(&record, true)?;
                Ok(record)
            }
        }
    }

    fn get(&self, name: &str) -> Result<EnvironmentRecord> {
        match self.read(name)? {
            Some(record) if record.state.is_live() => Ok(record),
            _ => Err(Error::NotFound(name.to_string())),
        }
    }

    fn compare_and_swap(
        &self,
        expected_revision: u64,
        mut record: EnvironmentRecord,
    ) -> Result<EnvironmentRecord> {
        record.validate()?;
        let _writer = self.lock_writers()?;
        let Some(current) = self.read(&record.name)? else {
            return Err(Error::NotFound(record.name));
        };
        if current.revision != expected_revision {
            return Err(Error::ConcurrentModification(record.name));
        }
        record.revision = expected_revision + 1;
        self.write(&record, false)?;
        Ok(record)
    }

    fn remove(&self, name: &str, expected_revision: u64) -> Result<()> {
        let path = self.record_path(name)?;
        let _writer = self.lock_writers()?;
        let Some(current) = self.read_path(&path)? else {
            return Ok(());
        };
        if current.revision != expected_revision {
            return Err(Error::ConcurrentModification(name.to_string()));
        }
        match std::fs::remove_file(&path) {
            Ok(()) => self.sync_dir(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn index(&self) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match self.read_path(&path) {
                Ok(Some(record)) if record.state.is_live() => {
                    entries.push((record.created_at, record.name));
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("Skipping unreadable record: {err}"),
            }
        }
        entries.sort();
        Ok(entries.into_iter().map(|(_, name)| name).collect())
    }
}

/// In-memory registry with the same contract as [`FsRegistry`].
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<BTreeMap<String, EnvironmentRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for MemoryRegistry {
    fn put(&self, mut record: EnvironmentRecord) -> Result<EnvironmentRecord> {
        record.validate()?;
        let mut records = lock(&self.records);
        record.revision = match records.get(&record.name) {
            Some(existing) if existing.state.is_live() => {
                return Err(Error::DuplicateName(record.name));
            }
            Some(tombstone) => tombstone.revision + 1,
            None => 1,
        };
        records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, name: &str) -> Result<EnvironmentRecord> {
        match lock(&self.records).get(name) {
            Some(record) if record.state.is_live() => Ok(record.clone()),
            _ => Err(Error::NotFound(name.to_string())),
        }
    }

    fn compare_and_swap(
        &self,
        expected_revision: u64,
        mut record: EnvironmentRecord,
    ) -> Result<EnvironmentRecord> {
        record.validate()?;
        let mut records = lock(&self.records);
        let Some(current) = records.get(&record.name) else {
            return Err(Error::NotFound(record.name));
        };
        if current.revision != expected_revision {
            return Err(Error::ConcurrentModification(record.name));
        }
        record.revision = expected_revision + 1;
        records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    fn remove(&self, name: &str, expected_revision: u64) -> Result<()> {
        let mut records = lock(&self.records);
        match records.get(name) {
            None => Ok(()),
            Some(current) if current.revision != expected_revision => {
                Err(Error::ConcurrentModification(name.to_string()))
            }
            Some(_) => {
                records.remove(name);
                Ok(())
            }
        }
    }

    fn index(&self) -> Result<Vec<String>> {
        let records = lock(&self.records);
        let mut entries: Vec<_> = records
            .values()
            .filter(|r| r.state.is_live())
            .map(|r| (r.created_at, r.name.clone()))
            .collect();
        entries.sort();
        Ok(entries.into_iter().map(|(_, name)| name).collect())
    }
}
