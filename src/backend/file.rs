//! Durable single-directory backend.

use super::journal::Journal;
use super::keyspace::{Keyspace, Mutation};
use super::Backend;
use crate::error::{BusError, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"TMS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// File backend configuration.
#[derive(Clone, Debug)]
pub struct FileBackendConfig {
    /// Directory holding the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Fsync the journal every N mutations (1 = every mutation).
    pub sync_interval: u64,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tidemark"),
            create_if_missing: true,
            sync_interval: 1,
        }
    }
}

struct Inner {
    keyspace: Keyspace,
    journal: Journal,
}

/// Backend persisting every mutation to a journal before applying it.
///
/// The directory is held under an exclusive file lock for the lifetime of
/// the backend, so one process owns it; other processes reach the history
/// through that process.
pub struct FileBackend {
    config: FileBackendConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    inner: Mutex<Inner>,
}

impl FileBackend {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: FileBackendConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(BusError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: FileBackendConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let journal_path = config.path.join("journal.log");
        if journal_path.exists() {
            fs::remove_file(&journal_path)?;
        }
        let (journal, _) = Journal::open(journal_path, config.sync_interval)?;

        Ok(Self {
            config,
            _lock_file: lock_file,
            inner: Mutex::new(Inner {
                keyspace: Keyspace::new(),
                journal,
            }),
        })
    }

    /// Open an existing store, replaying its journal.
    pub fn open(config: FileBackendConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let (journal, mutations) =
            Journal::open(config.path.join("journal.log"), config.sync_interval)?;

        let mut keyspace = Keyspace::new();
        for mutation in &mutations {
            keyspace.apply(mutation).map_err(|e| {
                BusError::Corruption(format!("journal replay failed: {}", e))
            })?;
        }

        tracing::debug!(
            path = %config.path.display(),
            mutations = mutations.len(),
            keys = keyspace.len(),
            "replayed journal"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            inner: Mutex::new(Inner { keyspace, journal }),
        })
    }

    /// Force journaled mutations to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().journal.sync()
    }

    /// Rewrite the journal as a snapshot of the live keyspace.
    ///
    /// Returns the journal size in bytes before and after.
    pub fn compact(&self) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let before = inner.journal.size()?;
        let snapshot = inner.keyspace.snapshot();
        inner.journal.rewrite(&snapshot)?;
        let after = inner.journal.size()?;

        tracing::info!(before, after, "compacted journal");
        Ok((before, after))
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn mutate(&self, mutation: Mutation) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.keyspace.check(&mutation)?;
        inner.journal.append(&mutation)?;
        inner.keyspace.apply(&mutation)
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(BusError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(BusError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| BusError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

impl Backend for FileBackend {
    fn zadd(&self, key: &str, score: u64, member: Vec<u8>) -> Result<()> {
        self.mutate(Mutation::ZAdd {
            key: key.to_string(),
            score,
            member,
        })
        .map(|_| ())
    }

    fn zrange(&self, key: &str, min: Option<u64>, max: Option<u64>) -> Result<Vec<(u64, Vec<u8>)>> {
        self.inner.lock().keyspace.zrange(key, min, max)
    }

    fn zrem(&self, key: &str, score: u64) -> Result<bool> {
        self.mutate(Mutation::ZRem {
            key: key.to_string(),
            score,
        })
        .map(|removed| removed > 0)
    }

    fn zremrange_below(&self, key: &str, cutoff: u64) -> Result<usize> {
        self.mutate(Mutation::ZRemRangeBelow {
            key: key.to_string(),
            cutoff,
        })
        .map(|removed| removed as usize)
    }

    fn zcard(&self, key: &str) -> Result<usize> {
        self.inner.lock().keyspace.zcard(key)
    }

    fn get(&self, key: &str) -> Result<Option<u64>> {
        self.inner.lock().keyspace.get(key)
    }

    fn set(&self, key: &str, value: u64) -> Result<()> {
        self.mutate(Mutation::Set {
            key: key.to_string(),
            value,
        })
        .map(|_| ())
    }

    fn set_max(&self, key: &str, value: u64) -> Result<u64> {
        self.mutate(Mutation::SetMax {
            key: key.to_string(),
            value,
        })
    }

    fn incr(&self, key: &str) -> Result<u64> {
        self.mutate(Mutation::Incr {
            key: key.to_string(),
        })
    }

    fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.mutate(Mutation::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        })
        .map(|added| added > 0)
    }

    fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.mutate(Mutation::SRem {
            key: key.to_string(),
            member: member.to_string(),
        })
        .map(|removed| removed > 0)
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.inner.lock().keyspace.smembers(key)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.mutate(Mutation::Delete {
            key: key.to_string(),
        })
        .map(|deleted| deleted > 0)
    }

    // Leases are process-local and never journaled.
    fn try_lease(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        Ok(self.inner.lock().keyspace.try_lease(key, token, ttl))
    }

    fn release_lease(&self, key: &str, token: &str) -> Result<bool> {
        Ok(self.inner.lock().keyspace.release_lease(key, token))
    }
}
