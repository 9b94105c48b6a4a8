//! JSON-file-based storage backend.
//!
//! Stores each cache entry in its own JSON file under a configurable
//! directory (default: `$XDG_DATA_HOME/affiliate-catalog/`), so cached
//! catalogs survive a process restart.

use core::future::{self, Future};
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{AffiliateError, Result};

use super::{CacheEntry, CacheStore};

/// Application name used for the XDG data directory.
const APP_NAME: &str = "affiliate-catalog";

/// Extension of entry files.
const ENTRY_EXTENSION: &str = "json";

/// Sentinel file used for cross-process file locking.
const LOCK_FILE: &str = "cache.lock";

/// File-backed cache store that persists one entry per key as JSON.
///
/// # Concurrency
///
/// Thread safety within a single process is provided by an in-process
/// [`Mutex`]. Cross-process safety is achieved via an advisory file lock
/// on `cache.lock` (using [`std::fs::File::lock`] /
/// [`std::fs::File::lock_shared`]). Reads take a shared lock, writes an
/// exclusive one, and every write goes to a temporary file that is then
/// renamed over the entry, so readers never observe a partial entry.
///
/// # File layout
///
/// ```text
/// <dir>/
///   cache.lock            (cross-process lock sentinel)
///   catalog_3axml.json    (entry for key `catalog:xml`)
///   catalog_3ajson.json   (entry for key `catalog:json`)
/// ```
///
/// Key bytes outside `[A-Za-z0-9-]` are written as `_` plus their hex
/// value in file names.
#[derive(Debug)]
pub struct FileStore {
    /// Root directory containing all entry files.
    dir: PathBuf,
    /// Mutex serializing concurrent in-process access.
    lock: Mutex<()>,
    /// Sentinel file for cross-process advisory locking.
    lock_file: fs::File,
}

impl FileStore {
    /// Creates a new file store rooted at the given directory.
    ///
    /// Creates the directory (and parents) if it does not exist and opens
    /// (or creates) the `cache.lock` sentinel file.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the lock
    /// file cannot be opened.
    #[inline]
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(storage_io_error)?;
        let lock_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))
            .map_err(storage_io_error)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
            lock_file,
        })
    }

    /// Returns the default XDG-compliant data directory for this application.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform data directory cannot be determined.
    #[inline]
    pub fn default_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|data_path| data_path.join(APP_NAME))
            .ok_or_else(|| {
                AffiliateError::Storage("could not determine platform data directory".into())
            })
    }

    /// Returns the path of the file holding `key`.
    ///
    /// ASCII letters, digits and `-` are kept; every other byte becomes
    /// `_` followed by two lower-case hex digits, so distinct keys never
    /// share a file.
    fn entry_path(&self, key: &str) -> PathBuf {
        let mut stem = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                stem.push(char::from(byte));
            } else {
                stem.push('_');
                for nibble in [byte >> 4_u8, byte & 0x0F_u8] {
                    stem.extend(char::from_digit(u32::from(nibble), 16));
                }
            }
        }
        self.dir.join(format!("{stem}.{ENTRY_EXTENSION}"))
    }

    /// Acquires an in-process mutex guard and a shared (read) file lock,
    /// executes `op`, then releases the file lock.
    fn with_shared_lock<R, F: FnOnce() -> Result<R>>(&self, op: F) -> Result<R> {
        let _guard: MutexGuard<'_, ()> = self.lock.lock().map_err(|err| lock_poison_error(&err))?;
        self.lock_file.lock_shared().map_err(storage_io_error)?;
        let result = op();
        // Only surface the unlock error when the operation succeeded;
        // otherwise the original error is more useful.
        if let Err(err) = self.lock_file.unlock()
            && result.is_ok()
        {
            return Err(storage_io_error(err));
        }
        result
    }

    /// Acquires an in-process mutex guard and an exclusive (write) file
    /// lock, executes `op`, then releases the file lock.
    fn with_exclusive_lock<R, F: FnOnce() -> Result<R>>(&self, op: F) -> Result<R> {
        let _guard: MutexGuard<'_, ()> = self.lock.lock().map_err(|err| lock_poison_error(&err))?;
        self.lock_file.lock().map_err(storage_io_error)?;
        let result = op();
        if let Err(err) = self.lock_file.unlock()
            && result.is_ok()
        {
            return Err(storage_io_error(err));
        }
        result
    }

    /// Reads and decodes the entry for `key`; `None` if no file exists.
    fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
        let path = self.entry_path(key);
        self.with_shared_lock(|| match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(AffiliateError::from),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_io_error(err)),
        })
    }

    /// Atomically writes the entry for `key` (write-to-tmp then rename).
    fn write_entry<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>) -> Result<()> {
        let path = self.entry_path(key);
        let tmp_path = path.with_extension(format!("{ENTRY_EXTENSION}.tmp"));
        let json = serde_json::to_string(entry).map_err(AffiliateError::from)?;
        self.with_exclusive_lock(|| {
            fs::write(&tmp_path, &json).map_err(storage_io_error)?;
            fs::rename(&tmp_path, &path).map_err(storage_io_error)
        })
    }

    /// Deletes the entry file for `key` if present.
    fn delete_entry(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        self.with_exclusive_lock(|| match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_io_error(err)),
        })
    }

    /// Deletes every entry file, keeping the lock sentinel.
    fn delete_all(&self) -> Result<()> {
        self.with_exclusive_lock(|| {
            for dir_entry in fs::read_dir(&self.dir).map_err(storage_io_error)? {
                let path = dir_entry.map_err(storage_io_error)?.path();
                let is_entry = path
                    .extension()
                    .is_some_and(|ext| ext == ENTRY_EXTENSION);
                if is_entry {
                    fs::remove_file(&path).map_err(storage_io_error)?;
                }
            }
            Ok(())
        })
    }
}

/// Wraps an I/O error as a storage error.
fn storage_io_error(err: std::io::Error) -> AffiliateError {
    AffiliateError::Storage(Box::new(err))
}

/// Wraps a mutex poison error as a storage error.
fn lock_poison_error<T>(err: &std::sync::PoisonError<T>) -> AffiliateError {
    AffiliateError::Storage(err.to_string().into())
}

impl<T> CacheStore<T> for FileStore
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[inline]
    fn load(&self, key: &str) -> impl Future<Output = Result<Option<CacheEntry<T>>>> + Send {
        future::ready(self.read_entry(key))
    }

    #[inline]
    fn save(&self, key: &str, entry: CacheEntry<T>) -> impl Future<Output = Result<()>> + Send {
        future::ready(self.write_entry(key, &entry))
    }

    #[inline]
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send {
        future::ready(self.delete_entry(key))
    }

    #[inline]
    fn clear(&self) -> impl Future<Output = Result<()>> + Send {
        future::ready(self.delete_all())
    }
}
