//! A bounded cache of encoded image bytes on the file-system.
//!
//! The cache directory contains exactly one file per entry, named by the hex-formatted
//! [`DiskKey`]. There is no metadata sidecar and no persisted index: the index is rebuilt by
//! scanning the directory when the cache is opened.
//!
//! Entries are evicted in the order they were committed, re-committing a key moves it to the
//! back. This approximates LRU within one process, but access recency is not persisted: after a
//! restart the order is the modification time order of the files found in the directory.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use lru::LruCache;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::DiskKey;

const TEMP_SUFFIX: &str = ".tmp";

/// Runs the given future and converts a [`NotFound`](io::ErrorKind::NotFound) error into `None`.
pub(super) async fn catch_not_found<T>(
    future: impl Future<Output = io::Result<T>>,
) -> io::Result<Option<T>> {
    match future.await {
        Ok(x) => Ok(Some(x)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// A file found while scanning the cache directory.
#[derive(Debug)]
pub(super) struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// The contents of a cache directory, sorted into what belongs to the cache and what does not.
#[derive(Debug, Default)]
pub(super) struct DirectoryScan {
    /// Cache entries, oldest first.
    pub entries: Vec<(DiskKey, ScannedFile)>,
    /// Leftover temporary files of unfinished writes.
    pub temp_files: Vec<ScannedFile>,
    /// Files and directories that are not named like a cache entry.
    pub foreign: Vec<ScannedFile>,
}

pub(super) async fn scan_directory(directory: &Path) -> io::Result<DirectoryScan> {
    let mut scan = DirectoryScan::default();
    let Some(mut entries) = catch_not_found(fs::read_dir(directory)).await? else {
        return Ok(scan);
    };

    while let Some(entry) = entries.next_entry().await? {
        // the file may have been deleted concurrently
        let Some(metadata) = catch_not_found(entry.metadata()).await? else {
            continue;
        };
        let file = ScannedFile {
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if !metadata.is_file() {
            scan.foreign.push(file);
        } else if name.ends_with(TEMP_SUFFIX) {
            scan.temp_files.push(file);
        } else if let Some(key) = DiskKey::from_file_name(&name) {
            scan.entries.push((key, file));
        } else {
            scan.foreign.push(file);
        }
    }

    scan.entries
        .sort_by(|(_, a), (_, b)| a.modified.cmp(&b.modified).then(a.path.cmp(&b.path)));
    Ok(scan)
}

struct DiskState {
    /// Committed entries and their sizes, in eviction order.
    ///
    /// Only `put`, `peek` and `pop_lru` are used, so the order is the commit order.
    index: LruCache<DiskKey, u64>,
    size: u64,
    max_size: u64,
    /// Keys with a live [`Editor`].
    editing: HashSet<DiskKey>,
    /// Keys removed from the index whose file is not deleted yet. They cannot be edited until
    /// the file is gone.
    deleting: HashSet<DiskKey>,
    /// Keys removed from the index while being edited. The editor deletes the stale file if it
    /// does not commit.
    orphaned: HashSet<DiskKey>,
}

impl DiskState {
    fn remove(&mut self, key: &DiskKey) -> bool {
        match self.index.pop(key) {
            Some(size) => {
                self.size -= size;
                true
            }
            None => false,
        }
    }

    fn evict_until(&mut self, size: u64) -> Vec<DiskKey> {
        let mut evicted = Vec::new();
        while self.size > size {
            let Some((key, entry_size)) = self.index.pop_lru() else {
                break;
            };
            self.size -= entry_size;
            evicted.push(key);
        }
        evicted
    }

    /// Takes over deleting the files of `keys`, which were removed from the index.
    ///
    /// Returns the keys whose file the caller has to delete with
    /// [`DiskCacheInner::remove_files`]. Files of keys with a live editor are left to the editor.
    fn claim(&mut self, keys: Vec<DiskKey>) -> Vec<DiskKey> {
        let mut claimed = Vec::with_capacity(keys.len());
        for key in keys {
            if self.editing.contains(&key) {
                self.orphaned.insert(key);
            } else {
                self.deleting.insert(key.clone());
                claimed.push(key);
            }
        }
        claimed
    }
}

struct DiskCacheInner {
    directory: PathBuf,
    state: Mutex<DiskState>,
}

impl DiskCacheInner {
    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Releases the key of an editor that did not commit.
    fn release(&self, key: &DiskKey) {
        let mut state = self.lock();
        state.editing.remove(key);
        state.orphaned.remove(key);
    }

    fn entry_path(&self, key: &DiskKey) -> PathBuf {
        self.directory.join(key.file_name())
    }

    fn temp_path(&self, key: &DiskKey) -> PathBuf {
        self.directory
            .join(format!("{}{TEMP_SUFFIX}", key.file_name()))
    }

    /// Deletes the files of keys claimed with [`DiskState::claim`] and releases the keys.
    ///
    /// Failures are logged, a leftover file is removed by the next cleanup at the latest.
    async fn remove_files(&self, keys: Vec<DiskKey>) {
        for key in keys {
            let path = self.entry_path(&key);
            if let Err(err) = catch_not_found(fs::remove_file(&path)).await {
                let error: &dyn std::error::Error = &err;
                tracing::error!(error, path = %path.display(), "failed to remove evicted cache file");
            }
            self.lock().deleting.remove(&key);
        }
    }
}

/// A size bounded cache of files in a directory.
///
/// All file-system access goes through [`tokio::fs`], and happens outside of the lock guarding
/// the index. The lock is only held to update the index and the size accounting.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<DiskCacheInner>,
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("DiskCache")
            .field("directory", &self.inner.directory)
            .field("len", &state.index.len())
            .field("size", &state.size)
            .field("max_size", &state.max_size)
            .finish()
    }
}

impl DiskCache {
    /// Opens the cache in `directory`, creating the directory if it does not exist yet.
    ///
    /// This rebuilds the index from the files in the directory, deletes temporary files that
    /// were left behind by unfinished writes, and evicts entries until the cache fits into
    /// `max_size`.
    pub async fn open(directory: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;

        let scan = scan_directory(&directory).await?;
        for temp in &scan.temp_files {
            tracing::debug!(path = %temp.path.display(), "removing stale temporary file");
            catch_not_found(fs::remove_file(&temp.path)).await?;
        }

        let mut state = DiskState {
            index: LruCache::unbounded(),
            size: 0,
            max_size,
            editing: HashSet::new(),
            deleting: HashSet::new(),
            orphaned: HashSet::new(),
        };
        for (key, file) in scan.entries {
            state.size += file.size;
            state.index.put(key, file.size);
        }
        let evicted = state.evict_until(max_size);
        let evicted = state.claim(evicted);

        tracing::debug!(
            directory = %directory.display(),
            entries = state.index.len(),
            size = state.size,
            evicted = evicted.len(),
            "opened disk cache"
        );

        let inner = Arc::new(DiskCacheInner {
            directory,
            state: Mutex::new(state),
        });
        inner.remove_files(evicted).await;

        Ok(Self { inner })
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Opens the entry for `key` for reading.
    ///
    /// Returns `None` if there is no such entry. An entry whose file was deleted behind the
    /// cache's back is purged from the index and treated as a miss.
    pub async fn get(&self, key: &DiskKey) -> io::Result<Option<Snapshot>> {
        if self.inner.lock().index.peek(key).is_none() {
            return Ok(None);
        }

        let path = self.inner.entry_path(key);
        let Some(file) = catch_not_found(File::open(&path)).await? else {
            tracing::debug!(%key, "cache file vanished, purging it from the index");
            self.inner.lock().remove(key);
            return Ok(None);
        };

        Ok(Some(Snapshot {
            key: key.clone(),
            path,
            file,
        }))
    }

    /// Whether the index contains `key`.
    pub fn contains(&self, key: &DiskKey) -> bool {
        self.inner.lock().index.peek(key).is_some()
    }

    /// Starts writing the entry for `key`.
    ///
    /// Returns `None` if another [`Editor`] for the same key is still live, or the file of a
    /// removed entry for this key is still being deleted.
    pub async fn edit(&self, key: &DiskKey) -> io::Result<Option<Editor>> {
        {
            let mut state = self.inner.lock();
            if state.deleting.contains(key) || !state.editing.insert(key.clone()) {
                return Ok(None);
            }
        }

        // from here on, dropping the editor releases the key again
        let mut editor = Editor {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            temp_path: self.inner.temp_path(key),
            file: None,
            finished: false,
        };

        catch_not_found(fs::remove_file(&editor.temp_path)).await?;
        editor.file = Some(File::create(&editor.temp_path).await?);

        Ok(Some(editor))
    }

    /// Removes the entry for `key`, returning whether it was present.
    pub async fn remove(&self, key: &DiskKey) -> io::Result<bool> {
        let claimed = {
            let mut state = self.inner.lock();
            if !state.remove(key) {
                return Ok(false);
            }
            state.claim(vec![key.clone()])
        };
        if claimed.is_empty() {
            return Ok(true);
        }

        let result = catch_not_found(fs::remove_file(self.inner.entry_path(key))).await;
        self.inner.lock().deleting.remove(key);
        result?;
        Ok(true)
    }

    /// Removes all entries.
    pub async fn clear(&self) {
        let keys = {
            let mut state = self.inner.lock();
            state.size = 0;
            let mut keys = Vec::with_capacity(state.index.len());
            while let Some((key, _)) = state.index.pop_lru() {
                keys.push(key);
            }
            state.claim(keys)
        };
        self.inner.remove_files(keys).await;
    }

    /// Evicts the oldest entries until at most `size` bytes remain.
    pub async fn trim_to_size(&self, size: u64) {
        let evicted = {
            let mut state = self.inner.lock();
            let evicted = state.evict_until(size);
            state.claim(evicted)
        };
        self.inner.remove_files(evicted).await;
    }

    /// The total size in bytes of all committed entries.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.inner.lock().max_size
    }

    /// The number of committed entries.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read access to a committed cache entry.
///
/// The underlying file is closed when the snapshot is dropped.
pub struct Snapshot {
    key: DiskKey,
    path: PathBuf,
    file: File,
}

impl Snapshot {
    pub fn key(&self) -> &DiskKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the complete contents of the entry.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("key", &self.key)
            .field("path", &self.path)
            .finish()
    }
}

/// Exclusive write access to a cache entry.
///
/// Bytes are written to `<key>.tmp` next to the final file. The editor has to be finished with
/// either [`commit`](Self::commit) or [`abort`](Self::abort). Dropping an unfinished editor
/// aborts it.
pub struct Editor {
    inner: Arc<DiskCacheInner>,
    key: DiskKey,
    temp_path: PathBuf,
    file: Option<File>,
    finished: bool,
}

impl Editor {
    pub fn key(&self) -> &DiskKey {
        &self.key
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file {
            Some(ref mut file) => file.write_all(bytes).await,
            None => Err(io::Error::other("editor is already closed")),
        }
    }

    /// Atomically moves the written file into place and adds it to the index.
    ///
    /// On failure the editor is aborted, the temporary file is removed and the index stays
    /// untouched. Returns the size of the committed entry.
    pub async fn commit(mut self) -> io::Result<u64> {
        match self.try_commit().await {
            Ok(size) => Ok(size),
            Err(err) => {
                self.abort_inner().await;
                Err(err)
            }
        }
    }

    async fn try_commit(&mut self) -> io::Result<u64> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        let path = self.inner.entry_path(&self.key);
        fs::rename(&self.temp_path, &path).await?;
        let size = match fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                catch_not_found(fs::remove_file(&path)).await?;
                return Err(err);
            }
        };

        let evicted = {
            let mut state = self.inner.lock();
            state.remove(&self.key);
            state.size += size;
            state.index.put(self.key.clone(), size);
            state.editing.remove(&self.key);
            state.orphaned.remove(&self.key);
            let max_size = state.max_size;
            let evicted = state.evict_until(max_size);
            state.claim(evicted)
        };
        self.finished = true;

        self.inner.remove_files(evicted).await;
        Ok(size)
    }

    /// Discards everything written so far.
    pub async fn abort(mut self) {
        self.abort_inner().await
    }

    async fn abort_inner(&mut self) {
        self.file = None;
        if let Err(err) = catch_not_found(fs::remove_file(&self.temp_path)).await {
            let error: &dyn std::error::Error = &err;
            tracing::error!(error, "failed to remove temporary cache file");
        }
        let orphaned = self.inner.lock().orphaned.contains(&self.key);
        if orphaned {
            let path = self.inner.entry_path(&self.key);
            if let Err(err) = catch_not_found(fs::remove_file(&path)).await {
                let error: &dyn std::error::Error = &err;
                tracing::error!(error, path = %path.display(), "failed to remove evicted cache file");
            }
        }
        self.inner.release(&self.key);
        self.finished = true;
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file = None;
        // there is no way to await in `drop`, this is a single unlink
        if let Err(err) = std::fs::remove_file(&self.temp_path) {
            if err.kind() != io::ErrorKind::NotFound {
                let error: &dyn std::error::Error = &err;
                tracing::error!(error, "failed to remove temporary cache file");
            }
        }
        if self.inner.lock().orphaned.contains(&self.key) {
            let path = self.inner.entry_path(&self.key);
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    let error: &dyn std::error::Error = &err;
                    tracing::error!(error, "failed to remove evicted cache file");
                }
            }
        }
        self.inner.release(&self.key);
    }
}

impl fmt::Debug for Editor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Editor")
            .field("key", &self.key)
            .field("temp_path", &self.temp_path)
            .finish()
    }
}
