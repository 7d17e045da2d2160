//! On-disk persistence of records and big-data items.
//!
//! Each record kind lives in its own directory under the storage root:
//! ```text
//! <root>/
//! +-- overlay-images/
//! |   +-- images.json              # all image records
//! |   +-- images.lock              # lock file with LastWrite token
//! |   +-- <image-id>/
//! |       +-- manifest@<version>   # big-data item named "manifest"
//! |       +-- =<base64>@<version>  # big-data item with any other name
//! +-- overlay-layers/
//!     +-- layers.json
//!     +-- layers.lock
//!     +-- <layer-id>/
//! ```
//!
//! Big-data files are immutable. Every write goes to a fresh versioned file
//! that the record names in `big-data-files`, and the atomic rewrite of the
//! index is what commits it. Files of a replaced version are removed only
//! after the new one is committed. Records written before versioned names
//! existed keep their plain file names.
//!
//! Each handle keeps a copy of the index it last wrote or read, together with
//! the lock file's [`LastWrite`] token at that time. Under the exclusive lock
//! a changed token means another writer got there first, and the copy is
//! reloaded before it is modified and written back.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::URL_SAFE, Engine};
use cap_std::fs::Dir;

use crate::error::{Result, StorageError};
use crate::lockfile::{LastWrite, LockFile, WLockGuard};
use crate::record::{OwnerKind, Record};

/// File name used for the big-data item `name` by stores without versioned files.
///
/// Names made only of lowercase letters, digits and dots are used as-is;
/// anything else is stored as `=` followed by the base64 encoding of the name.
pub(crate) fn big_data_file_name(name: &str) -> String {
    let plain = !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b == b'.' || b.is_ascii_digit() || b.is_ascii_lowercase());
    if plain && !name.is_empty() {
        name.to_string()
    } else {
        format!("={}", URL_SAFE.encode(name.as_bytes()))
    }
}

/// A file name for a new version of the big-data item `name`.
///
/// `@` never occurs in a name produced by [`big_data_file_name`].
fn versioned_file_name(name: &str) -> String {
    format!("{}@{:016x}", big_data_file_name(name), rand::random::<u64>())
}

/// Whether `id` can name a record directory.
pub(crate) fn valid_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\0'])
}

fn temp_name(name: &str) -> String {
    format!(".tmp-{}-{:016x}", name, rand::random::<u64>())
}

fn write_synced(dir: &Dir, name: &str, data: &[u8]) -> std::io::Result<()> {
    let mut file = dir.create(name)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Write `data` to `name` in `dir` so that readers see either the old or the new content.
fn atomic_write(dir: &Dir, name: &str, data: &[u8]) -> std::io::Result<()> {
    let tmp = temp_name(name);
    let res = write_synced(dir, &tmp, data).and_then(|()| dir.rename(&tmp, dir, name));
    if res.is_err() {
        let _ = dir.remove_file(&tmp);
    }
    res
}

/// Path of a record's big-data file, relative to the kind's directory.
pub(crate) fn big_data_path(id: &str, file_name: &str) -> String {
    format!("{id}/{file_name}")
}

/// A new version of a big-data item, written but not yet referenced by the index.
///
/// The file is removed on drop unless the version was committed.
#[derive(Debug)]
pub(crate) struct StagedBlob {
    dir: Dir,
    file_name: String,
    committed: bool,
}

impl StagedBlob {
    /// Name of the version's file inside the record directory.
    pub(crate) fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.dir.remove_file(&self.file_name);
        }
    }
}

/// The index as this handle last saw it.
#[derive(Debug)]
struct FileState<R> {
    records: BTreeMap<String, R>,
    seen: LastWrite,
}

/// Persistent index and big-data directory for one record kind.
#[derive(Debug)]
pub(crate) struct RecordFile<R> {
    kind: OwnerKind,
    dir: Arc<Dir>,
    lock: Arc<LockFile>,
    state: Mutex<FileState<R>>,
}

impl<R: Record> RecordFile<R> {
    /// Open (creating if needed) the directory for `R` under the storage root
    /// and load the records it holds.
    pub(crate) fn open(root_path: &Path, root_dir: &Dir) -> Result<(Self, Vec<R>)> {
        let kind = R::KIND;
        root_dir.create_dir_all(kind.dir_name())?;
        let dir = root_dir.open_dir(kind.dir_name())?;
        let lock = LockFile::open(root_path.join(kind.dir_name()).join(kind.lock_file()))?;

        let (loaded, seen) = {
            let _guard = lock.rlock()?;
            (load_records::<R>(&dir)?, lock.last_write()?)
        };
        let records = loaded
            .iter()
            .map(|r| (r.id().to_string(), r.clone()))
            .collect();

        tracing::debug!(%kind, count = loaded.len(), "loaded records");
        Ok((
            Self {
                kind,
                dir: Arc::new(dir),
                lock,
                state: Mutex::new(FileState { records, seen }),
            },
            loaded,
        ))
    }

    /// Load the records of `R` from a store that will never be written to.
    ///
    /// Returns `None` if the store has no directory for `R`.
    pub(crate) fn load_read_only(root_dir: &Dir) -> Result<Option<(Arc<Dir>, Vec<R>)>> {
        let kind = R::KIND;
        if !root_dir.try_exists(kind.dir_name())? {
            return Ok(None);
        }
        let dir = root_dir.open_dir(kind.dir_name())?;
        let records = load_records::<R>(&dir)?;
        Ok(Some((Arc::new(dir), records)))
    }

    /// The directory holding the index and the record directories.
    pub(crate) fn dir(&self) -> Arc<Dir> {
        Arc::clone(&self.dir)
    }

    fn state(&self) -> MutexGuard<'_, FileState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload the index if another writer changed it since this handle last looked.
    ///
    /// Must be called with the exclusive lock held.
    fn sync(&self, state: &mut FileState<R>) -> Result<()> {
        let current = self.lock.last_write()?;
        if current == state.seen {
            return Ok(());
        }
        tracing::debug!(kind = %self.kind, counter = current.counter(), "index changed by another writer, reloading");
        state.records = read_index::<R>(&self.dir)?
            .into_iter()
            .map(|r| (r.id().to_string(), r))
            .collect();
        state.seen = current;
        Ok(())
    }

    /// Write `records` as the new index and stamp a new token.
    fn write_index(&self, guard: &WLockGuard<'_>, state: &mut FileState<R>) -> Result<()> {
        let all: Vec<&R> = state.records.values().collect();
        let data = serde_json::to_vec(&all)?;
        atomic_write(&self.dir, self.kind.index_file(), &data)?;
        state.seen = guard.record_write()?;
        Ok(())
    }

    /// Write a new version of the big-data item `name` of record `id`.
    pub(crate) fn stage_big_data(&self, id: &str, name: &str, data: &[u8]) -> Result<StagedBlob> {
        self.dir.create_dir_all(id)?;
        let staged = StagedBlob {
            dir: self.dir.open_dir(id)?,
            file_name: versioned_file_name(name),
            committed: false,
        };
        write_synced(&staged.dir, &staged.file_name, data)?;
        Ok(staged)
    }

    /// Persist a new record.
    ///
    /// Fails with [`StorageError::DuplicateId`] or [`StorageError::DuplicateName`]
    /// if another writer already stored a record with the same ID or a shared name.
    pub(crate) fn create(&self, record: &R) -> Result<()> {
        let guard = self.lock.lock()?;
        let mut state = self.state();
        self.sync(&mut state)?;
        if state.records.contains_key(record.id()) {
            return Err(StorageError::DuplicateId(record.id().to_string()));
        }
        let taken = state
            .records
            .values()
            .flat_map(|r| r.names())
            .find(|n| record.names().contains(n));
        if let Some(name) = taken {
            return Err(StorageError::DuplicateName(name.clone()));
        }

        self.dir.create_dir_all(record.id())?;
        state.records.insert(record.id().to_string(), record.clone());
        if let Err(e) = self.write_index(&guard, &mut state) {
            state.records.remove(record.id());
            return Err(e);
        }
        Ok(())
    }

    /// Commit `record` together with the staged version it references.
    ///
    /// Returns the paths of files the previous version of the record used and
    /// the new one does not; the caller removes them with [`Self::discard`]
    /// once no new reader can pick them up.
    pub(crate) fn commit(&self, record: &R, staged: &mut StagedBlob) -> Result<Vec<String>> {
        let guard = self.lock.lock()?;
        let mut state = self.state();
        self.sync(&mut state)?;

        let previous = state.records.insert(record.id().to_string(), record.clone());
        if let Err(e) = self.write_index(&guard, &mut state) {
            match previous {
                Some(prev) => state.records.insert(record.id().to_string(), prev),
                None => state.records.remove(record.id()),
            };
            return Err(e);
        }
        staged.committed = true;
        Ok(previous
            .map(|prev| superseded_files(&prev, record))
            .unwrap_or_default())
    }

    /// Best-effort removal of files returned by [`Self::commit`].
    pub(crate) fn discard(&self, paths: &[String]) {
        for path in paths {
            match self.dir.remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(kind = %self.kind, path, "failed to remove replaced big data: {e}"),
            }
        }
    }

    /// Remove the record `id` and its big-data directory.
    pub(crate) fn remove(&self, id: &str) -> Result<()> {
        let guard = self.lock.lock()?;
        let mut state = self.state();
        self.sync(&mut state)?;
        let previous = state.records.remove(id);
        if let Err(e) = self.write_index(&guard, &mut state) {
            if let Some(prev) = previous {
                state.records.insert(id.to_string(), prev);
            }
            return Err(e);
        }
        if self.dir.try_exists(id)? {
            self.dir.remove_dir_all(id)?;
        }
        Ok(())
    }

    /// The current LastWrite token of this kind's lock file.
    pub(crate) fn last_write(&self) -> Result<LastWrite> {
        Ok(self.lock.last_write()?)
    }
}

/// Files of `prev` that `next` no longer references.
fn superseded_files<R: Record>(prev: &R, next: &R) -> Vec<String> {
    let kept: Vec<String> = next
        .big_data()
        .names
        .iter()
        .map(|n| next.big_data().file_name(n))
        .collect();
    prev.big_data()
        .names
        .iter()
        .map(|n| prev.big_data().file_name(n))
        .filter(|f| !kept.contains(f))
        .map(|f| big_data_path(prev.id(), &f))
        .collect()
}

fn read_index<R: Record>(dir: &Dir) -> Result<Vec<R>> {
    let kind = R::KIND;
    if !dir.try_exists(kind.index_file())? {
        return Ok(Vec::new());
    }
    let data = dir.read(kind.index_file())?;
    Ok(serde_json::from_slice(&data)?)
}

/// Read the index, dropping items whose file is gone and taking sizes from the files.
fn load_records<R: Record>(dir: &Dir) -> Result<Vec<R>> {
    let kind = R::KIND;
    let mut records = read_index::<R>(dir)?;
    for record in &mut records {
        if !valid_id(record.id()) {
            return Err(StorageError::InvalidStorage(format!(
                "invalid {kind} ID {:?} in {}",
                record.id(),
                kind.index_file()
            )));
        }
        for name in record.big_data().names.clone() {
            let path = big_data_path(record.id(), &record.big_data().file_name(&name));
            match dir.metadata(&path) {
                Ok(meta) => {
                    record.big_data_mut().sizes.insert(name, meta.len());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::warn!(%kind, id = record.id(), %name, "big data file missing, dropping item");
                    record.big_data_mut().forget(&name);
                    record.big_data_changed(&name);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(records)
}
