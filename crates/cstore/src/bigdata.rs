//! Named binary blobs attached to image and layer records.
//!
//! Every record can carry any number of big-data items, each identified by a
//! name and stored together with its size and a digest. The digest is
//! produced by a function the writer supplies; the store records whatever it
//! returns and never recomputes it from content.
//!
//! # Consistency
//!
//! - Writers to the same record are serialized; the last one to finish wins.
//! - A write becomes visible in one step: readers see either the previous
//!   bytes and digest or the new ones, never a mix.
//! - A failed write (read-only owner, digest function error, I/O error,
//!   cancellation) leaves the previous value in place.
//! - Reads take a snapshot and never wait for a writer's I/O. On-disk stores
//!   read content from immutable per-version files only when it is asked for.
//!
//! # Example
//!
//! ```
//! use cstore::{digest, ImageOptions, Owner, Storage};
//!
//! let storage = Storage::new();
//! let image = storage.create_image(ImageOptions::default())?;
//! let owner = Owner::Image(&image.id);
//!
//! storage.set_big_data(owner, "manifest", b"{}", digest::from_bytes)?;
//! assert_eq!(storage.big_data(owner, "manifest")?, b"{}");
//! assert_eq!(storage.list_big_data(owner)?, vec!["manifest"]);
//! # Ok::<(), cstore::StorageError>(())
//! ```

use std::io::{Cursor, ErrorKind, Read, Write};
use std::sync::Arc;

use oci_spec::image::Digest;
use tokio_util::sync::CancellationToken;

use crate::digest;
use crate::error::{Result, StorageError};
use crate::persist::big_data_path;
use crate::record::{Content, Record, RecordStore, Snapshot};
use crate::storage::Storage;

/// Chunk size for streaming copies; cancellation is checked between chunks.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// The record a big-data item is attached to, by ID or name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner<'a> {
    /// An image, resolved like [`Storage::image`].
    Image(&'a str),
    /// A layer, resolved like [`Storage::layer`].
    Layer(&'a str),
}

/// Run `$body` against the record store matching `$owner`.
macro_rules! on_owner {
    ($storage:expr, $owner:expr, |$store:ident, $id:ident| $body:expr) => {
        match $owner {
            Owner::Image($id) => {
                let $store = &$storage.images;
                $body
            }
            Owner::Layer($id) => {
                let $store = &$storage.layers;
                $body
            }
        }
    };
}

fn item_not_found<R: Record>(snap: &Snapshot<R>, name: &str) -> StorageError {
    StorageError::BigDataNotFound {
        owner: snap.record.id().to_string(),
        name: name.to_string(),
    }
}

/// Reader over the content of one big-data item.
enum ItemReader {
    Memory(Cursor<Arc<[u8]>>),
    File(cap_std::fs::File),
}

impl Read for ItemReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Memory(cursor) => cursor.read(buf),
            Self::File(file) => file.read(buf),
        }
    }
}

impl<R: Record> RecordStore<R> {
    fn list_big_data(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.snapshot(key)?.record.big_data().names.clone())
    }

    /// Open the current content of item `name`, with its recorded size.
    fn open_big_data(&self, key: &str, name: &str) -> Result<(ItemReader, u64)> {
        let slot = self.slot(key)?;
        loop {
            let snap = slot.snapshot();
            let index = snap.record.big_data();
            let Some(&size) = index.sizes.get(name) else {
                return Err(item_not_found(&snap, name));
            };
            match &snap.content {
                Content::Memory(blobs) => {
                    let blob = blobs.get(name).ok_or_else(|| item_not_found(&snap, name))?;
                    return Ok((ItemReader::Memory(Cursor::new(Arc::clone(blob))), size));
                }
                Content::Disk(dir) => {
                    let path = big_data_path(snap.record.id(), &index.file_name(name));
                    match dir.open(&path) {
                        Ok(file) => return Ok((ItemReader::File(file), size)),
                        // A writer replaced the item and removed the old version.
                        Err(e) if e.kind() == ErrorKind::NotFound
                            && !Arc::ptr_eq(&snap, &slot.snapshot()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {
                            tracing::warn!(kind = %R::KIND, id = snap.record.id(), name, "big data file missing");
                            return Err(item_not_found(&snap, name));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    fn big_data(&self, key: &str, name: &str) -> Result<Vec<u8>> {
        let (mut reader, size) = self.open_big_data(key, name)?;
        let mut data = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
        reader.read_to_end(&mut data)?;
        Ok(data)
    }

    fn big_data_size(&self, key: &str, name: &str) -> Result<u64> {
        let snap = self.snapshot(key)?;
        snap.record
            .big_data()
            .sizes
            .get(name)
            .copied()
            .ok_or_else(|| item_not_found(&snap, name))
    }

    fn big_data_digest(&self, key: &str, name: &str) -> Result<Digest> {
        let snap = self.snapshot(key)?;
        let stored = snap
            .record
            .big_data()
            .digests
            .get(name)
            .ok_or_else(|| item_not_found(&snap, name))?;
        digest::parse(name, stored)
    }

    fn set_big_data<F, E>(&self, key: &str, name: &str, data: &[u8], digest_fn: F) -> Result<()>
    where
        F: FnOnce(&[u8]) -> std::result::Result<Digest, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if name.is_empty() {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        let slot = self.slot(key)?;
        let removed = slot.lock_writer();
        if *removed {
            return Err(R::KIND.not_found(key));
        }
        let current = slot.snapshot();
        let id = current.record.id();
        if current.record.read_only() {
            tracing::warn!(kind = %R::KIND, id, name, "refusing to set big data on read-only record");
            return Err(StorageError::ReadOnlyOwner(id.to_string()));
        }

        let digest = digest_fn(data).map_err(|e| StorageError::DigestFunction(e.into()))?;

        let mut record = current.record.clone();
        record
            .big_data_mut()
            .record(name, data.len() as u64, digest.to_string());
        record.big_data_changed(name);

        let (content, superseded) = match (self.persist(), &current.content) {
            (Some(persist), content) => {
                let mut staged = persist.stage_big_data(id, name, data)?;
                record
                    .big_data_mut()
                    .files
                    .insert(name.to_string(), staged.file_name().to_string());
                let superseded = persist.commit(&record, &mut staged)?;
                (content.clone(), superseded)
            }
            (None, Content::Memory(blobs)) => {
                let mut blobs = blobs.clone();
                blobs.insert(name.to_string(), Arc::from(data));
                (Content::Memory(blobs), Vec::new())
            }
            (None, Content::Disk(_)) => {
                return Err(StorageError::ReadOnlyOwner(id.to_string()));
            }
        };

        tracing::debug!(kind = %R::KIND, id, name, size = data.len(), %digest, "set big data");
        slot.replace(Snapshot { record, content });
        if let Some(persist) = self.persist() {
            persist.discard(&superseded);
        }
        Ok(())
    }
}

/// Read `reader` to the end, checking `cancel` between chunks.
fn read_cancellable(mut reader: impl Read, cancel: &CancellationToken) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(data),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

impl Storage {
    /// List the names of the big-data items attached to `owner`.
    ///
    /// Names are returned in the order they were first set.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if `owner` does not resolve.
    pub fn list_big_data(&self, owner: Owner<'_>) -> Result<Vec<String>> {
        on_owner!(self, owner, |store, id| store.list_big_data(id))
    }

    /// Get the content of the big-data item `name`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if `owner` does not resolve or has no such item.
    pub fn big_data(&self, owner: Owner<'_>, name: &str) -> Result<Vec<u8>> {
        on_owner!(self, owner, |store, id| store.big_data(id, name))
    }

    /// Get the size in bytes of the big-data item `name`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if `owner` does not resolve or has no such item.
    pub fn big_data_size(&self, owner: Owner<'_>, name: &str) -> Result<u64> {
        on_owner!(self, owner, |store, id| store.big_data_size(id, name))
    }

    /// Get the digest recorded for the big-data item `name`.
    ///
    /// The stored digest is validated syntactically, not recomputed.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if `owner` does not resolve or has no such
    /// item, and [`StorageError::InvalidDigest`] if the stored digest is malformed.
    pub fn big_data_digest(&self, owner: Owner<'_>, name: &str) -> Result<Digest> {
        on_owner!(self, owner, |store, id| store.big_data_digest(id, name))
    }

    /// Attach `data` to `owner` under `name`, replacing any previous item.
    ///
    /// `digest_fn` is called exactly once, on `data`, before the write is
    /// acknowledged; its result is recorded as the item's digest without
    /// further checks. [`digest::from_bytes`] computes the canonical digest.
    ///
    /// # Errors
    ///
    /// - a not-found error if `owner` does not resolve
    /// - [`StorageError::ReadOnlyOwner`] if the owner is read-only
    /// - [`StorageError::DigestFunction`] if `digest_fn` fails
    ///
    /// On error the previous item, if any, is left unchanged.
    pub fn set_big_data<F, E>(
        &self,
        owner: Owner<'_>,
        name: &str,
        data: &[u8],
        digest_fn: F,
    ) -> Result<()>
    where
        F: FnOnce(&[u8]) -> std::result::Result<Digest, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        on_owner!(self, owner, |store, id| store
            .set_big_data(id, name, data, digest_fn))
    }

    /// Like [`Storage::set_big_data`], reading the content from `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Cancelled`] if `cancel` fires before the
    /// content has been read; nothing is written in that case.
    pub fn set_big_data_from_reader<F, E>(
        &self,
        owner: Owner<'_>,
        name: &str,
        reader: impl Read,
        digest_fn: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        F: FnOnce(&[u8]) -> std::result::Result<Digest, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let data = read_cancellable(reader, cancel)?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        self.set_big_data(owner, name, &data, digest_fn)
    }

    /// Copy the big-data item `name` to `writer`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Cancelled`] if `cancel` fires mid-copy; `writer`
    /// may then hold a prefix of the content.
    pub fn write_big_data_to(
        &self,
        owner: Owner<'_>,
        name: &str,
        mut writer: impl Write,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let (mut reader, _) = on_owner!(self, owner, |store, id| store.open_big_data(id, name))?;
        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            writer.write_all(&chunk[..n])?;
            written += n as u64;
        }
        writer.flush()?;
        Ok(written)
    }
}
