//! Record indices shared by the image and layer stores.
//!
//! Every record lives in a [`Slot`] holding an immutable [`Snapshot`] of the
//! record together with where its big-data content is kept. Readers clone the
//! snapshot `Arc` and never wait on a writer; writers to one record serialize
//! on the slot's write mutex, persist, and then swap the snapshot in a single
//! step.
//!
//! The ID and name indices of a store sit behind one `RwLock`, so removing a
//! record and its names is atomic from a reader's point of view.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cap_std::fs::Dir;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::persist::{big_data_file_name, RecordFile};

/// The kind of record a big-data item is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// An [`Image`](crate::Image) record.
    Image,
    /// A [`Layer`](crate::Layer) record.
    Layer,
}

impl OwnerKind {
    /// The not-found error for an ID or name of this kind.
    pub fn not_found(self, id: &str) -> StorageError {
        match self {
            Self::Image => StorageError::ImageNotFound(id.to_string()),
            Self::Layer => StorageError::LayerNotFound(id.to_string()),
        }
    }

    pub(crate) fn dir_name(self) -> &'static str {
        match self {
            Self::Image => "overlay-images",
            Self::Layer => "overlay-layers",
        }
    }

    pub(crate) fn index_file(self) -> &'static str {
        match self {
            Self::Image => "images.json",
            Self::Layer => "layers.json",
        }
    }

    pub(crate) fn lock_file(self) -> &'static str {
        match self {
            Self::Image => "images.lock",
            Self::Layer => "layers.lock",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => f.write_str("image"),
            Self::Layer => f.write_str("layer"),
        }
    }
}

/// Names, sizes and digests of the big-data items attached to a record.
///
/// `names` is always exactly the set of names for which a blob exists, in the
/// order they were first set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigDataIndex {
    /// Attached item names.
    #[serde(rename = "big-data-names", default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// Size in bytes of each item.
    #[serde(rename = "big-data-sizes", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sizes: BTreeMap<String, u64>,

    /// Digest recorded for each item, as returned by the writer's digest function.
    #[serde(rename = "big-data-digests", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub digests: BTreeMap<String, String>,

    /// File holding the current version of each item, for on-disk stores.
    #[serde(rename = "big-data-files", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) files: BTreeMap<String, String>,
}

impl BigDataIndex {
    pub(crate) fn record(&mut self, name: &str, size: u64, digest: String) {
        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
        self.sizes.insert(name.to_string(), size);
        self.digests.insert(name.to_string(), digest);
    }

    pub(crate) fn forget(&mut self, name: &str) {
        self.names.retain(|n| n != name);
        self.sizes.remove(name);
        self.digests.remove(name);
        self.files.remove(name);
    }

    /// Name of the file holding item `name` inside the record's directory.
    pub(crate) fn file_name(&self, name: &str) -> String {
        self.files
            .get(name)
            .cloned()
            .unwrap_or_else(|| big_data_file_name(name))
    }
}

/// Behaviour common to image and layer records.
pub(crate) trait Record:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: OwnerKind;

    fn id(&self) -> &str;
    fn names(&self) -> &[String];
    fn read_only(&self) -> bool;
    fn set_read_only(&mut self, read_only: bool);
    fn big_data(&self) -> &BigDataIndex;
    fn big_data_mut(&mut self) -> &mut BigDataIndex;

    /// Called after the big-data item `name` was recorded.
    fn big_data_changed(&mut self, _name: &str) {}
}

/// Blobs keyed by big-data name.
pub(crate) type Blobs = HashMap<String, Arc<[u8]>>;

/// Where the big-data content of a record is kept.
#[derive(Debug, Clone)]
pub(crate) enum Content {
    /// In memory, for stores without a root directory.
    Memory(Blobs),
    /// In immutable files under the record kind's directory, read on demand.
    Disk(Arc<Dir>),
}

/// An immutable view of one record and its content.
#[derive(Debug)]
pub(crate) struct Snapshot<R> {
    pub(crate) record: R,
    pub(crate) content: Content,
}

/// Holder of the current snapshot of one record.
#[derive(Debug)]
pub(crate) struct Slot<R> {
    current: RwLock<Arc<Snapshot<R>>>,
    /// Serializes writers; the flag is set once the record is removed.
    write: Mutex<bool>,
}

impl<R> Slot<R> {
    fn new(record: R, content: Content) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot { record, content })),
            write: Mutex::new(false),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Snapshot<R>> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, bool> {
        self.write.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn replace(&self, next: Snapshot<R>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

#[derive(Debug)]
pub(crate) struct Index<R> {
    pub(crate) by_id: BTreeMap<String, Arc<Slot<R>>>,
    by_name: HashMap<String, String>,
}

impl<R: Record> Index<R> {
    fn lookup(&self, key: &str) -> Option<&Arc<Slot<R>>> {
        if let Some(slot) = self.by_id.get(key) {
            return Some(slot);
        }
        if let Some(slot) = key.strip_prefix("sha256:").and_then(|id| self.by_id.get(id)) {
            return Some(slot);
        }
        if let Some(slot) = self.by_name.get(key).and_then(|id| self.by_id.get(id)) {
            return Some(slot);
        }
        if key.is_empty() {
            return None;
        }
        // Unique ID prefix; an ambiguous prefix resolves to nothing.
        let mut candidates = self
            .by_id
            .range(key.to_string()..)
            .take_while(|(id, _)| id.starts_with(key));
        match (candidates.next(), candidates.next()) {
            (Some((_, slot)), None) => Some(slot),
            _ => None,
        }
    }

    fn check_new(&self, record: &R) -> Result<()> {
        if self.by_id.contains_key(record.id()) {
            return Err(StorageError::DuplicateId(record.id().to_string()));
        }
        if let Some(name) = record.names().iter().find(|n| self.by_name.contains_key(*n)) {
            return Err(StorageError::DuplicateName(name.clone()));
        }
        Ok(())
    }

    fn insert(&mut self, record: R, content: Content) {
        for name in record.names() {
            self.by_name.insert(name.clone(), record.id().to_string());
        }
        self.by_id
            .insert(record.id().to_string(), Arc::new(Slot::new(record, content)));
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = Arc<Snapshot<R>>> + '_ {
        self.by_id.values().map(|slot| slot.snapshot())
    }
}

/// ID and name indices for one kind of record, with optional persistence.
#[derive(Debug)]
pub(crate) struct RecordStore<R> {
    index: RwLock<Index<R>>,
    persist: Option<RecordFile<R>>,
}

impl<R: Record> RecordStore<R> {
    pub(crate) fn new(persist: Option<RecordFile<R>>) -> Self {
        Self {
            index: RwLock::new(Index {
                by_id: BTreeMap::new(),
                by_name: HashMap::new(),
            }),
            persist,
        }
    }

    pub(crate) fn persist(&self) -> Option<&RecordFile<R>> {
        self.persist.as_ref()
    }

    pub(crate) fn read_index(&self) -> RwLockReadGuard<'_, Index<R>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, Index<R>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add records loaded from disk, whose content is kept in `content`.
    ///
    /// Records whose ID or names are already present are skipped, so earlier
    /// stores shadow later ones. Returns the number of records added.
    pub(crate) fn load(&self, loaded: Vec<R>, content: &Content, read_only: bool) -> usize {
        let mut index = self.write_index();
        let mut added = 0;
        for mut record in loaded {
            if let Err(e) = index.check_new(&record) {
                tracing::warn!(kind = %R::KIND, id = record.id(), "skipping record: {e}");
                continue;
            }
            if read_only {
                record.set_read_only(true);
            }
            index.insert(record, content.clone());
            added += 1;
        }
        added
    }

    /// Resolve an ID, `sha256:`-prefixed ID, name or unique ID prefix.
    pub(crate) fn slot(&self, key: &str) -> Result<Arc<Slot<R>>> {
        self.read_index()
            .lookup(key)
            .cloned()
            .ok_or_else(|| R::KIND.not_found(key))
    }

    pub(crate) fn snapshot(&self, key: &str) -> Result<Arc<Snapshot<R>>> {
        Ok(self.slot(key)?.snapshot())
    }

    pub(crate) fn get(&self, key: &str) -> Result<R> {
        Ok(self.snapshot(key)?.record.clone())
    }

    pub(crate) fn exists(&self, key: &str) -> bool {
        self.read_index().lookup(key).is_some()
    }

    pub(crate) fn list(&self) -> Vec<R> {
        self.read_index()
            .records()
            .map(|snap| snap.record.clone())
            .collect()
    }

    /// Insert a new record, persisting it first.
    pub(crate) fn insert(&self, record: R) -> Result<()> {
        let mut index = self.write_index();
        index.check_new(&record)?;
        let content = match &self.persist {
            Some(persist) => {
                persist.create(&record)?;
                Content::Disk(persist.dir())
            }
            None => Content::Memory(Blobs::new()),
        };
        index.insert(record, content);
        Ok(())
    }

    /// Remove a record with all of its names and blobs.
    ///
    /// `check` runs under the index lock and may veto the removal.
    pub(crate) fn remove(
        &self,
        key: &str,
        check: impl FnOnce(&Index<R>, &R) -> Result<()>,
    ) -> Result<R> {
        let slot = self.slot(key)?;
        let mut removed = slot.lock_writer();
        if *removed {
            return Err(R::KIND.not_found(key));
        }
        let record = slot.snapshot().record.clone();
        if record.read_only() {
            return Err(StorageError::ReadOnlyOwner(record.id().to_string()));
        }

        let mut index = self.write_index();
        check(&*index, &record)?;
        if let Some(persist) = &self.persist {
            persist.remove(record.id())?;
        }
        index.by_id.remove(record.id());
        for name in record.names() {
            if index.by_name.get(name).map(String::as_str) == Some(record.id()) {
                index.by_name.remove(name);
            }
        }
        *removed = true;
        Ok(record)
    }
}
