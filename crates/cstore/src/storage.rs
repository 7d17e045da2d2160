//! The metadata store for images and layers.
//!
//! This module provides the main [`Storage`] struct. It holds the image and
//! layer records, resolves names and IDs to records, and manages their
//! lifecycle. Big-data access lives in [`crate::bigdata`] and parent owner
//! computation in [`crate::owners`]; both operate on a `Storage`.
//!
//! # Storage Structure
//!
//! An on-disk store follows the containers-storage layout:
//! ```text
//! /var/lib/containers/storage/
//! +-- overlay-layers/     # Layer records and layer big data
//! |   +-- layers.json
//! |   +-- layers.lock
//! |   +-- <layer-id>/
//! +-- overlay-images/     # Image records and image big data
//!     +-- images.json
//!     +-- images.lock
//!     +-- <image-id>/
//!         +-- manifest@<version>  # Big-data item
//!         +-- =<key>@<version>    # Big-data item with a base64-encoded name
//! ```
//!
//! A store created with [`Storage::new`] keeps everything in memory.
//!
//! # Name Resolution
//!
//! Images and layers are looked up by, in order: exact ID, ID with a
//! `sha256:` prefix, name, and unique ID prefix.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::batch::Batch;
use crate::config::{StorageConfig, DEFAULT_MAX_LAYER_DEPTH};
use crate::error::{Result, StorageError};
use crate::image::{Image, ImageOptions};
use crate::layer::{Layer, LayerOptions};
use crate::lockfile::LastWrite;
use crate::persist::{valid_id, RecordFile};
use crate::record::{Content, OwnerKind, Record, RecordStore};

/// Main storage handle holding image and layer records.
///
/// All methods take `&self`; a `Storage` can be shared between threads.
#[derive(Debug)]
pub struct Storage {
    /// Root directory of an on-disk store.
    root: Option<PathBuf>,

    /// Image records.
    pub(crate) images: RecordStore<Image>,

    /// Layer records.
    pub(crate) layers: RecordStore<Layer>,

    /// Serializes record creation and removal across both record kinds.
    structure: Mutex<()>,

    /// Bound on the length of a layer's ancestor chain.
    max_layer_depth: usize,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    /// Create an empty store that keeps everything in memory.
    pub fn new() -> Self {
        Self {
            root: None,
            images: RecordStore::new(None),
            layers: RecordStore::new(None),
            structure: Mutex::new(()),
            max_layer_depth: DEFAULT_MAX_LAYER_DEPTH,
        }
    }

    /// Open the store at the given root path, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or opened, or if
    /// the stored records cannot be parsed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root_path = root.as_ref();
        std::fs::create_dir_all(root_path)?;
        let root_dir = Dir::open_ambient_dir(root_path, ambient_authority())?;

        let (layer_file, layers) = RecordFile::<Layer>::open(root_path, &root_dir)?;
        let (image_file, images) = RecordFile::<Image>::open(root_path, &root_dir)?;
        let layer_content = Content::Disk(layer_file.dir());
        let image_content = Content::Disk(image_file.dir());

        let storage = Self {
            root: Some(root_path.to_path_buf()),
            images: RecordStore::new(Some(image_file)),
            layers: RecordStore::new(Some(layer_file)),
            structure: Mutex::new(()),
            max_layer_depth: DEFAULT_MAX_LAYER_DEPTH,
        };
        let layer_count = storage.layers.load(layers, &layer_content, false);
        let image_count = storage.images.load(images, &image_content, false);
        tracing::info!(
            root = %root_path.display(),
            layers = layer_count,
            images = image_count,
            "opened storage"
        );
        Ok(storage)
    }

    /// Open the store described by `config`, including its additional image stores.
    ///
    /// # Errors
    ///
    /// Returns an error if the primary store or any additional store cannot be read.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.root.as_os_str().is_empty() {
            return Err(StorageError::InvalidStorage(
                "no storage root configured".to_string(),
            ));
        }
        let mut storage = Self::open(&config.root)?;
        storage.max_layer_depth = config.max_layer_depth;
        for path in config.additional_image_stores() {
            storage.add_image_store(path)?;
        }
        Ok(storage)
    }

    /// Set the bound on a layer's ancestor chain.
    pub fn with_max_layer_depth(mut self, depth: usize) -> Self {
        self.max_layer_depth = depth;
        self
    }

    /// Load the images of another store at `path` as read-only records.
    ///
    /// Images whose ID or names are already known are skipped. Returns the
    /// number of images added.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or its records parsed.
    pub fn add_image_store<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let dir = Dir::open_ambient_dir(path, ambient_authority())?;
        let Some((images_dir, images)) = RecordFile::<Image>::load_read_only(&dir)? else {
            tracing::info!(path = %path.display(), "additional image store holds no images");
            return Ok(0);
        };
        let _structure = self.lock_structure();
        let added = self.images.load(images, &Content::Disk(images_dir), true);
        tracing::info!(path = %path.display(), images = added, "added read-only image store");
        Ok(added)
    }

    /// Root directory of an on-disk store.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn lock_structure(&self) -> MutexGuard<'_, ()> {
        self.structure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========== Resolution ==========

    /// Resolve an image by ID, name or unique ID prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ImageNotFound`] if nothing matches.
    pub fn image(&self, name_or_id: &str) -> Result<Image> {
        self.images.get(name_or_id)
    }

    /// Resolve a layer by ID, name or unique ID prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LayerNotFound`] if nothing matches.
    pub fn layer(&self, name_or_id: &str) -> Result<Layer> {
        self.layers.get(name_or_id)
    }

    /// Whether an image resolves.
    pub fn image_exists(&self, name_or_id: &str) -> bool {
        self.images.exists(name_or_id)
    }

    /// Whether a layer resolves.
    pub fn layer_exists(&self, name_or_id: &str) -> bool {
        self.layers.exists(name_or_id)
    }

    /// All images, sorted by ID.
    pub fn images(&self) -> Vec<Image> {
        self.images.list()
    }

    /// All layers, sorted by ID.
    pub fn layers(&self) -> Vec<Layer> {
        self.layers.list()
    }

    /// Resolve several images, one outcome per argument.
    pub fn resolve_images<I, S>(&self, args: I) -> Batch<Image>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Batch::collect(args, |arg| self.image(arg))
    }

    /// Resolve several layers, one outcome per argument.
    pub fn resolve_layers<I, S>(&self, args: I) -> Batch<Layer>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Batch::collect(args, |arg| self.layer(arg))
    }

    /// Get the layer followed by its ancestors, ending at a root layer.
    ///
    /// Each layer is read as its own snapshot; the chain is walked iteratively.
    ///
    /// # Errors
    ///
    /// - [`StorageError::LayerNotFound`] if the layer does not resolve
    /// - [`StorageError::InvalidStorage`] if a layer in the chain names a
    ///   parent that does not exist
    /// - [`StorageError::LayerChainTooDeep`] if the chain exceeds the
    ///   configured depth or revisits a layer
    pub fn layer_chain(&self, name_or_id: &str) -> Result<Vec<Layer>> {
        let layer = self.layer(name_or_id)?;
        let mut visited = HashSet::from([layer.id.clone()]);
        let mut next = layer.parent.clone();
        let mut chain = vec![layer];

        while let Some(id) = next {
            if chain.len() >= self.max_layer_depth || !visited.insert(id.clone()) {
                return Err(StorageError::LayerChainTooDeep(
                    chain[0].id.clone(),
                    self.max_layer_depth,
                ));
            }
            let ancestor = match self.layers.get(&id) {
                Ok(layer) => layer,
                Err(StorageError::LayerNotFound(_)) => {
                    let child = chain.last().map(|l| l.id.as_str()).unwrap_or_default();
                    return Err(StorageError::InvalidStorage(format!(
                        "layer {child} has missing parent {id}"
                    )));
                }
                Err(e) => return Err(e),
            };
            next = ancestor.parent.clone();
            chain.push(ancestor);
        }
        Ok(chain)
    }

    // ========== Record Management ==========

    /// Create a layer.
    ///
    /// # Errors
    ///
    /// - [`StorageError::LayerNotFound`] if the parent does not exist
    /// - [`StorageError::DuplicateId`] / [`StorageError::DuplicateName`] if the
    ///   ID or a name is already used by another layer
    /// - [`StorageError::InvalidId`] / [`StorageError::InvalidName`] for unusable values
    pub fn create_layer(&self, mut options: LayerOptions) -> Result<Layer> {
        let _structure = self.lock_structure();
        let id = self.new_id(options.id.take(), &self.layers)?;
        options.names = check_names(options.names)?;
        let parent = match options.parent.take() {
            Some(parent) => Some(self.layers.get(&parent)?.id),
            None => None,
        };

        let layer = options.into_layer(id, parent);
        self.layers.insert(layer.clone())?;
        tracing::info!(id = %layer.id, parent = ?layer.parent, names = ?layer.names, "created layer");
        Ok(layer)
    }

    /// Create an image.
    ///
    /// # Errors
    ///
    /// - [`StorageError::LayerNotFound`] if the top layer or a mapped top layer does not exist
    /// - [`StorageError::DuplicateId`] / [`StorageError::DuplicateName`] if the
    ///   ID or a name is already used by another image
    /// - [`StorageError::InvalidId`] / [`StorageError::InvalidName`] for unusable values
    pub fn create_image(&self, mut options: ImageOptions) -> Result<Image> {
        let _structure = self.lock_structure();
        let id = self.new_id(options.id.take(), &self.images)?;
        options.names = check_names(options.names)?;
        if let Some(top) = options.top_layer.take() {
            options.top_layer = Some(self.layers.get(&top)?.id);
        }
        options.mapped_top_layers = options
            .mapped_top_layers
            .iter()
            .map(|l| self.layers.get(l).map(|l| l.id))
            .collect::<Result<_>>()?;

        let image = options.into_image(id);
        self.images.insert(image.clone())?;
        tracing::info!(id = %image.id, top_layer = ?image.top_layer, names = ?image.names, "created image");
        Ok(image)
    }

    /// Delete an image together with all of its big-data items.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ImageNotFound`] if the image does not resolve
    /// and [`StorageError::ReadOnlyOwner`] if it is read-only.
    pub fn delete_image(&self, name_or_id: &str) -> Result<()> {
        let _structure = self.lock_structure();
        let image = self.images.remove(name_or_id, |_, _| Ok(()))?;
        tracing::info!(id = %image.id, "deleted image");
        Ok(())
    }

    /// Delete a layer together with all of its big-data items.
    ///
    /// # Errors
    ///
    /// - [`StorageError::LayerNotFound`] if the layer does not resolve
    /// - [`StorageError::LayerHasChildren`] if another layer names it as parent
    /// - [`StorageError::LayerInUse`] if an image uses it as a top layer
    /// - [`StorageError::ReadOnlyOwner`] if it is read-only
    pub fn delete_layer(&self, name_or_id: &str) -> Result<()> {
        let _structure = self.lock_structure();
        let id = self.layers.get(name_or_id)?.id;
        if let Some(image) = self.images.list().into_iter().find(|image| {
            image.top_layer.as_deref() == Some(id.as_str()) || image.mapped_top_layers.contains(&id)
        }) {
            return Err(StorageError::LayerInUse {
                layer: id,
                image: image.id,
            });
        }

        let layer = self.layers.remove(&id, |index, layer| {
            let has_children = index
                .records()
                .any(|snap| snap.record.parent.as_deref() == Some(layer.id()));
            if has_children {
                return Err(StorageError::LayerHasChildren(layer.id().to_string()));
            }
            Ok(())
        })?;
        tracing::info!(id = %layer.id, "deleted layer");
        Ok(())
    }

    /// Pick the ID for a new record: the requested one, or a fresh random one.
    fn new_id<R: Record>(&self, requested: Option<String>, store: &RecordStore<R>) -> Result<String> {
        match requested {
            Some(id) if !valid_id(&id) => Err(StorageError::InvalidId(id)),
            Some(id) => Ok(id),
            None => loop {
                let id = hex::encode(rand::random::<[u8; 32]>());
                if !store.exists(&id) {
                    return Ok(id);
                }
            },
        }
    }

    // ========== Sizes ==========

    /// Calculate the size of an image: its big-data items plus the diffs of
    /// every distinct layer reachable from its top layer and mapped top layers.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SizeUnknown`] if one of those layers has no
    /// recorded diff size.
    pub fn image_size(&self, name_or_id: &str) -> Result<u64> {
        let image = self.image(name_or_id)?;
        let mut total: u64 = image.big_data.sizes.values().sum();

        let mut seen = HashSet::new();
        for top in image.top_layer.iter().chain(&image.mapped_top_layers) {
            for layer in self.layer_chain(top)? {
                if !seen.insert(layer.id.clone()) {
                    continue;
                }
                let size = layer
                    .diff_size
                    .ok_or_else(|| StorageError::SizeUnknown(layer.id.clone()))?;
                total = total.saturating_add(size);
            }
        }
        Ok(total)
    }

    // ========== Change Detection Methods ==========

    /// Get the current "last write" token for the images store.
    ///
    /// An in-memory store always returns the empty token.
    pub fn images_last_write(&self) -> Result<LastWrite> {
        last_write(&self.images)
    }

    /// Get the current "last write" token for the layers store.
    ///
    /// An in-memory store always returns the empty token.
    pub fn layers_last_write(&self) -> Result<LastWrite> {
        last_write(&self.layers)
    }

    /// Check if the images store was modified since the given token.
    pub fn images_modified_since(&self, token: &LastWrite) -> Result<bool> {
        Ok(self.images_last_write()? != *token)
    }

    /// Check if the layers store was modified since the given token.
    pub fn layers_modified_since(&self, token: &LastWrite) -> Result<bool> {
        Ok(self.layers_last_write()? != *token)
    }
}

fn last_write<R: Record>(store: &RecordStore<R>) -> Result<LastWrite> {
    match store.persist() {
        Some(persist) => persist.last_write(),
        None => Ok(LastWrite::default()),
    }
}

/// Reject empty names and drop repeated ones, keeping the first occurrence.
fn check_names(names: Vec<String>) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if name.is_empty() {
            return Err(StorageError::InvalidName(name));
        }
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    Ok(out)
}

impl OwnerKind {
    /// The ID of the record `name_or_id` resolves to in `storage`.
    ///
    /// # Errors
    ///
    /// Returns the kind's not-found error if nothing matches.
    pub fn resolve(self, storage: &Storage, name_or_id: &str) -> Result<String> {
        match self {
            Self::Image => Ok(storage.images.snapshot(name_or_id)?.record.id.clone()),
            Self::Layer => Ok(storage.layers.snapshot(name_or_id)?.record.id.clone()),
        }
    }
}
