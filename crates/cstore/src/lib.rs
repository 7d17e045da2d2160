//! Image and layer metadata store for containers-storage.
//!
//! This library keeps the records of a containers-storage image store: images,
//! layers, the names that point at them, and the named binary blobs ("big
//! data") attached to each record. On disk it uses the containers-storage
//! layout (`overlay-images/images.json`, `overlay-layers/layers.json`, one
//! directory per record for its big data) and accesses it through
//! file descriptor-relative operations via cap-std.
//!
//! # Key Features
//!
//! - **Big-data attachments**: list, read, size and digest queries, and
//!   atomic writes with a caller-supplied digest function
//! - **Parent owner resolution**: the owner IDs inherited from a layer's
//!   ancestors that its own ID mapping cannot represent
//! - **Name resolution**: by ID, `sha256:` ID, name or unique ID prefix
//! - **Read-only stores**: additional image stores are loaded as read-only records
//!
//! # Example
//!
//! ```no_run
//! use cstore::{digest, ImageOptions, LayerOptions, Owner, Storage};
//!
//! let storage = Storage::open("/var/lib/containers/storage")?;
//!
//! let base = storage.create_layer(LayerOptions::default())?;
//! let image = storage.create_image(ImageOptions {
//!     names: vec!["example.com/app:latest".into()],
//!     top_layer: Some(base.id.clone()),
//!     ..Default::default()
//! })?;
//!
//! storage.set_big_data(Owner::Image(&image.id), "manifest", b"{}", digest::from_bytes)?;
//! for name in storage.list_big_data(Owner::Image("example.com/app:latest"))? {
//!     println!("{name}");
//! }
//! # Ok::<(), cstore::StorageError>(())
//! ```
//!
//! # Concurrency
//!
//! A [`Storage`] is shared by reference between threads. Readers work on
//! immutable snapshots of a record and never observe a half-applied write.
//! Several handles, in this or other processes, may open the same root:
//! writers serialize on the store's lock files and reload the record index
//! when another handle wrote it since they last looked.

pub mod batch;
pub mod bigdata;
pub mod config;
pub mod digest;
pub mod error;
pub mod idmap;
pub mod image;
pub mod layer;
pub mod lockfile;
pub mod owners;
mod persist;
mod record;
pub mod storage;

// Re-export commonly used types
pub use batch::{Batch, BatchItem};
pub use bigdata::Owner;
pub use config::{StorageConfig, StorageOptions};
pub use error::{Result, StorageError};
pub use idmap::{IdMap, IdSet};
pub use image::{Image, ImageOptions};
pub use layer::{Layer, LayerOptions};
pub use lockfile::LastWrite;
pub use owners::ParentOwners;
pub use record::{BigDataIndex, OwnerKind};
pub use storage::Storage;

pub use oci_spec::image::Digest;
pub use tokio_util::sync::CancellationToken;
