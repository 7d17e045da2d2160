//! Error types for the cstore library.
//!
//! All operations that can fail return a [`Result<T>`] which is an alias for
//! `Result<T, StorageError>`.
//!
//! # Error Categories
//!
//! - **Lookup errors**: [`ImageNotFound`], [`LayerNotFound`], [`BigDataNotFound`]
//! - **Write rejections**: [`ReadOnlyOwner`], [`DigestFunction`], [`Cancelled`]
//! - **Stored data**: [`InvalidDigest`], [`InvalidStorage`]
//! - **Record management**: [`DuplicateId`], [`DuplicateName`], [`LayerHasChildren`], [`LayerInUse`]
//! - **System errors**: [`Io`], [`JsonParse`], [`Config`], [`Lock`]
//!
//! [`ImageNotFound`]: StorageError::ImageNotFound
//! [`LayerNotFound`]: StorageError::LayerNotFound
//! [`BigDataNotFound`]: StorageError::BigDataNotFound
//! [`ReadOnlyOwner`]: StorageError::ReadOnlyOwner
//! [`DigestFunction`]: StorageError::DigestFunction
//! [`Cancelled`]: StorageError::Cancelled
//! [`InvalidDigest`]: StorageError::InvalidDigest
//! [`InvalidStorage`]: StorageError::InvalidStorage
//! [`DuplicateId`]: StorageError::DuplicateId
//! [`DuplicateName`]: StorageError::DuplicateName
//! [`LayerHasChildren`]: StorageError::LayerHasChildren
//! [`LayerInUse`]: StorageError::LayerInUse
//! [`Io`]: StorageError::Io
//! [`JsonParse`]: StorageError::JsonParse
//! [`Config`]: StorageError::Config
//! [`Lock`]: StorageError::Lock

/// Result type alias for operations that may return a StorageError.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error types for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The requested layer was not found.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// No big-data item with this name is attached to the owner.
    #[error("big data {name:?} not found for {owner}")]
    BigDataNotFound {
        /// ID of the image or layer that was queried.
        owner: String,
        /// Name of the missing item.
        name: String,
    },

    /// A mutation was attempted on a read-only record.
    #[error("{0} is read-only")]
    ReadOnlyOwner(String),

    /// A stored digest does not have the canonical `<algorithm>:<hex>` form.
    #[error("invalid digest {digest:?} recorded for {name:?}: {reason}")]
    InvalidDigest {
        /// Name of the big-data item the digest belongs to.
        name: String,
        /// The digest string as stored.
        digest: String,
        /// Why it failed to parse.
        reason: String,
    },

    /// The caller-supplied digest function failed; nothing was written.
    #[error("computing digest: {0}")]
    DigestFunction(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A record with this ID already exists.
    #[error("duplicate ID: {0}")]
    DuplicateId(String),

    /// The name is already owned by another record of the same kind.
    #[error("name {0:?} is already in use")]
    DuplicateName(String),

    /// The ID cannot be used as a record ID.
    #[error("invalid ID: {0:?}")]
    InvalidId(String),

    /// The name cannot be used as a record or big-data name.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// The layer is the parent of another layer.
    #[error("layer {0} has child layers")]
    LayerHasChildren(String),

    /// The layer is referenced by an image.
    #[error("layer {layer} is in use by image {image}")]
    LayerInUse {
        /// The layer that could not be removed.
        layer: String,
        /// An image referencing it.
        image: String,
    },

    /// The ancestor chain of a layer is longer than the configured bound, or loops.
    #[error("layer chain of {0} exceeds maximum depth of {1}")]
    LayerChainTooDeep(String, usize),

    /// The size of a layer is not recorded.
    #[error("size of layer {0} is unknown")]
    SizeUnknown(String),

    /// Storage content is structurally invalid.
    #[error("invalid storage: {0}")]
    InvalidStorage(String),

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Lock file operation failed.
    #[error("lock error: {0}")]
    Lock(#[from] crate::lockfile::LockError),
}

impl StorageError {
    /// Whether this error means the owner record or the big-data item does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ImageNotFound(_) | Self::LayerNotFound(_) | Self::BigDataNotFound { .. }
        )
    }
}
