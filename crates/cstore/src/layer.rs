//! Layer records.
//!
//! Layers form a parent-linked tree: each layer names at most one parent, and
//! every chain ends at a root layer with no parent. A layer may carry UID and
//! GID mappings describing the identifier range its files were written under.
//!
//! Records are serialized in the `overlay-layers/layers.json` format.

use serde::{Deserialize, Serialize};

use crate::idmap::IdMap;
use crate::record::{BigDataIndex, OwnerKind, Record};

/// A layer record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Layer {
    /// Unique, immutable layer ID.
    pub id: String,

    /// Human-assigned aliases, unique across all layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// ID of the immediate ancestor; `None` for a root layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// UID mapping of the layer's content.
    #[serde(rename = "uidmap", default, skip_serializing_if = "Vec::is_empty")]
    pub uid_map: Vec<IdMap>,

    /// GID mapping of the layer's content.
    #[serde(rename = "gidmap", default, skip_serializing_if = "Vec::is_empty")]
    pub gid_map: Vec<IdMap>,

    /// Uncompressed size of the layer diff, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_size: Option<u64>,

    /// Attached big-data items.
    #[serde(flatten)]
    pub big_data: BigDataIndex,

    /// Reject all mutations of this layer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

impl Layer {
    /// Whether this is a root layer.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl Record for Layer {
    const KIND: OwnerKind = OwnerKind::Layer;

    fn id(&self) -> &str {
        &self.id
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn big_data(&self) -> &BigDataIndex {
        &self.big_data
    }

    fn big_data_mut(&mut self) -> &mut BigDataIndex {
        &mut self.big_data
    }
}

/// Parameters for [`Storage::create_layer`](crate::Storage::create_layer).
#[derive(Debug, Clone, Default)]
pub struct LayerOptions {
    /// Explicit ID; a random one is generated when absent.
    pub id: Option<String>,
    /// Names to assign.
    pub names: Vec<String>,
    /// Parent layer, which must exist.
    pub parent: Option<String>,
    /// UID mapping.
    pub uid_map: Vec<IdMap>,
    /// GID mapping.
    pub gid_map: Vec<IdMap>,
    /// Uncompressed diff size.
    pub diff_size: Option<u64>,
    /// Reject all later mutations.
    pub read_only: bool,
}

impl LayerOptions {
    pub(crate) fn into_layer(self, id: String, parent: Option<String>) -> Layer {
        Layer {
            id,
            names: self.names,
            parent,
            uid_map: self.uid_map,
            gid_map: self.gid_map,
            diff_size: self.diff_size,
            big_data: BigDataIndex::default(),
            read_only: self.read_only,
        }
    }
}
