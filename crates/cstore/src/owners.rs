//! Parent owner resolution.
//!
//! When a layer stack is mounted under a restricted identifier range (for
//! example inside a user namespace), files inherited from ancestor layers may
//! be owned by IDs the layer's own mapping cannot represent. Those files need
//! explicit ownership correction, and [`Storage::layer_parent_owners`]
//! reports which IDs are affected.
//!
//! The computation is purely metadata-driven: an ancestor contributes the
//! container IDs its UID/GID maps declare, and every such ID not covered by
//! the layer's own map is reported. An empty map covers nothing.

use serde::Serialize;

use crate::batch::Batch;
use crate::error::Result;
use crate::idmap::IdSet;
use crate::record::OwnerKind;
use crate::storage::Storage;

/// Owner IDs used by a layer's ancestors that its own mapping does not cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParentOwners {
    /// ID of the layer the owners were computed for.
    #[serde(rename = "ID")]
    pub id: String,
    /// Unmapped user IDs.
    #[serde(rename = "UIDs")]
    pub uids: IdSet,
    /// Unmapped group IDs.
    #[serde(rename = "GIDs")]
    pub gids: IdSet,
}

impl Storage {
    /// Compute the ancestor owner IDs not representable under the layer's own mapping.
    ///
    /// A root layer has no ancestors, so both sets are empty.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LayerNotFound`](crate::StorageError::LayerNotFound)
    /// if the layer does not resolve, and the errors of
    /// [`Storage::layer_chain`] for a broken ancestor chain.
    pub fn layer_parent_owners(&self, key: &str) -> Result<ParentOwners> {
        let chain = self.layer_chain(key)?;
        let Some((layer, ancestors)) = chain.split_first() else {
            return Err(OwnerKind::Layer.not_found(key));
        };

        let mut uids = IdSet::new();
        let mut gids = IdSet::new();
        for ancestor in ancestors {
            uids.union_with(&IdSet::from_container_ranges(&ancestor.uid_map));
            gids.union_with(&IdSet::from_container_ranges(&ancestor.gid_map));
        }
        uids.remove_container_ranges(&layer.uid_map);
        gids.remove_container_ranges(&layer.gid_map);

        tracing::debug!(
            id = %layer.id,
            ancestors = ancestors.len(),
            uids = uids.len(),
            gids = gids.len(),
            "computed parent owners"
        );
        Ok(ParentOwners {
            id: layer.id.clone(),
            uids,
            gids,
        })
    }

    /// Compute parent owners for several layers, one outcome per argument.
    pub fn layer_parent_owners_batch<I, S>(&self, layers: I) -> Batch<ParentOwners>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Batch::collect(layers, |layer| self.layer_parent_owners(layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdMap;
    use crate::layer::{Layer, LayerOptions};
    use crate::record::Content;
    use crate::StorageError;

    fn layer(storage: &Storage, id: &str, parent: Option<&str>, uid_map: Vec<IdMap>) {
        storage
            .create_layer(LayerOptions {
                id: Some(id.to_string()),
                parent: parent.map(str::to_string),
                gid_map: uid_map.clone(),
                uid_map,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_root_layer_has_no_parent_owners() {
        let storage = Storage::new();
        layer(&storage, "root", None, vec![IdMap::new(0, 0, 3)]);
        let owners = storage.layer_parent_owners("root").unwrap();
        assert_eq!(owners.id, "root");
        assert!(owners.uids.is_empty());
        assert!(owners.gids.is_empty());
    }

    #[test]
    fn test_unmapped_parent_id_reported() {
        let storage = Storage::new();
        layer(&storage, "parent", None, vec![IdMap::new(5, 1000, 1)]);
        layer(&storage, "child", Some("parent"), vec![IdMap::new(0, 1000, 5)]);
        let owners = storage.layer_parent_owners("child").unwrap();
        assert_eq!(owners.uids.iter().collect::<Vec<_>>(), vec![5]);
        assert_eq!(owners.gids.iter().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn test_fully_covered_is_empty() {
        let storage = Storage::new();
        layer(&storage, "root", None, vec![IdMap::new(0, 0, 65536)]);
        layer(&storage, "mid", Some("root"), vec![IdMap::new(0, 0, 1000)]);
        layer(&storage, "top", Some("mid"), vec![IdMap::new(0, 100000, 65536)]);
        assert!(storage.layer_parent_owners("top").unwrap().uids.is_empty());
        assert_eq!(storage.layer_parent_owners("mid").unwrap().uids.len(), 64536);
    }

    #[test]
    fn test_unmapped_layer_reports_union_of_ancestors() {
        let storage = Storage::new();
        layer(&storage, "root", None, vec![IdMap::new(0, 0, 3)]);
        layer(&storage, "a", Some("root"), vec![IdMap::new(0, 10, 3)]);
        layer(&storage, "b", Some("a"), vec![]);
        let owners = storage.layer_parent_owners("b").unwrap();
        assert_eq!(owners.uids.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(owners.gids.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_ancestor_with_empty_map_contributes_nothing() {
        let storage = Storage::new();
        layer(&storage, "root", None, vec![]);
        layer(&storage, "child", Some("root"), vec![]);
        assert!(storage.layer_parent_owners("child").unwrap().uids.is_empty());
    }

    #[test]
    fn test_uid_and_gid_maps_are_independent() {
        let storage = Storage::new();
        storage
            .create_layer(LayerOptions {
                id: Some("root".into()),
                uid_map: vec![IdMap::new(0, 0, 2)],
                gid_map: vec![IdMap::new(100, 0, 1)],
                ..Default::default()
            })
            .unwrap();
        storage
            .create_layer(LayerOptions {
                id: Some("child".into()),
                parent: Some("root".into()),
                uid_map: vec![IdMap::new(1, 0, 1)],
                ..Default::default()
            })
            .unwrap();
        let owners = storage.layer_parent_owners("child").unwrap();
        assert_eq!(owners.uids.iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(owners.gids.iter().collect::<Vec<_>>(), vec![100]);
        assert_eq!(
            serde_json::to_string(&owners).unwrap(),
            r#"{"ID":"child","UIDs":[0],"GIDs":[100]}"#
        );
    }

    #[test]
    fn test_missing_ancestor_is_not_a_lookup_miss() {
        let storage = Storage::new();
        storage.layers.load(
            vec![Layer {
                id: "child".into(),
                parent: Some("gone".into()),
                ..Default::default()
            }],
            &Content::Memory(Default::default()),
            false,
        );
        assert!(matches!(
            storage.layer_parent_owners("child"),
            Err(StorageError::InvalidStorage(_))
        ));
        let batch = storage.layer_parent_owners_batch(["child"]);
        assert!(matches!(
            batch.failures().next(),
            Some((_, StorageError::InvalidStorage(_)))
        ));
    }

    #[test]
    fn test_batch_reports_each_item() {
        let storage = Storage::new();
        layer(&storage, "root", None, vec![]);
        let batch = storage.layer_parent_owners_batch(["root", "missing"]);
        assert_eq!(batch.requested(), 2);
        assert_eq!(batch.matched().count(), 1);
        assert!(!batch.is_complete());
        let (name, err) = batch.failures().next().unwrap();
        assert_eq!(name, "missing");
        assert!(matches!(err, StorageError::LayerNotFound(_)));
    }
}
