use std::path::{Path, PathBuf};

use cstore::{
    digest, IdMap, ImageOptions, LayerOptions, Owner, Storage, StorageConfig, StorageError,
};

fn images_json(root: &Path) -> serde_json::Value {
    let data = std::fs::read(root.join("overlay-images/images.json")).unwrap();
    serde_json::from_slice(&data).unwrap()
}

fn write_images_json(root: &Path, value: &serde_json::Value) {
    std::fs::write(
        root.join("overlay-images/images.json"),
        serde_json::to_vec(value).unwrap(),
    )
    .unwrap();
}

/// Path of the file holding the current version of an image's big-data item.
fn image_item_path(root: &Path, id: &str, name: &str) -> PathBuf {
    let images = images_json(root);
    let image = images
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["id"] == id)
        .unwrap();
    let file = image["big-data-files"][name].as_str().unwrap();
    root.join("overlay-images").join(id).join(file)
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (image_id, layer_id) = {
        let storage = Storage::open(dir.path()).unwrap();
        let base = storage
            .create_layer(LayerOptions {
                names: vec!["base".into()],
                uid_map: vec![IdMap::new(0, 100000, 65536)],
                diff_size: Some(1024),
                ..Default::default()
            })
            .unwrap();
        let top = storage
            .create_layer(LayerOptions {
                parent: Some("base".into()),
                ..Default::default()
            })
            .unwrap();
        let image = storage
            .create_image(ImageOptions {
                names: vec!["example.com/app:latest".into()],
                top_layer: Some(top.id.clone()),
                ..Default::default()
            })
            .unwrap();
        let owner = Owner::Image(&image.id);
        storage
            .set_big_data(owner, "manifest", b"{\"schemaVersion\":2}", digest::from_bytes)
            .unwrap();
        storage
            .set_big_data(owner, "sha256:abc/signature", b"sig", digest::from_bytes)
            .unwrap();
        storage
            .set_big_data(Owner::Layer(&base.id), "tar-split", b"ts", digest::from_bytes)
            .unwrap();
        (image.id, base.id)
    };

    let storage = Storage::open(dir.path()).unwrap();
    let owner = Owner::Image("example.com/app:latest");
    assert_eq!(
        storage.list_big_data(owner).unwrap(),
        vec!["manifest", "sha256:abc/signature"]
    );
    assert_eq!(
        storage.big_data(owner, "manifest").unwrap(),
        b"{\"schemaVersion\":2}"
    );
    assert_eq!(storage.big_data_size(owner, "sha256:abc/signature").unwrap(), 3);
    assert_eq!(
        storage.big_data_digest(owner, "sha256:abc/signature").unwrap(),
        digest::from_bytes(b"sig").unwrap()
    );
    assert_eq!(
        storage.big_data(Owner::Layer("base"), "tar-split").unwrap(),
        b"ts"
    );

    let image = storage.image(&image_id).unwrap();
    assert_eq!(
        image.digest,
        Some(digest::from_bytes(b"{\"schemaVersion\":2}").unwrap())
    );
    let chain = storage.layer_chain(image.top_layer.as_deref().unwrap()).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].id, layer_id);
    similar_asserts::assert_eq!(chain[1].uid_map, vec![IdMap::new(0, 100000, 65536)]);
    assert_eq!(chain[1].diff_size, Some(1024));

    // Names outside [.0-9a-z] are stored base64-encoded.
    let image_dir = dir.path().join("overlay-images").join(&image_id);
    let files = file_names(&image_dir);
    assert_eq!(files.len(), 2);
    assert!(files.iter().any(|n| n.starts_with("manifest@")));
    assert!(files.iter().any(|n| n.starts_with('=')));
}

#[test]
fn test_plain_file_names_still_read() {
    let dir = tempfile::tempdir().unwrap();
    let image_dir = dir.path().join("overlay-images/img");
    std::fs::create_dir_all(&image_dir).unwrap();
    std::fs::write(image_dir.join("manifest"), b"{}").unwrap();
    write_images_json(
        dir.path(),
        &serde_json::json!([{
            "id": "img",
            "big-data-names": ["manifest"],
            "big-data-digests": {"manifest": digest::from_bytes(b"{}").unwrap().to_string()},
        }]),
    );

    let storage = Storage::open(dir.path()).unwrap();
    let owner = Owner::Image("img");
    assert_eq!(storage.big_data(owner, "manifest").unwrap(), b"{}");
    assert_eq!(storage.big_data_size(owner, "manifest").unwrap(), 2);

    // A rewrite moves the item to a versioned file and drops the plain one.
    storage
        .set_big_data(owner, "manifest", b"[]", digest::from_bytes)
        .unwrap();
    let files = file_names(&image_dir);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("manifest@"));
    assert_eq!(storage.big_data(owner, "manifest").unwrap(), b"[]");
}

#[test]
fn test_overwrite_removes_previous_version() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let image = storage.create_image(ImageOptions::default()).unwrap();
    let owner = Owner::Image(&image.id);

    storage
        .set_big_data(owner, "config", b"v1", digest::from_bytes)
        .unwrap();
    let first = image_item_path(dir.path(), &image.id, "config");
    storage
        .set_big_data(owner, "config", b"v2", digest::from_bytes)
        .unwrap();
    let second = image_item_path(dir.path(), &image.id, "config");

    assert_ne!(first, second);
    assert!(!first.exists());
    assert_eq!(std::fs::read(&second).unwrap(), b"v2");
    assert_eq!(file_names(second.parent().unwrap()).len(), 1);
}

#[test]
fn test_content_read_when_requested() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let storage = Storage::open(dir.path()).unwrap();
        let image = storage.create_image(ImageOptions::default()).unwrap();
        storage
            .set_big_data(Owner::Image(&image.id), "config", b"{}", digest::from_bytes)
            .unwrap();
        image.id
    };

    let storage = Storage::open(dir.path()).unwrap();
    let owner = Owner::Image(&id);
    // Opening does not read item content.
    std::fs::remove_file(image_item_path(dir.path(), &id, "config")).unwrap();
    assert_eq!(storage.list_big_data(owner).unwrap(), vec!["config"]);
    assert_eq!(storage.big_data_size(owner, "config").unwrap(), 2);
    assert!(matches!(
        storage.big_data(owner, "config"),
        Err(StorageError::BigDataNotFound { .. })
    ));
}

#[test]
fn test_corrupt_stored_digest_reported() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let storage = Storage::open(dir.path()).unwrap();
        let image = storage.create_image(ImageOptions::default()).unwrap();
        storage
            .set_big_data(Owner::Image(&image.id), "config", b"{}", digest::from_bytes)
            .unwrap();
        image.id
    };

    let mut images = images_json(dir.path());
    images[0]["big-data-digests"]["config"] = "sha256:not-hex".into();
    write_images_json(dir.path(), &images);

    let storage = Storage::open(dir.path()).unwrap();
    let owner = Owner::Image(&id);
    assert!(matches!(
        storage.big_data_digest(owner, "config"),
        Err(StorageError::InvalidDigest { ref name, ref digest, .. })
            if name == "config" && digest == "sha256:not-hex"
    ));
    // The content itself is still readable.
    assert_eq!(storage.big_data(owner, "config").unwrap(), b"{}");
}

#[test]
fn test_missing_blob_dropped_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let storage = Storage::open(dir.path()).unwrap();
        let image = storage.create_image(ImageOptions::default()).unwrap();
        let owner = Owner::Image(&image.id);
        storage
            .set_big_data(owner, "config", b"{}", digest::from_bytes)
            .unwrap();
        storage
            .set_big_data(owner, "manifest", b"[]", digest::from_bytes)
            .unwrap();
        image.id
    };
    std::fs::remove_file(image_item_path(dir.path(), &id, "config")).unwrap();

    let storage = Storage::open(dir.path()).unwrap();
    let owner = Owner::Image(&id);
    assert_eq!(storage.list_big_data(owner).unwrap(), vec!["manifest"]);
    assert!(matches!(
        storage.big_data(owner, "config"),
        Err(StorageError::BigDataNotFound { .. })
    ));
}

#[test]
fn test_delete_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let image = storage.create_image(ImageOptions::default()).unwrap();
    storage
        .set_big_data(Owner::Image(&image.id), "manifest", b"{}", digest::from_bytes)
        .unwrap();
    let image_dir = dir.path().join("overlay-images").join(&image.id);
    assert!(image_dir.exists());

    storage.delete_image(&image.id).unwrap();
    assert!(!image_dir.exists());
    assert_eq!(images_json(dir.path()), serde_json::json!([]));

    drop(storage);
    let storage = Storage::open(dir.path()).unwrap();
    assert!(storage.images().is_empty());
}

#[test]
fn test_last_write_changes_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let image = storage.create_image(ImageOptions::default()).unwrap();

    let images_token = storage.images_last_write().unwrap();
    let layers_token = storage.layers_last_write().unwrap();
    assert!(!images_token.is_empty());
    assert!(!storage.images_modified_since(&images_token).unwrap());

    storage
        .set_big_data(Owner::Image(&image.id), "config", b"{}", digest::from_bytes)
        .unwrap();
    assert!(storage.images_modified_since(&images_token).unwrap());
    assert!(!storage.layers_modified_since(&layers_token).unwrap());

    // A rejected write leaves the token alone.
    let token = storage.images_last_write().unwrap();
    let _ = storage.set_big_data(Owner::Image(&image.id), "x", b"{}", |_: &[u8]| {
        Err::<cstore::Digest, _>(std::io::Error::other("no digest"))
    });
    assert!(!storage.images_modified_since(&token).unwrap());
}

#[test]
fn test_additional_image_store_is_read_only() {
    let shared = tempfile::tempdir().unwrap();
    let shared_id = {
        let storage = Storage::open(shared.path()).unwrap();
        let image = storage
            .create_image(ImageOptions {
                names: vec!["shared:latest".into()],
                ..Default::default()
            })
            .unwrap();
        storage
            .set_big_data(Owner::Image(&image.id), "manifest", b"{}", digest::from_bytes)
            .unwrap();
        image.id
    };

    let primary = tempfile::tempdir().unwrap();
    let config = StorageConfig::from_toml(&format!(
        "[storage]\ngraphroot = {:?}\n\n[storage.options]\nadditionalimagestores = [{:?}]\n",
        primary.path(),
        shared.path()
    ))
    .unwrap();
    let storage = Storage::from_config(&config).unwrap();

    let image = storage.image("shared:latest").unwrap();
    assert_eq!(image.id, shared_id);
    assert!(image.read_only);

    let owner = Owner::Image("shared:latest");
    assert_eq!(storage.big_data(owner, "manifest").unwrap(), b"{}");
    assert!(matches!(
        storage.set_big_data(owner, "manifest", b"[]", digest::from_bytes),
        Err(StorageError::ReadOnlyOwner(_))
    ));
    assert_eq!(storage.list_big_data(owner).unwrap(), vec!["manifest"]);
    assert!(matches!(
        storage.delete_image("shared:latest"),
        Err(StorageError::ReadOnlyOwner(_))
    ));

    // Read-only records are not written into the primary store.
    storage.create_image(ImageOptions::default()).unwrap();
    assert_eq!(images_json(primary.path()).as_array().unwrap().len(), 1);
}

#[test]
fn test_parent_owners_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = Storage::open(dir.path()).unwrap();
        storage
            .create_layer(LayerOptions {
                id: Some("parent".into()),
                uid_map: vec![IdMap::new(0, 0, 10)],
                gid_map: vec![IdMap::new(0, 0, 10)],
                ..Default::default()
            })
            .unwrap();
        storage
            .create_layer(LayerOptions {
                id: Some("child".into()),
                parent: Some("parent".into()),
                uid_map: vec![IdMap::new(0, 1000, 8)],
                gid_map: vec![IdMap::new(2, 1000, 8)],
                ..Default::default()
            })
            .unwrap();
    }

    let storage = Storage::open(dir.path()).unwrap();
    let owners = storage.layer_parent_owners("child").unwrap();
    assert_eq!(owners.uids.iter().collect::<Vec<_>>(), vec![8, 9]);
    assert_eq!(owners.gids.iter().collect::<Vec<_>>(), vec![0, 1]);
}

#[test]
fn test_failed_index_write_keeps_previous_value() {
    let dir = tempfile::tempdir().unwrap();
    let index = dir.path().join("overlay-images/images.json");
    let id = {
        let storage = Storage::open(dir.path()).unwrap();
        let image = storage.create_image(ImageOptions::default()).unwrap();
        let owner = Owner::Image(&image.id);
        storage
            .set_big_data(owner, "manifest", b"v1", digest::from_bytes)
            .unwrap();

        // Make the index impossible to replace.
        let saved = std::fs::read(&index).unwrap();
        std::fs::remove_file(&index).unwrap();
        std::fs::create_dir(&index).unwrap();
        std::fs::write(index.join("occupied"), b"").unwrap();

        assert!(storage
            .set_big_data(owner, "manifest", b"v2", digest::from_bytes)
            .is_err());
        assert_eq!(storage.big_data(owner, "manifest").unwrap(), b"v1");
        assert_eq!(
            storage.big_data_digest(owner, "manifest").unwrap(),
            digest::from_bytes(b"v1").unwrap()
        );

        std::fs::remove_dir_all(&index).unwrap();
        std::fs::write(&index, saved).unwrap();
        image.id
    };

    let storage = Storage::open(dir.path()).unwrap();
    let owner = Owner::Image(&id);
    assert_eq!(storage.big_data(owner, "manifest").unwrap(), b"v1");
    assert_eq!(storage.big_data_size(owner, "manifest").unwrap(), 2);
    assert_eq!(
        storage.big_data_digest(owner, "manifest").unwrap(),
        digest::from_bytes(b"v1").unwrap()
    );
    // The uncommitted version left no file behind.
    assert_eq!(
        file_names(&dir.path().join("overlay-images").join(&id)).len(),
        1
    );
}

#[test]
fn test_two_handles_on_one_root() {
    let dir = tempfile::tempdir().unwrap();
    {
        let a = Storage::open(dir.path()).unwrap();
        let b = Storage::open(dir.path()).unwrap();
        a.create_image(ImageOptions {
            id: Some("aaa".into()),
            names: vec!["first".into()],
            ..Default::default()
        })
        .unwrap();
        b.create_image(ImageOptions {
            id: Some("bbb".into()),
            ..Default::default()
        })
        .unwrap();

        // Records written by the other handle are known on disk.
        assert!(matches!(
            b.create_image(ImageOptions {
                id: Some("aaa".into()),
                ..Default::default()
            }),
            Err(StorageError::DuplicateId(id)) if id == "aaa"
        ));
        assert!(matches!(
            b.create_image(ImageOptions {
                names: vec!["first".into()],
                ..Default::default()
            }),
            Err(StorageError::DuplicateName(n)) if n == "first"
        ));

        a.set_big_data(Owner::Image("aaa"), "manifest", b"a", digest::from_bytes)
            .unwrap();
        b.set_big_data(Owner::Image("bbb"), "manifest", b"b", digest::from_bytes)
            .unwrap();
        a.create_layer(LayerOptions {
            id: Some("la".into()),
            ..Default::default()
        })
        .unwrap();
        b.create_layer(LayerOptions {
            id: Some("lb".into()),
            ..Default::default()
        })
        .unwrap();
    }

    let storage = Storage::open(dir.path()).unwrap();
    let ids: Vec<_> = storage.images().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["aaa", "bbb"]);
    let layers: Vec<_> = storage.layers().into_iter().map(|l| l.id).collect();
    assert_eq!(layers, vec!["la", "lb"]);
    assert_eq!(storage.big_data(Owner::Image("first"), "manifest").unwrap(), b"a");
    assert_eq!(storage.big_data(Owner::Image("bbb"), "manifest").unwrap(), b"b");
}

fn write_layers_json(root: &Path, value: serde_json::Value) {
    let dir = root.join("overlay-layers");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("layers.json"), serde_json::to_vec(&value).unwrap()).unwrap();
}

#[test]
fn test_layer_parent_cycle_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    write_layers_json(
        dir.path(),
        serde_json::json!([
            {"id": "a", "parent": "b"},
            {"id": "b", "parent": "a"},
        ]),
    );

    let storage = Storage::open(dir.path()).unwrap();
    assert!(matches!(
        storage.layer_parent_owners("a"),
        Err(StorageError::LayerChainTooDeep(id, _)) if id == "a"
    ));
    assert!(matches!(
        storage.layer_chain("b"),
        Err(StorageError::LayerChainTooDeep(id, _)) if id == "b"
    ));
}

#[test]
fn test_layer_dangling_parent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    write_layers_json(
        dir.path(),
        serde_json::json!([
            {"id": "c", "parent": "missing"},
            {"id": "d", "parent": "c"},
        ]),
    );

    let storage = Storage::open(dir.path()).unwrap();
    for layer in ["c", "d"] {
        assert!(matches!(
            storage.layer_parent_owners(layer),
            Err(StorageError::InvalidStorage(msg)) if msg.contains("missing")
        ));
    }
    assert!(matches!(
        storage.layer_parent_owners("missing"),
        Err(StorageError::LayerNotFound(id)) if id == "missing"
    ));
}
