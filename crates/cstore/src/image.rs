//! Image records.
//!
//! An [`Image`] names a top layer, carries the content digests identifying
//! it (usually manifest digests), and owns a set of big-data items such as
//! the manifest and the image configuration.
//!
//! Records are serialized in the `overlay-images/images.json` format:
//! ```text
//! [{"id": "...", "names": ["..."], "layer": "...", "big-data-names": ["manifest"], ...}]
//! ```

use oci_spec::image::Digest;
use serde::{Deserialize, Serialize};

use crate::digest;
use crate::record::{BigDataIndex, OwnerKind, Record};

/// Big-data items whose names start with this prefix hold image manifests.
pub const MANIFEST_BIG_DATA_PREFIX: &str = "manifest";

/// An image record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Image {
    /// Unique, immutable image ID.
    pub id: String,

    /// Primary digest; the first entry of `digests` when not set explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,

    /// Content digests identifying this image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub digests: Vec<Digest>,

    /// Human-assigned aliases, unique across all images.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// ID of the layer holding this image's filesystem state.
    #[serde(rename = "layer", default, skip_serializing_if = "Option::is_none")]
    pub top_layer: Option<String>,

    /// Layers equivalent to `top_layer` under different ID mappings.
    #[serde(rename = "mapped-layers", default, skip_serializing_if = "Vec::is_empty")]
    pub mapped_top_layers: Vec<String>,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,

    /// Attached big-data items.
    #[serde(flatten)]
    pub big_data: BigDataIndex,

    /// Digests supplied at creation, kept so `digests` can be recomputed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) explicit_digests: Vec<Digest>,

    /// Reject all mutations; always set for images from additional stores.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

impl Image {
    /// Rebuild `digests` from the explicit digests and the manifest items.
    fn recompute_digests(&mut self) {
        let mut digests: Vec<Digest> = Vec::new();
        let manifests = self
            .big_data
            .names
            .iter()
            .filter(|n| n.starts_with(MANIFEST_BIG_DATA_PREFIX))
            .filter_map(|n| {
                let stored = self.big_data.digests.get(n)?;
                digest::parse(n, stored).ok()
            });
        for d in self.explicit_digests.iter().cloned().chain(manifests) {
            if !digests.contains(&d) {
                digests.push(d);
            }
        }
        if self.explicit_digests.is_empty() {
            self.digest = digests.first().cloned();
        }
        self.digests = digests;
    }
}

impl Record for Image {
    const KIND: OwnerKind = OwnerKind::Image;

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

    fn big_data_changed(&mut self, name: &str) {
        if name.starts_with(MANIFEST_BIG_DATA_PREFIX) {
            self.recompute_digests();
        }
    }
}

/// Parameters for [`Storage::create_image`](crate::Storage::create_image).
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Explicit ID; a random one is generated when absent.
    pub id: Option<String>,
    /// Names to assign.
    pub names: Vec<String>,
    /// Top layer, which must exist.
    pub top_layer: Option<String>,
    /// Mapped top layers, which must exist.
    pub mapped_top_layers: Vec<String>,
    /// Digests identifying the image independent of its manifests.
    pub digests: Vec<Digest>,
    /// Free-form metadata.
    pub metadata: String,
    /// Reject all later mutations.
    pub read_only: bool,
}

impl ImageOptions {
    pub(crate) fn into_image(self, id: String) -> Image {
        let mut image = Image {
            id,
            names: self.names,
            top_layer: self.top_layer,
            mapped_top_layers: self.mapped_top_layers,
            metadata: self.metadata,
            explicit_digests: self.digests,
            read_only: self.read_only,
            ..Default::default()
        };
        image.digest = image.explicit_digests.first().cloned();
        image.recompute_digests();
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(s: &str) -> Digest {
        digest::from_bytes(s.as_bytes()).unwrap()
    }

    #[test]
    fn test_images_json_parsing() {
        let json = r#"[{
            "id": "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
            "names": ["quay.io/example/app:latest"],
            "layer": "1111111111111111111111111111111111111111111111111111111111111111",
            "big-data-names": ["manifest"],
            "big-data-sizes": {"manifest": 1234},
            "big-data-digests": {"manifest": "sha256:2222222222222222222222222222222222222222222222222222222222222222"}
        }]"#;
        let images: Vec<Image> = serde_json::from_str(json).unwrap();
        let image = &images[0];
        assert_eq!(image.names, vec!["quay.io/example/app:latest"]);
        assert_eq!(
            image.top_layer.as_deref(),
            Some("1111111111111111111111111111111111111111111111111111111111111111")
        );
        assert_eq!(image.big_data.names, vec!["manifest"]);
        assert_eq!(image.big_data.sizes["manifest"], 1234);
        assert!(!image.read_only);
    }

    #[test]
    fn test_manifest_digests_recomputed() {
        let explicit = digest_of("explicit");
        let mut image = ImageOptions {
            digests: vec![explicit.clone()],
            ..Default::default()
        }
        .into_image("img".into());
        assert_eq!(image.digests, vec![explicit.clone()]);

        let m = digest_of("manifest");
        image.big_data.record("manifest", 8, m.to_string());
        image.big_data_changed("manifest");
        image.big_data.record("config", 6, digest_of("config").to_string());
        image.big_data_changed("config");
        image.big_data.record("manifest-sha256:x", 8, "garbage".into());
        image.big_data_changed("manifest-sha256:x");

        assert_eq!(image.digests, vec![explicit.clone(), m]);
        assert_eq!(image.digest, Some(explicit));
    }

    #[test]
    fn test_primary_digest_follows_first_manifest() {
        let mut image = ImageOptions::default().into_image("img".into());
        assert_eq!(image.digest, None);
        let m = digest_of("manifest");
        image.big_data.record("manifest", 8, m.to_string());
        image.big_data_changed("manifest");
        assert_eq!(image.digest, Some(m));
    }
}
