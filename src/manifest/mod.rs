//! Parsing of the recognized manifest media types into a uniform shape that
//! exposes blob and submanifest references.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;
use crate::models::policies::{Platform, PlatformFilter};

pub mod media_types {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// Docker schema 1, long deprecated. We serve existing ones, but reject
    /// new pushes.
    pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const DOCKER_MANIFEST_V1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";

    pub const ALL: &[&str] = &[
        DOCKER_MANIFEST,
        DOCKER_MANIFEST_LIST,
        OCI_MANIFEST,
        OCI_INDEX,
        DOCKER_MANIFEST_V1,
        DOCKER_MANIFEST_V1_SIGNED,
    ];

    pub fn is_index(media_type: &str) -> bool {
        media_type == DOCKER_MANIFEST_LIST || media_type == OCI_INDEX
    }
}

/// Manifests above this size are refused at the API boundary.
pub const MAX_MANIFEST_SIZE_BYTES: usize = 4 << 20;

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ManifestParseError {
    #[error("unsupported manifest media type `{media_type}`")]
    UnsupportedMediaType { media_type: String },
    #[error("malformed manifest: {raw_error_message}")]
    Malformed { raw_error_message: String },
    #[error("manifest list does not contain any manifests")]
    EmptyIndex,
    #[error("manifest exceeds the size limit of {limit} bytes")]
    TooLarge { limit: usize },
}

/// Descriptor: a reference to a blob or submanifest, in the OCI descriptor
/// shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifestDocument {
    #[serde(default)]
    pub schema_version: i32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    #[serde(default)]
    pub schema_version: i32,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaV1Layer {
    pub blob_sum: Digest,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaV1Document {
    #[serde(default)]
    pub schema_version: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub fs_layers: Vec<SchemaV1Layer>,
}

/// ParsedManifest: uniform view over all recognized manifest kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedManifest {
    Image(ImageManifestDocument),
    Index(IndexDocument),
    SchemaV1(SchemaV1Document),
}

impl ParsedManifest {
    /// Parses the canonical manifest bytes under the client-declared media
    /// type. The digest of the manifest is always the sha256 of exactly
    /// these bytes.
    pub fn parse(media_type: &str, contents: &[u8]) -> Result<ParsedManifest, ManifestParseError> {
        if contents.len() > MAX_MANIFEST_SIZE_BYTES {
            return Err(ManifestParseError::TooLarge {
                limit: MAX_MANIFEST_SIZE_BYTES,
            });
        }
        let malformed = |err: serde_json::Error| ManifestParseError::Malformed {
            raw_error_message: err.to_string(),
        };
        match media_type {
            media_types::DOCKER_MANIFEST | media_types::OCI_MANIFEST => {
                let document: ImageManifestDocument =
                    serde_json::from_slice(contents).map_err(malformed)?;
                Ok(ParsedManifest::Image(document))
            }
            media_types::DOCKER_MANIFEST_LIST | media_types::OCI_INDEX => {
                let document: IndexDocument =
                    serde_json::from_slice(contents).map_err(malformed)?;
                if document.manifests.is_empty() {
                    return Err(ManifestParseError::EmptyIndex);
                }
                Ok(ParsedManifest::Index(document))
            }
            media_types::DOCKER_MANIFEST_V1 | media_types::DOCKER_MANIFEST_V1_SIGNED => {
                let document: SchemaV1Document =
                    serde_json::from_slice(contents).map_err(malformed)?;
                Ok(ParsedManifest::SchemaV1(document))
            }
            other => Err(ManifestParseError::UnsupportedMediaType {
                media_type: other.to_string(),
            }),
        }
    }

    /// All blobs this manifest references directly (config and layers).
    pub fn blob_references(&self) -> Vec<Descriptor> {
        match self {
            ParsedManifest::Image(document) => {
                let mut refs = vec![document.config.clone()];
                refs.extend(document.layers.iter().cloned());
                refs
            }
            ParsedManifest::Index(_) => Vec::new(),
            ParsedManifest::SchemaV1(document) => document
                .fs_layers
                .iter()
                .map(|layer| Descriptor {
                    media_type: "application/vnd.docker.container.image.rootfs.diff+x-gtar"
                        .to_string(),
                    digest: layer.blob_sum.clone(),
                    size: None,
                    platform: None,
                    urls: None,
                })
                .collect(),
        }
    }

    /// All submanifests this manifest references, after applying the
    /// account's platform filter. The filter only ever applies to index
    /// kinds; single-image manifests pass through untouched elsewhere.
    pub fn manifest_references(&self, platform_filter: &PlatformFilter) -> Vec<Descriptor> {
        match self {
            ParsedManifest::Index(document) => document
                .manifests
                .iter()
                .filter(|descriptor| match &descriptor.platform {
                    Some(platform) => platform_filter.includes(platform),
                    None => true,
                })
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, ParsedManifest::Index(_))
    }
}

/// The slice of an image config blob that validation extracts into the
/// manifest row.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageConfigInfo {
    #[serde(default)]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub config: ImageConfigSection,
    #[serde(default)]
    pub history: Vec<ImageHistoryEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageConfigSection {
    #[serde(rename = "Labels", default)]
    pub labels: Option<std::collections::HashMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageHistoryEntry {
    #[serde(default)]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
}

impl ImageConfigInfo {
    pub fn parse(contents: &[u8]) -> Result<Self, ManifestParseError> {
        serde_json::from_slice(contents).map_err(|err| ManifestParseError::Malformed {
            raw_error_message: err.to_string(),
        })
    }

    /// (oldest, newest) layer creation time across the image history.
    pub fn layer_created_range(
        &self,
    ) -> (
        Option<chrono::DateTime<chrono::Utc>>,
        Option<chrono::DateTime<chrono::Utc>>,
    ) {
        let mut created: Vec<_> = self
            .history
            .iter()
            .filter_map(|entry| entry.created)
            .collect();
        created.sort_unstable();
        (created.first().copied(), created.last().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor_json(digest_input: &[u8], size: i64) -> serde_json::Value {
        json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": Digest::of_contents(digest_input).to_string(),
            "size": size,
        })
    }

    #[test]
    fn parses_oci_image_manifest() {
        let raw = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": Digest::of_contents(b"config").to_string(),
                "size": 6,
            },
            "layers": [descriptor_json(b"layer1", 10), descriptor_json(b"layer2", 20)],
        }))
        .unwrap();

        let parsed = ParsedManifest::parse(media_types::OCI_MANIFEST, &raw).unwrap();
        let blobs = parsed.blob_references();
        assert_eq!(blobs.len(), 3);
        assert_eq!(blobs[0].digest, Digest::of_contents(b"config"));
        assert!(parsed.manifest_references(&PlatformFilter::default()).is_empty());
        assert!(!parsed.is_index());
    }

    #[test]
    fn rejects_empty_index_and_unknown_media_type() {
        let empty = serde_json::to_vec(&json!({"schemaVersion": 2, "manifests": []})).unwrap();
        assert_eq!(
            ParsedManifest::parse(media_types::OCI_INDEX, &empty),
            Err(ManifestParseError::EmptyIndex)
        );
        assert!(matches!(
            ParsedManifest::parse("application/json", b"{}"),
            Err(ManifestParseError::UnsupportedMediaType { .. })
        ));
        assert!(matches!(
            ParsedManifest::parse(media_types::OCI_MANIFEST, b"not json"),
            Err(ManifestParseError::Malformed { .. })
        ));
    }

    #[test]
    fn platform_filter_prunes_index_entries() {
        let raw = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "manifests": [
                {
                    "mediaType": media_types::OCI_MANIFEST,
                    "digest": Digest::of_contents(b"amd64").to_string(),
                    "size": 100,
                    "platform": {"os": "linux", "architecture": "amd64"},
                },
                {
                    "mediaType": media_types::OCI_MANIFEST,
                    "digest": Digest::of_contents(b"arm64").to_string(),
                    "size": 100,
                    "platform": {"os": "linux", "architecture": "arm64"},
                },
            ],
        }))
        .unwrap();
        let parsed = ParsedManifest::parse(media_types::OCI_INDEX, &raw).unwrap();

        let unfiltered = parsed.manifest_references(&PlatformFilter::default());
        assert_eq!(unfiltered.len(), 2);

        let filter = PlatformFilter(vec![Platform {
            os: "linux".into(),
            architecture: "amd64".into(),
            ..Default::default()
        }]);
        let filtered = parsed.manifest_references(&filter);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].digest, Digest::of_contents(b"amd64"));
    }

    #[test]
    fn schema1_exposes_fs_layers_as_blobs() {
        let raw = serde_json::to_vec(&json!({
            "schemaVersion": 1,
            "name": "acc1/foo",
            "tag": "latest",
            "fsLayers": [
                {"blobSum": Digest::of_contents(b"old-layer").to_string()},
            ],
        }))
        .unwrap();
        let parsed = ParsedManifest::parse(media_types::DOCKER_MANIFEST_V1_SIGNED, &raw).unwrap();
        let blobs = parsed.blob_references();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].digest, Digest::of_contents(b"old-layer"));
    }

    #[test]
    fn image_config_extraction() {
        let raw = serde_json::to_vec(&json!({
            "created": "2024-01-03T00:00:00Z",
            "config": {"Labels": {"maintainer": "jane"}},
            "history": [
                {"created": "2024-01-01T00:00:00Z"},
                {"created": "2024-01-03T00:00:00Z"},
                {"created": "2024-01-02T00:00:00Z"},
            ],
        }))
        .unwrap();
        let info = ImageConfigInfo::parse(&raw).unwrap();
        assert_eq!(
            info.config.labels.as_ref().unwrap().get("maintainer"),
            Some(&"jane".to_string())
        );
        let (min, max) = info.layer_created_range();
        assert_eq!(min.unwrap().to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(max.unwrap().to_rfc3339(), "2024-01-03T00:00:00+00:00");
    }
}
