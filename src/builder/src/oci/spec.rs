//! Typed OCI image-spec documents.
//!
//! The engine both parses and rewrites manifests and configurations (the
//! squashfs path replaces a manifest's whole layer chain), so the types
//! are modeled here directly from the image-spec JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Media type of an OCI image index.
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media type of an OCI image manifest.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of an OCI image configuration.
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Media type of an uncompressed tar layer.
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Media type of a gzip-compressed tar layer.
pub const MEDIA_TYPE_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Annotation key naming a reference in an image index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// A content descriptor: media type, digest, and size of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest.into(),
            size,
            annotations: None,
        }
    }

    /// The reference name recorded in this descriptor's annotations.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(|s| s.as_str())
    }
}

/// An image index: the layout's entry point listing tagged manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_string()),
            manifests: Vec::new(),
        }
    }
}

/// An image manifest: config descriptor plus the layer chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            config,
            layers,
            annotations: None,
        }
    }
}

/// The runtime `config` section of an image configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// The `rootfs` section: ordered diff IDs of the layer chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One history entry per layer (or config edit) in an image configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty_layer: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// An image configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageConfig>,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

impl Default for ImageConfiguration {
    fn default() -> Self {
        Self {
            created: None,
            author: None,
            architecture: host_arch().to_string(),
            os: std::env::consts::OS.to_string(),
            config: None,
            rootfs: RootFs::default(),
            history: Vec::new(),
        }
    }
}

/// Host architecture in OCI naming.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_serializes_camel_case() {
        let desc = Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, "sha256:abc", 42);
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"mediaType\""));
        assert!(json.contains("\"digest\":\"sha256:abc\""));
        assert!(json.contains("\"size\":42"));
        assert!(!json.contains("annotations"));
    }

    #[test]
    fn test_descriptor_ref_name() {
        let mut desc = Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, "sha256:abc", 1);
        assert!(desc.ref_name().is_none());

        let mut annotations = HashMap::new();
        annotations.insert(ANNOTATION_REF_NAME.to_string(), "web".to_string());
        desc.annotations = Some(annotations);
        assert_eq!(desc.ref_name(), Some("web"));
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = ImageManifest::new(
            Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, "sha256:cfg", 10),
            vec![Descriptor::new(MEDIA_TYPE_LAYER_TAR_GZIP, "sha256:l1", 20)],
        );
        let json = serde_json::to_string(&manifest).unwrap();
        let back: ImageManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schema_version, 2);
        assert_eq!(back.config.digest, "sha256:cfg");
        assert_eq!(back.layers.len(), 1);
    }

    #[test]
    fn test_config_section_pascal_case() {
        let config = ImageConfig {
            env: Some(vec!["PATH=/bin".to_string()]),
            working_dir: Some("/app".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"Env\""));
        assert!(json.contains("\"WorkingDir\":\"/app\""));
        assert!(!json.contains("\"Cmd\""));
    }

    #[test]
    fn test_configuration_parses_external_document() {
        // Shape produced by other OCI tooling
        let doc = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Entrypoint": ["/bin/agent"],
                "Env": ["PATH=/usr/bin:/bin"],
                "Labels": {"kind": "agent"}
            },
            "rootfs": {"type": "layers", "diff_ids": ["sha256:aaa"]},
            "history": [{"created_by": "layer", "empty_layer": true}]
        }"#;
        let parsed: ImageConfiguration = serde_json::from_str(doc).unwrap();
        assert_eq!(parsed.rootfs.diff_ids, vec!["sha256:aaa".to_string()]);
        let config = parsed.config.unwrap();
        assert_eq!(config.entrypoint, Some(vec!["/bin/agent".to_string()]));
        assert!(parsed.history[0].empty_layer);
    }

    #[test]
    fn test_history_empty_layer_skipped_when_false() {
        let history = History {
            created_by: Some("strata repack".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&history).unwrap();
        assert!(!json.contains("empty_layer"));
    }
}
