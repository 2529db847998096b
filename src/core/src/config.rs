//! Build configuration: the directory layout every engine component
//! threads around, and the output layer format.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the sole mutable bundle under the rootfs directory.
pub const WORKING_DIR: &str = ".working";

/// Directory layout for a build.
///
/// ```text
/// oci_dir/                  output OCI image layout
/// rootfs_dir/
/// ├── .working/             active bundle (rootfs/, mtree, bundle meta)
/// └── <name>/               per-layer snapshot bundles
/// strata_dir/
/// ├── layer-bases/          cached tarball bases
/// ├── layer-bases/oci/      OCI layout of imported base images
/// └── imports/<name>/       staged import files per recipe layer
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Path to the output OCI image layout
    pub oci_dir: PathBuf,
    /// Parent of per-layer rootfs bundles
    pub rootfs_dir: PathBuf,
    /// Scratch area: layer-base cache and staged imports
    pub strata_dir: PathBuf,
}

impl StrataConfig {
    /// The active bundle path (`rootfs_dir/.working`).
    pub fn working_dir(&self) -> PathBuf {
        self.rootfs_dir.join(WORKING_DIR)
    }

    /// A bundle path by name (`rootfs_dir/<name>`).
    pub fn bundle_dir(&self, name: &str) -> PathBuf {
        self.rootfs_dir.join(name)
    }

    /// Cache directory for downloaded tarball bases.
    pub fn layer_bases(&self) -> PathBuf {
        self.strata_dir.join("layer-bases")
    }

    /// OCI layout caching imported base images.
    pub fn layer_base_oci(&self) -> PathBuf {
        self.layer_bases().join("oci")
    }

    /// Staging directory for a layer's import files.
    pub fn imports_dir(&self, name: &str) -> PathBuf {
        self.strata_dir.join("imports").join(name)
    }
}

/// Output format for generated image layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    /// Standard tar+gzip layers (default).
    Tar,
    /// A single squashfs blob per image.
    Squashfs,
}

impl Default for LayerType {
    fn default() -> Self {
        Self::Tar
    }
}

impl std::fmt::Display for LayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tar => write!(f, "tar"),
            Self::Squashfs => write!(f, "squashfs"),
        }
    }
}

impl std::str::FromStr for LayerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tar" => Ok(Self::Tar),
            "squashfs" => Ok(Self::Squashfs),
            _ => Err(format!("unknown layer type: '{}' (supported: tar, squashfs)", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config() -> StrataConfig {
        StrataConfig {
            oci_dir: PathBuf::from("/build/oci"),
            rootfs_dir: PathBuf::from("/build/roots"),
            strata_dir: PathBuf::from("/build/.strata"),
        }
    }

    #[test]
    fn test_path_helpers() {
        let c = config();
        assert_eq!(c.working_dir(), Path::new("/build/roots/.working"));
        assert_eq!(c.bundle_dir("web"), Path::new("/build/roots/web"));
        assert_eq!(c.layer_base_oci(), Path::new("/build/.strata/layer-bases/oci"));
        assert_eq!(c.imports_dir("web"), Path::new("/build/.strata/imports/web"));
    }

    #[test]
    fn test_layer_type_from_str() {
        assert_eq!("tar".parse::<LayerType>().unwrap(), LayerType::Tar);
        assert_eq!("squashfs".parse::<LayerType>().unwrap(), LayerType::Squashfs);
        assert!("zip".parse::<LayerType>().is_err());
    }

    #[test]
    fn test_layer_type_display() {
        assert_eq!(LayerType::Tar.to_string(), "tar");
        assert_eq!(LayerType::Squashfs.to_string(), "squashfs");
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let c = config();
        let json = serde_json::to_string(&c).unwrap();
        let back: StrataConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.oci_dir, c.oci_dir);
        assert_eq!(back.rootfs_dir, c.rootfs_dir);
        assert_eq!(back.strata_dir, c.strata_dir);
    }
}
