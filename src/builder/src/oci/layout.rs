//! Content-addressed engine over an on-disk OCI image layout.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use strata_core::{Result, StrataError};

use super::spec::{
    Descriptor, ImageConfiguration, ImageIndex, ImageManifest, ANNOTATION_REF_NAME,
};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";

/// Handle to an OCI image layout directory.
///
/// The handle is stateless: every operation reads and writes the layout
/// on disk, so concurrent readers always observe committed state.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root_dir: PathBuf,
}

impl OciLayout {
    /// Create a fresh layout at `path` (must not already contain one).
    pub fn create(path: &Path) -> Result<Self> {
        fs::create_dir_all(path.join("blobs").join("sha256")).map_err(|e| {
            StrataError::OciError(format!(
                "failed to create layout at {}: {}",
                path.display(),
                e
            ))
        })?;
        fs::write(path.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)?;

        let layout = Self {
            root_dir: path.to_path_buf(),
        };
        layout.write_index(&ImageIndex::default())?;
        Ok(layout)
    }

    /// Open an existing layout, validating its structure.
    pub fn open(path: &Path) -> Result<Self> {
        for required in [OCI_LAYOUT_FILE, INDEX_FILE, "blobs"] {
            if !path.join(required).exists() {
                return Err(StrataError::OciError(format!(
                    "not a valid OCI layout: missing {} in {}",
                    required,
                    path.display()
                )));
            }
        }
        Ok(Self {
            root_dir: path.to_path_buf(),
        })
    }

    /// Open a layout, creating it first when absent.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if path.join(INDEX_FILE).exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Path of a blob by digest (`sha256:<hex>` or bare hex).
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
        self.root_dir.join("blobs").join(algorithm).join(hash)
    }

    /// Whether a blob with the given digest exists in the layout.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store raw bytes as a blob. Returns `(digest, size)`.
    pub fn put_blob(&self, data: &[u8]) -> Result<(String, i64)> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        let path = self.blob_path(&digest);
        if !path.exists() {
            fs::write(&path, data).map_err(|e| {
                StrataError::OciError(format!("failed to write blob {}: {}", digest, e))
            })?;
        }
        Ok((digest, data.len() as i64))
    }

    /// Store a file's contents as a blob without reading it all into
    /// memory. Returns `(digest, size)`.
    pub fn put_blob_file(&self, source: &Path) -> Result<(String, i64)> {
        let mut file = fs::File::open(source)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));

        let path = self.blob_path(&digest);
        if !path.exists() {
            fs::copy(source, &path).map_err(|e| {
                StrataError::OciError(format!("failed to copy blob {}: {}", digest, e))
            })?;
        }
        let size = fs::metadata(&path)?.len() as i64;
        Ok((digest, size))
    }

    /// Serialize a value as JSON and store it as a blob.
    pub fn put_blob_json<T: serde::Serialize>(&self, value: &T) -> Result<(String, i64)> {
        let data = serde_json::to_vec(value)?;
        self.put_blob(&data)
    }

    /// Read a blob's bytes.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest)).map_err(|e| {
            StrataError::OciError(format!("failed to read blob {}: {}", digest, e))
        })
    }

    /// Parse a manifest blob by digest.
    pub fn read_manifest(&self, digest: &str) -> Result<ImageManifest> {
        let data = self.read_blob(digest)?;
        serde_json::from_slice(&data)
            .map_err(|e| StrataError::OciError(format!("failed to parse manifest {}: {}", digest, e)))
    }

    /// Parse the image configuration referenced by a manifest.
    pub fn read_config(&self, descriptor: &Descriptor) -> Result<ImageConfiguration> {
        let data = self.read_blob(&descriptor.digest)?;
        serde_json::from_slice(&data).map_err(|e| {
            StrataError::OciError(format!("failed to parse config {}: {}", descriptor.digest, e))
        })
    }

    /// Resolve a reference name to its manifest descriptor.
    pub fn resolve_reference(&self, name: &str) -> Result<Option<Descriptor>> {
        let index = self.read_index()?;
        Ok(index
            .manifests
            .into_iter()
            .find(|d| d.ref_name() == Some(name)))
    }

    /// Resolve a reference and parse its manifest.
    pub fn lookup_manifest(&self, name: &str) -> Result<ImageManifest> {
        let descriptor = self.resolve_reference(name)?.ok_or_else(|| {
            StrataError::OciError(format!("reference not found: {}", name))
        })?;
        self.read_manifest(&descriptor.digest)
    }

    /// Point a reference name at a manifest descriptor, replacing any
    /// previous target.
    pub fn update_reference(&self, name: &str, descriptor: &Descriptor) -> Result<()> {
        let mut index = self.read_index()?;
        index.manifests.retain(|d| d.ref_name() != Some(name));

        let mut tagged = descriptor.clone();
        tagged
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_REF_NAME.to_string(), name.to_string());
        index.manifests.push(tagged);
        self.write_index(&index)
    }

    /// Remove a reference name. Removing an absent name is a no-op.
    pub fn delete_reference(&self, name: &str) -> Result<()> {
        let mut index = self.read_index()?;
        let before = index.manifests.len();
        index.manifests.retain(|d| d.ref_name() != Some(name));
        if index.manifests.len() != before {
            self.write_index(&index)?;
        }
        Ok(())
    }

    /// All reference names in the layout.
    pub fn list_references(&self) -> Result<Vec<String>> {
        let index = self.read_index()?;
        Ok(index
            .manifests
            .iter()
            .filter_map(|d| d.ref_name().map(|s| s.to_string()))
            .collect())
    }

    /// Delete blobs not reachable from any reference in the index.
    /// Returns the number of blobs removed.
    pub fn gc(&self) -> Result<usize> {
        let index = self.read_index()?;
        let mut reachable = HashSet::new();

        for manifest_desc in &index.manifests {
            reachable.insert(manifest_desc.digest.clone());
            // An unparseable manifest keeps only itself alive
            let Ok(manifest) = self.read_manifest(&manifest_desc.digest) else {
                continue;
            };
            reachable.insert(manifest.config.digest.clone());
            for layer in &manifest.layers {
                reachable.insert(layer.digest.clone());
            }
        }

        let blobs_dir = self.root_dir.join("blobs").join("sha256");
        let mut removed = 0;
        for entry in fs::read_dir(&blobs_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let digest = format!("sha256:{}", name);
            if !reachable.contains(&digest) {
                fs::remove_file(entry.path())?;
                removed += 1;
                tracing::debug!(digest = %digest, "removed unreachable blob");
            }
        }
        Ok(removed)
    }

    fn read_index(&self) -> Result<ImageIndex> {
        let path = self.root_dir.join(INDEX_FILE);
        let data = fs::read_to_string(&path).map_err(|e| {
            StrataError::OciError(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| StrataError::OciError(format!("failed to parse index.json: {}", e)))
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let path = self.root_dir.join(INDEX_FILE);
        let mut file = fs::File::create(&path).map_err(|e| {
            StrataError::OciError(format!("failed to write {}: {}", path.display(), e))
        })?;
        file.write_all(serde_json::to_vec_pretty(index)?.as_slice())?;
        Ok(())
    }
}
