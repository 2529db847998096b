//! Persistent build cache keyed by recipe layer name.
//!
//! An entry proves that a layer was built from a known base chain, layer
//! definition, and import set. Lookups recompute the expected fingerprint
//! from current state and refuse hits whose artifacts no longer exist,
//! so deleting a snapshot or the output layout forces a rebuild.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_core::{Result, StrataConfig, StrataError};

use crate::hash::aggregate_hash;
use crate::imports::hash_path;
use crate::oci::spec::Descriptor;
use crate::oci::OciLayout;
use crate::recipe::{Recipe, SourceType};
use crate::storage::Storage;

const CACHE_FILE: &str = "build.cache.json";
const CACHE_VERSION: u32 = 1;

/// Fingerprint token for layers starting from an empty rootfs.
const SCRATCH_BASE: &str = "scratch";

/// One cached build result.
///
/// `descriptor` is absent for build-only layers; the entry's existence
/// then only proves the snapshot named `name` was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Descriptor>,
    #[serde(default)]
    pub imports: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

/// The cache for one recipe's builds, persisted under `strata_dir`.
pub struct BuildCache<'a> {
    config: &'a StrataConfig,
    recipe: &'a Recipe,
    entries: HashMap<String, CacheEntry>,
}

impl<'a> BuildCache<'a> {
    /// Load the cache from disk. A missing, unreadable, or
    /// version-mismatched cache file starts empty.
    pub fn open(config: &'a StrataConfig, recipe: &'a Recipe) -> Result<Self> {
        let path = config.strata_dir.join(CACHE_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<CacheFile>(&data) {
                Ok(file) if file.version == CACHE_VERSION => file.entries,
                Ok(file) => {
                    tracing::debug!(
                        found = file.version,
                        expected = CACHE_VERSION,
                        "cache version mismatch, starting empty"
                    );
                    HashMap::new()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable build cache, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            config,
            recipe,
            entries,
        })
    }

    /// Look up a layer. Returns a hit only when the recomputed
    /// fingerprint matches the stored one, the referenced artifact
    /// (descriptor blob and snapshot, or just the snapshot for build-only
    /// layers) still exists, and every import still hashes the same.
    pub fn lookup(
        &self,
        oci: &OciLayout,
        storage: &dyn Storage,
        name: &str,
        import_digests: &BTreeMap<String, String>,
    ) -> Result<Option<CacheEntry>> {
        let Some(expected) = self.fingerprint(name, import_digests)? else {
            return Ok(None);
        };
        let Some(entry) = self.entries.get(name) else {
            return Ok(None);
        };
        if entry.fingerprint != expected {
            tracing::debug!(layer = %name, "fingerprint changed, cache miss");
            return Ok(None);
        }

        let layer = self
            .recipe
            .get(name)
            .ok_or_else(|| StrataError::RecipeError(format!("{} not present in recipe?", name)))?;

        if layer.build_only {
            if !storage.exists(name) {
                tracing::debug!(layer = %name, "cached snapshot missing, cache miss");
                return Ok(None);
            }
        } else {
            match &entry.descriptor {
                Some(descriptor) if oci.has_blob(&descriptor.digest) => {}
                _ => {
                    tracing::debug!(layer = %name, "cached descriptor unresolvable, cache miss");
                    return Ok(None);
                }
            }
            if !storage.exists(name) {
                tracing::debug!(layer = %name, "snapshot for cached layer missing, cache miss");
                return Ok(None);
            }
        }

        if &entry.imports != import_digests {
            tracing::debug!(layer = %name, "import contents changed, cache miss");
            return Ok(None);
        }

        Ok(Some(entry.clone()))
    }

    /// Record a successful build and persist the cache.
    pub fn put(
        &mut self,
        name: &str,
        descriptor: Option<Descriptor>,
        import_digests: BTreeMap<String, String>,
    ) -> Result<()> {
        let fingerprint = self.fingerprint(name, &import_digests)?.ok_or_else(|| {
            StrataError::CacheError(format!(
                "base materials for {} missing after a successful build",
                name
            ))
        })?;

        self.entries.insert(
            name.to_string(),
            CacheEntry {
                name: name.to_string(),
                fingerprint,
                descriptor,
                imports: import_digests,
            },
        );
        self.persist()
    }

    /// Expected fingerprint for a layer given the current on-disk state.
    ///
    /// `None` means the base materials are not available yet (fresh
    /// checkout, wiped cache) which is always a miss, never an error.
    fn fingerprint(
        &self,
        name: &str,
        import_digests: &BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        let layer = self
            .recipe
            .get(name)
            .ok_or_else(|| StrataError::RecipeError(format!("{} not present in recipe?", name)))?;

        let base = match layer.from.source_type {
            SourceType::Scratch => Some(SCRATCH_BASE.to_string()),
            SourceType::Built => self
                .entries
                .get(&layer.from.tag)
                .map(|entry| entry.fingerprint.clone()),
            SourceType::Tar => {
                let file_name = Path::new(&layer.from.url).file_name().ok_or_else(|| {
                    StrataError::RecipeError(format!("bad tar url: {}", layer.from.url))
                })?;
                let tarball = self.config.layer_bases().join(file_name);
                if tarball.is_file() {
                    Some(hash_path(&tarball)?)
                } else {
                    None
                }
            }
            SourceType::Docker | SourceType::Oci => {
                let tag = layer.from.parse_tag()?;
                self.base_chain_hash(&tag)?
            }
        };

        let Some(base) = base else {
            return Ok(None);
        };

        let mut hasher = Sha256::new();
        hasher.update(base.as_bytes());
        hasher.update(serde_json::to_vec(layer)?);
        for (source, digest) in import_digests {
            hasher.update(source.as_bytes());
            hasher.update(digest.as_bytes());
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    /// Aggregate hash over the full layer chain of a cached base image.
    fn base_chain_hash(&self, tag: &str) -> Result<Option<String>> {
        let cache_dir = self.config.layer_base_oci();
        if !cache_dir.join("index.json").exists() {
            return Ok(None);
        }
        let layout = OciLayout::open(&cache_dir)?;
        if layout.resolve_reference(tag)?.is_none() {
            return Ok(None);
        }

        let manifest = layout.lookup_manifest(tag)?;
        match manifest.layers.last() {
            Some(last) => {
                let last = last.clone();
                Ok(Some(aggregate_hash(&manifest, &last)?))
            }
            None => Ok(Some("no-layers".to_string())),
        }
    }

    fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.config.strata_dir)?;
        let file = CacheFile {
            version: CACHE_VERSION,
            entries: self.entries.clone(),
        };
        fs::write(
            self.config.strata_dir.join(CACHE_FILE),
            serde_json::to_vec_pretty(&file)?,
        )?;
        Ok(())
    }
}
