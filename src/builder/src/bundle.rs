//! Bundle operations: init, unpack, and repack of root filesystems.
//!
//! A bundle is a directory holding a root filesystem plus the metadata
//! the repack step needs to diff it:
//!
//! ```text
//! bundle/
//! ├── rootfs/              the filesystem itself
//! ├── <digest>.mtree       snapshot of rootfs state at unpack/repack time
//! └── bundle.json          descriptor the bundle was unpacked from
//! ```
//!
//! The unpack source layout is an explicit argument; repack appends the
//! rootfs diff to the source manifest's layer chain and retags it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_core::{Result, StrataError};

use crate::oci::spec::{
    Descriptor, History, ImageConfiguration, ImageManifest, MEDIA_TYPE_IMAGE_CONFIG,
    MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_LAYER_TAR_GZIP,
};
use crate::oci::OciLayout;

const BUNDLE_META_FILE: &str = "bundle.json";
const BUNDLE_META_VERSION: u32 = 1;
const INIT_MTREE_NAME: &str = "scratch.mtree";
const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Bundle metadata: which manifest the rootfs was materialized from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Descriptor>,
}

impl BundleMeta {
    pub fn new(from: Option<Descriptor>) -> Self {
        Self {
            version: BUNDLE_META_VERSION,
            from,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FileEntry {
    size: u64,
    mtime: i64,
    mode: u32,
    kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

/// A snapshot of a root filesystem's state, persisted as the bundle's
/// mtree file and diffed against by repack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsSnapshot {
    entries: BTreeMap<String, FileEntry>,
}

impl FsSnapshot {
    /// Record every path under `root` with the metadata the diff compares.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        walk(root, root, &mut entries)?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths added or modified since `self`, and paths deleted.
    /// Both lists come back sorted.
    fn diff(&self, after: &FsSnapshot) -> (Vec<String>, Vec<String>) {
        let mut changed = Vec::new();
        for (path, entry) in &after.entries {
            match self.entries.get(path) {
                None => changed.push(path.clone()),
                Some(before) if before != entry => changed.push(path.clone()),
                Some(_) => {}
            }
        }

        let mut deleted: Vec<String> = self
            .entries
            .keys()
            .filter(|path| !after.entries.contains_key(*path))
            .cloned()
            .collect();

        // Children of a deleted directory are covered by its whiteout
        let deleted_snapshot = deleted.clone();
        deleted.retain(|path| {
            !deleted_snapshot
                .iter()
                .any(|other| *other != *path && path.starts_with(&format!("{}/", other)))
        });

        (changed, deleted)
    }
}

fn walk(root: &Path, current: &Path, entries: &mut BTreeMap<String, FileEntry>) -> Result<()> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)?;

        let relative = path
            .strip_prefix(root)
            .map_err(|e| StrataError::Other(format!("path outside rootfs: {}", e)))?
            .to_string_lossy()
            .into_owned();

        let kind = if metadata.file_type().is_symlink() {
            EntryKind::Symlink
        } else if metadata.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let target = if kind == EntryKind::Symlink {
            Some(fs::read_link(&path)?.to_string_lossy().into_owned())
        } else {
            None
        };

        entries.insert(
            relative,
            FileEntry {
                size: metadata.len(),
                mtime: metadata.mtime(),
                mode: metadata.mode(),
                kind,
                target,
            },
        );

        if metadata.is_dir() {
            walk(root, &path, entries)?;
        }
    }
    Ok(())
}

/// Initialize an empty bundle: bare `rootfs/`, empty snapshot, meta with
/// no source descriptor.
pub fn init(bundle: &Path) -> Result<()> {
    let rootfs = bundle.join("rootfs");
    fs::create_dir_all(&rootfs)?;

    let snapshot = FsSnapshot::capture(&rootfs)?;
    write_snapshot(bundle, INIT_MTREE_NAME, &snapshot)?;
    write_meta(bundle, &BundleMeta::new(None))
}

/// Unpack a tagged image from `layout` into `bundle/rootfs`.
pub fn unpack(layout: &OciLayout, tag: &str, bundle: &Path) -> Result<()> {
    let descriptor = layout.resolve_reference(tag)?.ok_or_else(|| {
        StrataError::OciError(format!(
            "tag {} not found in {}",
            tag,
            layout.root_dir().display()
        ))
    })?;
    let manifest = layout.read_manifest(&descriptor.digest)?;

    let rootfs = bundle.join("rootfs");
    fs::create_dir_all(&rootfs)?;

    for layer in &manifest.layers {
        extract_layer(&layout.blob_path(&layer.digest), &layer.media_type, &rootfs)?;
    }

    let snapshot = FsSnapshot::capture(&rootfs)?;
    write_snapshot(bundle, &mtree_name(&descriptor.digest), &snapshot)?;
    write_meta(bundle, &BundleMeta::new(Some(descriptor)))
}

/// Repack a bundle's rootfs into `layout` under `name`.
///
/// The diff against the bundle's saved snapshot becomes a new tar+gzip
/// layer appended to the source manifest's chain; an unchanged rootfs
/// re-tags the source manifest as-is. The bundle's snapshot and meta are
/// refreshed to the committed descriptor.
pub fn repack(layout: &OciLayout, name: &str, bundle: &Path) -> Result<Descriptor> {
    let meta = read_meta(bundle)?;
    let rootfs = bundle.join("rootfs");

    let before = read_snapshot(bundle)?;
    let after = FsSnapshot::capture(&rootfs)?;
    let (changed, deleted) = before.diff(&after);

    let (mut layers, mut config) = match &meta.from {
        Some(descriptor) => {
            let manifest = layout.read_manifest(&descriptor.digest)?;
            let config = layout.read_config(&manifest.config)?;
            (manifest.layers, config)
        }
        None => (Vec::new(), ImageConfiguration::default()),
    };

    if changed.is_empty() && deleted.is_empty() {
        // Nothing to add: re-tag the source manifest when there is one
        if let Some(descriptor) = &meta.from {
            layout.update_reference(name, descriptor)?;
            refresh(bundle, &after, descriptor)?;
            return Ok(descriptor.clone());
        }
    } else {
        let (diff_id, blob) = build_layer_blob(&rootfs, &changed, &deleted)?;
        let (digest, size) = layout.put_blob(&blob)?;
        tracing::debug!(
            layer = %digest,
            files = changed.len(),
            whiteouts = deleted.len(),
            "generated layer from bundle diff"
        );

        layers.push(Descriptor::new(MEDIA_TYPE_LAYER_TAR_GZIP, digest, size));
        config.rootfs.diff_ids.push(format!("sha256:{}", diff_id));
        config.history.push(History {
            created: Some(chrono::Utc::now().to_rfc3339()),
            created_by: Some("strata repack".to_string()),
            ..Default::default()
        });
    }

    let (config_digest, config_size) = layout.put_blob_json(&config)?;
    let manifest = ImageManifest::new(
        Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, config_digest, config_size),
        layers,
    );
    let (manifest_digest, manifest_size) = layout.put_blob_json(&manifest)?;
    let descriptor = Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, manifest_digest, manifest_size);

    layout.update_reference(name, &descriptor)?;
    refresh(bundle, &after, &descriptor)?;
    Ok(descriptor)
}

/// Rename the bundle's mtree file to match a new layer descriptor.
pub fn update_mtree_name(bundle: &Path, descriptor: &Descriptor) -> Result<()> {
    let new_name = mtree_name(&descriptor.digest);
    for entry in fs::read_dir(bundle)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".mtree") {
            if name != new_name {
                fs::rename(entry.path(), bundle.join(new_name))?;
            }
            return Ok(());
        }
    }
    Ok(())
}

/// Write bundle metadata pointing at `meta.from`.
pub fn write_meta(bundle: &Path, meta: &BundleMeta) -> Result<()> {
    fs::write(
        bundle.join(BUNDLE_META_FILE),
        serde_json::to_vec_pretty(meta)?,
    )?;
    Ok(())
}

/// Read bundle metadata.
pub fn read_meta(bundle: &Path) -> Result<BundleMeta> {
    let path = bundle.join(BUNDLE_META_FILE);
    let data = fs::read_to_string(&path).map_err(|e| {
        StrataError::Other(format!("failed to read bundle meta {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&data)?)
}

fn mtree_name(digest: &str) -> String {
    format!("{}.mtree", digest.replacen(':', "_", 1))
}

fn refresh(bundle: &Path, snapshot: &FsSnapshot, descriptor: &Descriptor) -> Result<()> {
    remove_snapshots(bundle)?;
    write_snapshot(bundle, &mtree_name(&descriptor.digest), snapshot)?;
    write_meta(bundle, &BundleMeta::new(Some(descriptor.clone())))
}

fn write_snapshot(bundle: &Path, name: &str, snapshot: &FsSnapshot) -> Result<()> {
    fs::write(bundle.join(name), serde_json::to_vec(snapshot)?)?;
    Ok(())
}

fn read_snapshot(bundle: &Path) -> Result<FsSnapshot> {
    for entry in fs::read_dir(bundle)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(".mtree") {
            let data = fs::read_to_string(entry.path())?;
            return Ok(serde_json::from_str(&data)?);
        }
    }
    Err(StrataError::Other(format!(
        "bundle {} has no mtree snapshot",
        bundle.display()
    )))
}

fn remove_snapshots(bundle: &Path) -> Result<()> {
    for entry in fs::read_dir(bundle)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(".mtree") {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Build a tar+gzip layer blob from a rootfs diff.
///
/// Returns the diff ID (hex SHA-256 of the uncompressed tar) and the
/// compressed bytes. Deletions become OCI whiteout entries.
fn build_layer_blob(
    rootfs: &Path,
    changed: &[String],
    deleted: &[String],
) -> Result<(String, Vec<u8>)> {
    let mut tar_buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_buf);
        builder.follow_symlinks(false);

        for path in changed {
            let full = rootfs.join(path);
            let Ok(metadata) = fs::symlink_metadata(&full) else {
                continue;
            };
            if metadata.is_dir() {
                builder.append_dir(path, &full)?;
            } else {
                builder.append_path_with_name(&full, path)?;
            }
        }

        for path in deleted {
            let whiteout = match path.rsplit_once('/') {
                Some((parent, base)) => format!("{}/{}{}", parent, WHITEOUT_PREFIX, base),
                None => format!("{}{}", WHITEOUT_PREFIX, path),
            };
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, &whiteout, std::io::empty())?;
        }

        builder.finish()?;
    }

    let diff_id = hex::encode(Sha256::digest(&tar_buf));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_buf)?;
    let blob = encoder.finish()?;

    Ok((diff_id, blob))
}

/// Extract a single layer blob into a rootfs, honoring OCI whiteouts.
fn extract_layer(blob: &Path, media_type: &str, rootfs: &Path) -> Result<()> {
    if media_type.contains("squashfs") {
        return Err(StrataError::OciError(format!(
            "cannot unpack squashfs layer {}",
            blob.display()
        )));
    }

    let file = fs::File::open(blob).map_err(|e| {
        StrataError::OciError(format!("failed to open layer {}: {}", blob.display(), e))
    })?;
    let reader: Box<dyn Read> = if media_type.contains("gzip") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        if file_name == OPAQUE_WHITEOUT {
            if let Some(parent) = path.parent() {
                clear_dir(&rootfs.join(parent))?;
            }
            continue;
        }

        if let Some(victim) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let target = match path.parent() {
                Some(parent) => rootfs.join(parent).join(victim),
                None => rootfs.join(victim),
            };
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else if target.exists() {
                fs::remove_file(&target)?;
            }
            continue;
        }

        entry.unpack_in(rootfs)?;
    }

    tracing::debug!(layer = %blob.display(), target = %rootfs.display(), "extracted layer");
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_layout(tmp: &TempDir) -> OciLayout {
        OciLayout::create(&tmp.path().join("oci")).unwrap()
    }

    #[test]
    fn test_init_creates_empty_bundle() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        init(&bundle).unwrap();

        assert!(bundle.join("rootfs").is_dir());
        assert!(bundle.join(INIT_MTREE_NAME).is_file());
        let meta = read_meta(&bundle).unwrap();
        assert!(meta.from.is_none());
    }

    #[test]
    fn test_snapshot_diff_add_modify_delete() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("keep.txt"), "same").unwrap();
        fs::write(root.join("change.txt"), "v1").unwrap();
        fs::write(root.join("remove.txt"), "bye").unwrap();

        let before = FsSnapshot::capture(root).unwrap();

        fs::write(root.join("change.txt"), "version two").unwrap();
        fs::write(root.join("new.txt"), "hello").unwrap();
        fs::remove_file(root.join("remove.txt")).unwrap();

        let after = FsSnapshot::capture(root).unwrap();
        let (changed, deleted) = before.diff(&after);

        assert_eq!(changed, vec!["change.txt".to_string(), "new.txt".to_string()]);
        assert_eq!(deleted, vec!["remove.txt".to_string()]);
    }

    #[test]
    fn test_snapshot_diff_collapses_deleted_subtree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("gone/deep")).unwrap();
        fs::write(root.join("gone/deep/file.txt"), "x").unwrap();

        let before = FsSnapshot::capture(root).unwrap();
        fs::remove_dir_all(root.join("gone")).unwrap();
        let after = FsSnapshot::capture(root).unwrap();

        let (_, deleted) = before.diff(&after);
        assert_eq!(deleted, vec!["gone".to_string()]);
    }

    #[test]
    fn test_repack_empty_bundle_produces_manifest_without_layers_on_no_change() {
        let tmp = TempDir::new().unwrap();
        let layout = new_layout(&tmp);
        let bundle = tmp.path().join("bundle");
        init(&bundle).unwrap();

        let descriptor = repack(&layout, "empty", &bundle).unwrap();
        let manifest = layout.read_manifest(&descriptor.digest).unwrap();
        assert!(manifest.layers.is_empty());
        assert!(layout.resolve_reference("empty").unwrap().is_some());
    }

    #[test]
    fn test_repack_captures_rootfs_changes() {
        let tmp = TempDir::new().unwrap();
        let layout = new_layout(&tmp);
        let bundle = tmp.path().join("bundle");
        init(&bundle).unwrap();

        fs::write(bundle.join("rootfs/foo"), "contents").unwrap();

        let descriptor = repack(&layout, "app", &bundle).unwrap();
        let manifest = layout.read_manifest(&descriptor.digest).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].media_type, MEDIA_TYPE_LAYER_TAR_GZIP);

        let config = layout.read_config(&manifest.config).unwrap();
        assert_eq!(config.rootfs.diff_ids.len(), 1);

        // The diff layer contains foo
        let blob = layout.read_blob(&manifest.layers[0].digest).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(&blob[..]));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"foo".to_string()));

        // The bundle was refreshed: the mtree is named for the new digest
        assert!(bundle.join(mtree_name(&descriptor.digest)).is_file());
        let meta = read_meta(&bundle).unwrap();
        assert_eq!(meta.from.unwrap().digest, descriptor.digest);
    }

    #[test]
    fn test_repack_then_repack_only_captures_new_changes() {
        let tmp = TempDir::new().unwrap();
        let layout = new_layout(&tmp);
        let bundle = tmp.path().join("bundle");
        init(&bundle).unwrap();

        fs::write(bundle.join("rootfs/a"), "first").unwrap();
        repack(&layout, "step1", &bundle).unwrap();

        fs::write(bundle.join("rootfs/b"), "second").unwrap();
        let descriptor = repack(&layout, "step2", &bundle).unwrap();

        let manifest = layout.read_manifest(&descriptor.digest).unwrap();
        assert_eq!(manifest.layers.len(), 2);

        let blob = layout.read_blob(&manifest.layers[1].digest).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(&blob[..]));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn test_repack_records_deletion_as_whiteout() {
        let tmp = TempDir::new().unwrap();
        let layout = new_layout(&tmp);
        let bundle = tmp.path().join("bundle");
        init(&bundle).unwrap();

        fs::write(bundle.join("rootfs/doomed"), "x").unwrap();
        repack(&layout, "step1", &bundle).unwrap();

        fs::remove_file(bundle.join("rootfs/doomed")).unwrap();
        let descriptor = repack(&layout, "step2", &bundle).unwrap();

        let manifest = layout.read_manifest(&descriptor.digest).unwrap();
        let blob = layout.read_blob(&manifest.layers[1].digest).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(&blob[..]));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![".wh.doomed".to_string()]);
    }

    #[test]
    fn test_unpack_round_trip() {
        let tmp = TempDir::new().unwrap();
        let layout = new_layout(&tmp);

        // Build an image by repacking a bundle with content
        let source = tmp.path().join("source");
        init(&source).unwrap();
        fs::create_dir_all(source.join("rootfs/etc")).unwrap();
        fs::write(source.join("rootfs/etc/issue"), "strata").unwrap();
        repack(&layout, "base", &source).unwrap();

        // Unpack it into a fresh bundle
        let bundle = tmp.path().join("bundle");
        unpack(&layout, "base", &bundle).unwrap();

        assert_eq!(
            fs::read_to_string(bundle.join("rootfs/etc/issue")).unwrap(),
            "strata"
        );
        let meta = read_meta(&bundle).unwrap();
        let from = meta.from.unwrap();
        assert!(bundle.join(mtree_name(&from.digest)).is_file());
    }

    #[test]
    fn test_unpack_applies_whiteouts_across_layers() {
        let tmp = TempDir::new().unwrap();
        let layout = new_layout(&tmp);

        let source = tmp.path().join("source");
        init(&source).unwrap();
        fs::write(source.join("rootfs/removed-later"), "x").unwrap();
        fs::write(source.join("rootfs/kept"), "y").unwrap();
        repack(&layout, "base", &source).unwrap();

        fs::remove_file(source.join("rootfs/removed-later")).unwrap();
        repack(&layout, "final", &source).unwrap();

        let bundle = tmp.path().join("bundle");
        unpack(&layout, "final", &bundle).unwrap();

        assert!(!bundle.join("rootfs/removed-later").exists());
        assert!(bundle.join("rootfs/kept").is_file());
    }

    #[test]
    fn test_unpack_unknown_tag() {
        let tmp = TempDir::new().unwrap();
        let layout = new_layout(&tmp);
        let bundle = tmp.path().join("bundle");
        assert!(unpack(&layout, "ghost", &bundle).is_err());
    }

    #[test]
    fn test_update_mtree_name() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        init(&bundle).unwrap();

        let descriptor = Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, "sha256:abcd", 1);
        update_mtree_name(&bundle, &descriptor).unwrap();

        assert!(bundle.join("sha256_abcd.mtree").is_file());
        assert!(!bundle.join(INIT_MTREE_NAME).exists());
    }

    #[test]
    fn test_mtree_name_replaces_first_colon_only() {
        assert_eq!(mtree_name("sha256:aa:bb"), "sha256_aa:bb.mtree");
    }
}
