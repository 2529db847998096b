//! Base-layer importer: materializes a layer's base into the `.working`
//! bundle and, for non-build-only layers, a tagged manifest in the output
//! layout.

use std::fs;
use std::path::Path;
use std::process::Command;

use strata_core::{LayerType, Result, StrataConfig, StrataError};

use crate::bundle::{self, BundleMeta};
use crate::copier::{ImageCopier, ImageCopyOpts};
use crate::oci::spec::{Descriptor, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_MANIFEST};
use crate::oci::OciLayout;
use crate::recipe::{Layer, Recipe, SourceType};
use crate::reference::tag_from_image_url;
use crate::squashfs::{mk_squashfs, MEDIA_TYPE_LAYER_SQUASHFS};

/// Everything the importer needs for one layer.
pub struct BaseLayerOpts<'a> {
    pub config: &'a StrataConfig,
    pub name: &'a str,
    pub target: &'a str,
    pub layer: &'a Layer,
    pub layer_type: LayerType,
    pub oci: &'a OciLayout,
    pub copier: &'a dyn ImageCopier,
}

/// Acquire a layer's base, dispatching on its source type.
pub fn get_base_layer(o: &BaseLayerOpts, recipe: &Recipe) -> Result<()> {
    // Drop any stale tag from an earlier build of this name
    o.oci.delete_reference(o.name)?;

    match o.layer.from.source_type {
        SourceType::Built => get_built(o, recipe),
        SourceType::Tar => get_tar(o),
        SourceType::Oci => get_oci(o),
        SourceType::Docker => get_docker(o),
        SourceType::Scratch => get_scratch(o),
    }
}

fn get_scratch(o: &BaseLayerOpts) -> Result<()> {
    bundle::init(&o.config.rootfs_dir.join(o.target))
}

fn get_docker(o: &BaseLayerOpts) -> Result<()> {
    run_copier(&o.layer.from.url, o, !o.layer.build_only)?;
    extract_output(o)
}

fn get_oci(o: &BaseLayerOpts) -> Result<()> {
    run_copier(&format!("oci:{}", o.layer.from.url), o, !o.layer.build_only)?;
    extract_output(o)
}

fn get_tar(o: &BaseLayerOpts) -> Result<()> {
    let cache_dir = o.config.layer_bases();
    fs::create_dir_all(&cache_dir)?;

    let tarball = acquire_tarball(&o.layer.from.url, &cache_dir)?;

    let bundle_path = o.config.rootfs_dir.join(o.target);
    bundle::init(&bundle_path)?;

    let rootfs = bundle_path.join("rootfs");
    let output = Command::new("tar")
        .arg("xf")
        .arg(&tarball)
        .arg("-C")
        .arg(&rootfs)
        .output()
        .map_err(|e| StrataError::SubprocessError {
            command: "tar".to_string(),
            output: e.to_string(),
        })?;
    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(StrataError::SubprocessError {
            command: "tar".to_string(),
            output: combined,
        });
    }

    Ok(())
}

/// Copy a local tarball into the layer-base cache, reusing a cached copy
/// with the same name.
fn acquire_tarball(url: &str, cache_dir: &Path) -> Result<std::path::PathBuf> {
    let source = Path::new(url);
    let file_name = source
        .file_name()
        .ok_or_else(|| StrataError::RecipeError(format!("bad tar url: {}", url)))?;
    let cached = cache_dir.join(file_name);

    if !cached.is_file() {
        if !source.is_file() {
            return Err(StrataError::RecipeError(format!(
                "tarball not found: {}",
                url
            )));
        }
        fs::copy(source, &cached)?;
    }
    Ok(cached)
}

/// Copy the layer's base image into the layer-base cache and, for
/// tar-type non-build-only layers, on to the output layout.
///
/// Re-copying over the cache is fine every time: copiers only transfer
/// blobs that changed. The cache is garbage-collected afterwards no
/// matter how the copy went.
fn run_copier(to_import: &str, o: &BaseLayerOpts, copy_to_output: bool) -> Result<()> {
    let tag = tag_from_image_url(to_import)?;

    let cache_dir = o.config.layer_base_oci();
    fs::create_dir_all(&cache_dir)?;

    let result = (|| -> Result<()> {
        o.copier.copy(&ImageCopyOpts {
            src: to_import.to_string(),
            dest: format!("oci:{}:{}", cache_dir.display(), tag),
            skip_tls: o.layer.from.insecure,
        })?;

        // For squashfs output the base manifest is synthesized after
        // unpack; copying the original tar blobs would be wasted work.
        if copy_to_output && o.layer_type == LayerType::Tar {
            o.copier.copy(&ImageCopyOpts {
                src: format!("oci:{}:{}", cache_dir.display(), tag),
                dest: format!("oci:{}:{}", o.config.oci_dir.display(), tag),
                skip_tls: false,
            })?;
        }
        Ok(())
    })();

    if let Ok(cache) = OciLayout::open(&cache_dir) {
        if let Err(e) = cache.gc() {
            tracing::debug!(error = %e, "layer-base cache GC failed");
        }
    }

    result
}

/// Unpack the imported base into the target bundle and, for squashfs
/// output, synthesize the final manifest from the unpacked rootfs.
fn extract_output(o: &BaseLayerOpts) -> Result<()> {
    let tag = o.layer.from.parse_tag()?;
    let target = o.config.rootfs_dir.join(o.target);
    println!("unpacking to {}", target.display());

    let base_cache = OciLayout::open(&o.config.layer_base_oci())?;
    bundle::unpack(&base_cache, &tag, &target)?;

    // Only user-named manifests belong in the output; the base tag may
    // have been copied there for the repack step's sake.
    o.oci.delete_reference(&tag)?;

    if o.layer_type == LayerType::Squashfs && !o.layer.build_only {
        o.oci.gc()?;

        let tmp_squashfs = mk_squashfs(o.config, "")?;
        let (layer_digest, layer_size) = o.oci.put_blob_file(tmp_squashfs.path())?;

        let mut manifest = base_cache.lookup_manifest(&tag)?;
        let mut config = base_cache.read_config(&manifest.config)?;

        // The whole chain collapses into one squashfs blob whose digest
        // doubles as the diff ID: squashfs has no canonical uncompressed
        // form to hash.
        manifest.layers = vec![Descriptor::new(
            MEDIA_TYPE_LAYER_SQUASHFS,
            layer_digest.clone(),
            layer_size,
        )];
        config.rootfs.diff_ids = vec![layer_digest];

        let (config_digest, config_size) = o.oci.put_blob_json(&config)?;
        manifest.config = Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, config_digest, config_size);

        let (manifest_digest, manifest_size) = o.oci.put_blob_json(&manifest)?;
        let descriptor =
            Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, manifest_digest, manifest_size);
        o.oci.update_reference(o.name, &descriptor)?;

        let bundle_path = o.config.working_dir();
        bundle::update_mtree_name(&bundle_path, &descriptor)?;
        bundle::write_meta(&bundle_path, &BundleMeta::new(Some(descriptor)))?;
    }

    Ok(())
}

/// Handle a `built` base: the `.working` bundle was already restored from
/// the parent's snapshot, but when the ultimate ancestor is a build-only
/// docker/oci import its manifest never reached the output layout, and
/// the final repack expects those blobs to be there.
fn get_built(o: &BaseLayerOpts, recipe: &Recipe) -> Result<()> {
    let base = recipe.base_of(o.layer)?;

    if !matches!(base.from.source_type, SourceType::Docker | SourceType::Oci) || !base.build_only {
        return Ok(());
    }

    let tag = base.from.parse_tag()?;
    let cache_dir = o.config.layer_base_oci();
    o.copier.copy(&ImageCopyOpts {
        src: format!("oci:{}:{}", cache_dir.display(), tag),
        dest: format!("oci:{}:{}", o.config.oci_dir.display(), tag),
        skip_tls: false,
    })?;

    // Keep the blobs, not the tag
    o.oci.delete_reference(&tag)
}
