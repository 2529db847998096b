//! Image copy contract and the local layout-to-layout implementation.

use std::fs;
use std::path::PathBuf;

use strata_core::{Result, StrataError};

use crate::oci::OciLayout;

/// A single copy request between image URLs (`oci:<path>:<tag>` or
/// `docker://...`). The destination layout may or may not pre-exist.
#[derive(Debug, Clone)]
pub struct ImageCopyOpts {
    pub src: String,
    pub dest: String,
    pub skip_tls: bool,
}

/// Copies images between URLs. Re-copying content that already exists at
/// the destination must be a no-op.
pub trait ImageCopier {
    fn copy(&self, opts: &ImageCopyOpts) -> Result<()>;
}

/// Blob-level copier between local OCI layouts.
///
/// Registry transports are deliberately not handled here; builds that
/// import `docker://` bases inject a registry-capable copier.
pub struct LayoutCopier;

impl LayoutCopier {
    fn split_oci_url(url: &str) -> Result<(PathBuf, String)> {
        let rest = url
            .strip_prefix("oci:")
            .ok_or_else(|| StrataError::InvalidImageUrl(url.to_string()))?;
        let (path, tag) = rest
            .rsplit_once(':')
            .ok_or_else(|| StrataError::BadOciTag(url.to_string()))?;
        if path.is_empty() || tag.is_empty() {
            return Err(StrataError::BadOciTag(url.to_string()));
        }
        Ok((PathBuf::from(path), tag.to_string()))
    }
}

impl ImageCopier for LayoutCopier {
    fn copy(&self, opts: &ImageCopyOpts) -> Result<()> {
        let (src_path, src_tag) = Self::split_oci_url(&opts.src)?;
        let (dest_path, dest_tag) = Self::split_oci_url(&opts.dest)?;

        let src = OciLayout::open(&src_path)?;
        fs::create_dir_all(&dest_path)?;
        let dest = OciLayout::open_or_create(&dest_path)?;

        let descriptor = src.resolve_reference(&src_tag)?.ok_or_else(|| {
            StrataError::OciError(format!(
                "tag {} not found in {}",
                src_tag,
                src_path.display()
            ))
        })?;
        let manifest = src.read_manifest(&descriptor.digest)?;

        let mut blobs = vec![descriptor.digest.clone(), manifest.config.digest.clone()];
        blobs.extend(manifest.layers.iter().map(|l| l.digest.clone()));

        for digest in blobs {
            if dest.has_blob(&digest) {
                continue;
            }
            let source_blob = src.blob_path(&digest);
            fs::copy(&source_blob, dest.blob_path(&digest)).map_err(|e| {
                StrataError::OciError(format!("failed to copy blob {}: {}", digest, e))
            })?;
        }

        dest.update_reference(&dest_tag, &descriptor)?;
        tracing::debug!(
            src = %opts.src,
            dest = %opts.dest,
            layers = manifest.layers.len(),
            "copied image between layouts"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle;
    use tempfile::TempDir;

    fn image_with_content(tmp: &TempDir, name: &str) -> OciLayout {
        let layout = OciLayout::create(&tmp.path().join(name)).unwrap();
        let source = tmp.path().join(format!("{}-bundle", name));
        bundle::init(&source).unwrap();
        fs::write(source.join("rootfs/id"), name).unwrap();
        bundle::repack(&layout, "app", &source).unwrap();
        layout
    }

    #[test]
    fn test_split_oci_url() {
        let (path, tag) = LayoutCopier::split_oci_url("oci:/srv/images:web").unwrap();
        assert_eq!(path, PathBuf::from("/srv/images"));
        assert_eq!(tag, "web");

        assert!(LayoutCopier::split_oci_url("oci:no-tag-here").is_err());
        assert!(LayoutCopier::split_oci_url("docker://alpine").is_err());
    }

    #[test]
    fn test_copy_into_fresh_layout() {
        let tmp = TempDir::new().unwrap();
        let src = image_with_content(&tmp, "src");

        let dest_path = tmp.path().join("dest");
        LayoutCopier
            .copy(&ImageCopyOpts {
                src: format!("oci:{}:app", src.root_dir().display()),
                dest: format!("oci:{}:copied", dest_path.display()),
                skip_tls: false,
            })
            .unwrap();

        let dest = OciLayout::open(&dest_path).unwrap();
        let manifest = dest.lookup_manifest("copied").unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert!(dest.has_blob(&manifest.layers[0].digest));
        assert!(dest.has_blob(&manifest.config.digest));
    }

    #[test]
    fn test_copy_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let src = image_with_content(&tmp, "src");
        let dest_path = tmp.path().join("dest");

        let opts = ImageCopyOpts {
            src: format!("oci:{}:app", src.root_dir().display()),
            dest: format!("oci:{}:app", dest_path.display()),
            skip_tls: false,
        };
        LayoutCopier.copy(&opts).unwrap();
        LayoutCopier.copy(&opts).unwrap();

        let dest = OciLayout::open(&dest_path).unwrap();
        assert_eq!(dest.list_references().unwrap(), vec!["app".to_string()]);
    }

    #[test]
    fn test_copy_missing_tag_fails() {
        let tmp = TempDir::new().unwrap();
        let src = image_with_content(&tmp, "src");
        let result = LayoutCopier.copy(&ImageCopyOpts {
            src: format!("oci:{}:ghost", src.root_dir().display()),
            dest: format!("oci:{}:x", tmp.path().join("dest").display()),
            skip_tls: false,
        });
        assert!(matches!(result, Err(StrataError::OciError(_))));
    }
}
