//! Staging of per-layer import files.
//!
//! Every import named by a recipe layer is copied under
//! `strata_dir/imports/<name>/` before the cache is consulted, and its
//! content digest is recorded so cache entries can be invalidated when an
//! import changes on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use strata_core::{Result, StrataConfig, StrataError};

/// Stage a layer's imports and return `source → content digest`.
///
/// The staging directory is rebuilt from scratch each time so stale files
/// from earlier recipe revisions cannot leak into the build.
pub fn stage_imports(
    config: &StrataConfig,
    name: &str,
    imports: &[String],
) -> Result<BTreeMap<String, String>> {
    let dir = config.imports_dir(name);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;

    let mut digests = BTreeMap::new();
    for source in imports {
        let src = Path::new(source);
        let file_name = src.file_name().ok_or_else(|| {
            StrataError::RecipeError(format!("import has no basename: {}", source))
        })?;
        let dest = dir.join(file_name);

        if src.is_dir() {
            copy_dir_recursive(src, &dest)?;
        } else if src.is_file() {
            fs::copy(src, &dest)?;
        } else {
            return Err(StrataError::RecipeError(format!(
                "import not found: {}",
                source
            )));
        }

        digests.insert(source.clone(), hash_path(&dest)?);
        tracing::debug!(source = %source, layer = %name, "staged import");
    }

    Ok(digests)
}

/// Content digest of a file or directory tree.
///
/// Directories hash to the digest of their sorted `(path, file digest)`
/// pairs, so any rename or content change is visible.
pub fn hash_path(path: &Path) -> Result<String> {
    if path.is_dir() {
        let mut files = BTreeMap::new();
        collect_file_hashes(path, path, &mut files)?;

        let mut hasher = Sha256::new();
        for (relative, digest) in files {
            hasher.update(relative.as_bytes());
            hasher.update(digest.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    } else {
        let mut file = fs::File::open(path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }
}

fn collect_file_hashes(
    root: &Path,
    current: &Path,
    files: &mut BTreeMap<String, String>,
) -> Result<()> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_file_hashes(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| StrataError::Other(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            files.insert(relative, hash_path(&path)?);
        }
    }
    Ok(())
}

/// Recursively copy a directory.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
