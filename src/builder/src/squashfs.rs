//! Squashfs blob generation via the host `mksquashfs` binary.

use std::path::PathBuf;
use std::process::Command;

use strata_core::{Result, StrataConfig, StrataError};
use tempfile::NamedTempFile;

/// Media type of a squashfs image layer.
pub const MEDIA_TYPE_LAYER_SQUASHFS: &str = "application/vnd.oci.image.layer.squashfs";

/// Build a squashfs of a root filesystem.
///
/// An empty `rootfs` means the current `.working` rootfs. The blob lands
/// in a temp file under `strata_dir` that is deleted on drop, so callers
/// copy it into a layout before letting it go.
pub fn mk_squashfs(config: &StrataConfig, rootfs: &str) -> Result<NamedTempFile> {
    let source = if rootfs.is_empty() {
        config.working_dir().join("rootfs")
    } else {
        PathBuf::from(rootfs)
    };

    std::fs::create_dir_all(&config.strata_dir)?;
    let tmp = tempfile::Builder::new()
        .prefix("strata-squashfs-")
        .tempfile_in(&config.strata_dir)?;

    let output = Command::new("mksquashfs")
        .arg(&source)
        .arg(tmp.path())
        .arg("-noappend")
        .output()
        .map_err(|e| StrataError::SubprocessError {
            command: "mksquashfs".to_string(),
            output: e.to_string(),
        })?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(StrataError::SubprocessError {
            command: "mksquashfs".to_string(),
            output: combined,
        });
    }

    Ok(tmp)
}
