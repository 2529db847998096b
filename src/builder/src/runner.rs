//! Command execution and import application inside the build rootfs.

use std::fs;
use std::process::Command;

use strata_core::{Result, StrataConfig, StrataError};

use crate::imports::copy_dir_recursive;
use crate::recipe::Layer;
use crate::{IMPORTS_MOUNT, REASONABLE_DEFAULT_PATH};

/// Executes a script inside a container rooted at the `.working` bundle.
///
/// `script` is the path of the script as seen from inside the rootfs.
/// `on_failure` optionally names a shell command to run in the rootfs
/// before a failure is returned (a debug shell, typically).
pub trait Runner {
    fn run(
        &self,
        config: &StrataConfig,
        name: &str,
        script: &str,
        layer: &Layer,
        on_failure: Option<&str>,
    ) -> Result<()>;
}

/// Copies a layer's staged imports into the build rootfs before commands
/// run, so scripts find them under `/strata`.
pub trait Applier {
    fn apply(&self, config: &StrataConfig, name: &str) -> Result<()>;
}

/// Host-`chroot` runner.
///
/// Commands execute with a cleared environment (plus the layer's own
/// variables), so builds do not observe the host environment.
pub struct ChrootRunner;

impl Runner for ChrootRunner {
    fn run(
        &self,
        config: &StrataConfig,
        name: &str,
        script: &str,
        layer: &Layer,
        on_failure: Option<&str>,
    ) -> Result<()> {
        let rootfs = config.working_dir().join("rootfs");

        let mut cmd = Command::new("chroot");
        cmd.arg(&rootfs).arg(script);
        cmd.env_clear();
        cmd.env("PATH", REASONABLE_DEFAULT_PATH);
        cmd.env("HOME", "/root");
        for (key, value) in &layer.environment {
            cmd.env(key, value);
        }

        let status = cmd.status().map_err(|e| StrataError::SubprocessError {
            command: format!("chroot {}", script),
            output: e.to_string(),
        })?;

        if !status.success() {
            if let Some(shell) = on_failure {
                tracing::warn!(layer = %name, "run failed, executing on-failure command");
                let _ = Command::new("chroot")
                    .arg(&rootfs)
                    .arg("/bin/sh")
                    .arg("-c")
                    .arg(shell)
                    .status();
            }
            return Err(StrataError::SubprocessError {
                command: format!("run commands for {}", name),
                output: format!("exit status: {}", status),
            });
        }

        Ok(())
    }
}

/// Default applier: stages imports by copying them into the rootfs at
/// [`IMPORTS_MOUNT`]. The driver removes the payload again after the run
/// step so staged files never leak into the image.
pub struct DefaultApplier;

impl Applier for DefaultApplier {
    fn apply(&self, config: &StrataConfig, name: &str) -> Result<()> {
        let staged = config.imports_dir(name);
        if !staged.is_dir() {
            return Ok(());
        }

        let target = config
            .working_dir()
            .join("rootfs")
            .join(IMPORTS_MOUNT.trim_start_matches('/'));
        fs::create_dir_all(&target)?;
        copy_dir_recursive(&staged, &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> StrataConfig {
        StrataConfig {
            oci_dir: tmp.path().join("oci"),
            rootfs_dir: tmp.path().join("roots"),
            strata_dir: tmp.path().join(".strata"),
        }
    }

    #[test]
    fn test_default_applier_copies_staged_imports() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);

        let staged = config.imports_dir("web");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("setup.sh"), "#!/bin/sh\n").unwrap();

        fs::create_dir_all(config.working_dir().join("rootfs")).unwrap();
        DefaultApplier.apply(&config, "web").unwrap();

        assert!(config
            .working_dir()
            .join("rootfs/strata/setup.sh")
            .is_file());
    }

    #[test]
    fn test_default_applier_without_staged_imports_is_noop() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        fs::create_dir_all(config.working_dir().join("rootfs")).unwrap();
        DefaultApplier.apply(&config, "nothing-staged").unwrap();
        assert!(!config.working_dir().join("rootfs/strata").exists());
    }
}
