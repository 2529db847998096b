//! The build driver: walks the recipe's dependency order and runs the
//! per-layer pipeline.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use strata_core::{LayerType, Result, StrataConfig, StrataError, WORKING_DIR};

use crate::base::{get_base_layer, BaseLayerOpts};
use crate::bundle::{self, BundleMeta};
use crate::cache::BuildCache;
use crate::copier::ImageCopier;
use crate::imports::stage_imports;
use crate::oci::spec::{Descriptor, History, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_MANIFEST};
use crate::oci::OciLayout;
use crate::recipe::{Layer, Recipe, SourceType};
use crate::runner::{Applier, Runner};
use crate::storage::Storage;
use crate::{
    GIT_VERSION_ANNOTATION, IMPORTS_MOUNT, REASONABLE_DEFAULT_PATH, RECIPE_CONTENTS_ANNOTATION,
    RUN_SCRIPT,
};

/// Options for one build invocation.
#[derive(Debug, Clone)]
pub struct BuildArgs {
    pub config: StrataConfig,
    /// Directory the recipe lives in; used for the git-version annotation.
    pub recipe_dir: PathBuf,
    /// Keep the storage driver attached after the build.
    pub leave_unladen: bool,
    /// Wipe the scratch area (including the build cache) first.
    pub no_cache: bool,
    /// Shell command run inside the rootfs when a layer's commands fail.
    pub on_run_failure: Option<String>,
    pub layer_type: LayerType,
}

/// A build: the driver plus its injected collaborators.
pub struct Build<'a> {
    opts: &'a BuildArgs,
    recipe: &'a Recipe,
    storage: &'a dyn Storage,
    copier: &'a dyn ImageCopier,
    applier: &'a dyn Applier,
    runner: &'a dyn Runner,
}

impl<'a> Build<'a> {
    pub fn new(
        opts: &'a BuildArgs,
        recipe: &'a Recipe,
        storage: &'a dyn Storage,
        copier: &'a dyn ImageCopier,
        applier: &'a dyn Applier,
        runner: &'a dyn Runner,
    ) -> Self {
        Self {
            opts,
            recipe,
            storage,
            copier,
            applier,
            runner,
        }
    }

    /// Build every layer in dependency order.
    ///
    /// All errors abort the build. The storage driver is detached on
    /// every exit path unless `leave_unladen` is set; the final GC of the
    /// output layout is best-effort.
    pub fn build(&self) -> Result<()> {
        let config = &self.opts.config;

        if self.opts.no_cache && config.strata_dir.exists() {
            fs::remove_dir_all(&config.strata_dir)?;
        }
        fs::create_dir_all(&config.strata_dir)?;
        fs::create_dir_all(&config.rootfs_dir)?;

        let oci = OciLayout::open_or_create(&config.oci_dir)?;

        let result = self.build_layers(&oci);

        if !self.opts.leave_unladen {
            if let Err(e) = self.storage.detach() {
                tracing::warn!(error = %e, "storage detach failed");
            }
        }

        if result.is_ok() {
            if let Err(e) = oci.gc() {
                println!("final OCI GC failed: {}", e);
            }
        }

        result
    }

    fn build_layers(&self, oci: &OciLayout) -> Result<()> {
        let mut cache = BuildCache::open(&self.opts.config, self.recipe)?;
        let git_version = git_version(&self.opts.recipe_dir);
        let author = build_author();

        self.storage.delete(WORKING_DIR)?;
        for name in self.recipe.build_order() {
            self.build_layer(oci, &mut cache, name, &author, git_version.as_deref())?;
        }
        Ok(())
    }

    fn build_layer(
        &self,
        oci: &OciLayout,
        cache: &mut BuildCache,
        name: &str,
        author: &str,
        git_version: Option<&str>,
    ) -> Result<()> {
        let config = &self.opts.config;
        let layer = self
            .recipe
            .get(name)
            .ok_or_else(|| StrataError::RecipeError(format!("{} not present in recipe?", name)))?;

        println!("building image {}...", name);

        // Imports come first: cached layers are compared against them
        println!("importing files...");
        let import_digests = stage_imports(config, name, &layer.imports)?;

        if let Some(entry) = cache.lookup(oci, self.storage, name, &import_digests)? {
            if !layer.build_only {
                let descriptor = entry.descriptor.ok_or_else(|| {
                    StrataError::CacheError(format!("cached layer {} has no descriptor", name))
                })?;
                oci.update_reference(name, &descriptor)?;
            }
            println!("found cached layer {}", name);
            return Ok(());
        }

        if self.opts.layer_type == LayerType::Squashfs
            && !layer.build_only
            && !layer.run.is_empty()
        {
            return Err(StrataError::RecipeError(format!(
                "layer {}: squashfs output is generated at base import, run commands would be lost",
                name
            )));
        }

        self.storage.delete(WORKING_DIR)?;
        if layer.from.source_type == SourceType::Built {
            self.storage.restore(&layer.from.tag, WORKING_DIR)?;
        } else {
            self.storage.create(WORKING_DIR)?;
        }

        let base_opts = BaseLayerOpts {
            config,
            name,
            target: WORKING_DIR,
            layer,
            layer_type: self.opts.layer_type,
            oci,
            copier: self.copier,
        };
        get_base_layer(&base_opts, self.recipe)?;

        println!("running commands...");
        if !layer.run.is_empty() {
            let script = format!("#!/bin/bash -xe\n{}", layer.run.join("\n"));
            let script_path = config.imports_dir(name).join(RUN_SCRIPT);
            fs::write(&script_path, script)?;
            fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
        }

        self.applier.apply(config, name)?;

        if !layer.run.is_empty() {
            println!("running commands for {}", name);
            self.runner.run(
                config,
                name,
                &format!("{}/{}", IMPORTS_MOUNT, RUN_SCRIPT),
                layer,
                self.opts.on_run_failure.as_deref(),
            )?;
        }

        // The staged payload lives only for the run step
        let staged = config
            .working_dir()
            .join("rootfs")
            .join(IMPORTS_MOUNT.trim_start_matches('/'));
        let _ = fs::remove_dir_all(&staged);

        if layer.build_only {
            // Descendants import from the snapshot; nothing reaches the
            // output image.
            self.storage.delete(name)?;
            self.storage.snapshot(WORKING_DIR, name)?;
            println!("build only layer, skipping OCI diff generation");
            cache.put(name, None, import_digests)?;
            return Ok(());
        }

        println!("generating layer...");
        let descriptor = match self.opts.layer_type {
            LayerType::Tar => {
                bundle::repack(oci, name, &config.working_dir())?;
                let descriptor =
                    self.mutate_image_config(oci, name, layer, author, git_version)?;

                let bundle_path = config.working_dir();
                bundle::update_mtree_name(&bundle_path, &descriptor)?;
                bundle::write_meta(&bundle_path, &BundleMeta::new(Some(descriptor.clone())))?;
                descriptor
            }
            // The squashfs manifest was committed during base import
            LayerType::Squashfs => oci.resolve_reference(name)?.ok_or_else(|| {
                StrataError::OciError(format!(
                    "no reference for {} after squashfs base import",
                    name
                ))
            })?,
        };

        // Replace the snapshot; this build is now the canonical state
        self.storage.delete(name)?;
        self.storage.snapshot(WORKING_DIR, name)?;

        println!("filesystem {} built successfully", name);

        cache.put(name, Some(descriptor), import_digests)?;
        Ok(())
    }

    /// Apply the recipe's image-config overrides and commit a new config
    /// and manifest for `name`. Returns the committed manifest descriptor.
    fn mutate_image_config(
        &self,
        oci: &OciLayout,
        name: &str,
        layer: &Layer,
        author: &str,
        git_version: Option<&str>,
    ) -> Result<Descriptor> {
        let descriptor = oci.resolve_reference(name)?.ok_or_else(|| {
            StrataError::OciError(format!("no reference for {} after repack", name))
        })?;
        let mut manifest = oci.read_manifest(&descriptor.digest)?;
        let mut config_doc = oci.read_config(&manifest.config)?;
        let mut image_config = config_doc.config.take().unwrap_or_default();

        let mut env = image_config.env.take().unwrap_or_default();
        let mut path_set = false;
        for (key, value) in &layer.environment {
            if key == "PATH" {
                path_set = true;
            }
            env.push(format!("{}={}", key, value));
        }
        if !path_set {
            path_set = env.iter().any(|e| e.starts_with("PATH="));
        }
        // If the user didn't specify a path, let's set a sane one
        if !path_set {
            env.push(format!("PATH={}", REASONABLE_DEFAULT_PATH));
        }
        image_config.env = Some(env);

        if let Some(cmd) = &layer.cmd {
            image_config.cmd = Some(cmd.clone());
        }
        if let Some(entrypoint) = &layer.entrypoint {
            image_config.entrypoint = Some(entrypoint.clone());
        }
        if let Some(full_command) = &layer.full_command {
            image_config.cmd = None;
            image_config.entrypoint = Some(full_command.clone());
        }

        if !layer.volumes.is_empty() {
            let volumes = image_config.volumes.get_or_insert_with(Default::default);
            for volume in &layer.volumes {
                volumes.insert(volume.clone(), serde_json::json!({}));
            }
        }
        if !layer.labels.is_empty() {
            let labels = image_config.labels.get_or_insert_with(Default::default);
            for (key, value) in &layer.labels {
                labels.insert(key.clone(), value.clone());
            }
        }
        if let Some(working_dir) = &layer.working_dir {
            if !working_dir.is_empty() {
                image_config.working_dir = Some(working_dir.clone());
            }
        }

        let created = chrono::Utc::now().to_rfc3339();
        config_doc.created = Some(created.clone());
        config_doc.architecture = crate::oci::spec::host_arch().to_string();
        config_doc.os = std::env::consts::OS.to_string();
        config_doc.author = Some(author.to_string());
        config_doc.config = Some(image_config);

        // This entry only records the config edit
        config_doc.history.push(History {
            created: Some(created),
            created_by: Some("strata build".to_string()),
            author: Some(author.to_string()),
            comment: None,
            empty_layer: true,
        });

        let annotations = manifest.annotations.get_or_insert_with(Default::default);
        match git_version {
            Some(version) => {
                println!("setting git version annotation to {}", version);
                annotations.insert(GIT_VERSION_ANNOTATION.to_string(), version.to_string());
            }
            None => {
                annotations.insert(
                    RECIPE_CONTENTS_ANNOTATION.to_string(),
                    self.recipe.after_substitutions().to_string(),
                );
            }
        }

        let (config_digest, config_size) = oci.put_blob_json(&config_doc)?;
        manifest.config = Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, config_digest, config_size);

        let (manifest_digest, manifest_size) = oci.put_blob_json(&manifest)?;
        let new_descriptor =
            Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, manifest_digest, manifest_size);
        oci.update_reference(name, &new_descriptor)?;
        Ok(new_descriptor)
    }
}

/// `git describe`-style version of a directory, when it is a git
/// checkout. Failures just mean "embed the recipe text instead".
fn git_version(dir: &Path) -> Option<String> {
    for args in [["describe", "--tags"], ["rev-parse", "HEAD"]] {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .ok()?;
        if output.status.success() {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !version.is_empty() {
                return Some(version);
            }
        }
    }
    None
}

/// `user@host` recorded as the image author. `SUDO_USER` wins over the
/// invoking user so sudo builds attribute the human, not root.
fn build_author() -> String {
    let username = std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "root".to_string());
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", username, host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_author_shape() {
        let author = build_author();
        let (user, host) = author.split_once('@').expect("author is user@host");
        assert!(!user.is_empty());
        assert!(!host.is_empty());
    }

    #[test]
    fn test_git_version_of_non_checkout() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(git_version(tmp.path()).is_none());
    }
}
