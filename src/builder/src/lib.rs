//! Strata Builder - the layer build pipeline.
//!
//! This crate materializes a recipe's DAG of image layers: it acquires
//! base images (registry, tarball, local OCI layout, or scratch), applies
//! imported files, runs commands inside a bounded root filesystem, repacks
//! the result into OCI blobs, and emits an OCI image layout whose tags are
//! the recipe layer names. Builds are cached by content fingerprint.
//!
//! # Architecture
//!
//! ```text
//! Recipe ──▶ dependency order ──▶ per-layer pipeline
//!            {cache lookup → base import → file import → apply → run
//!             → (repack | snapshot) → commit → cache put}
//! ```
//!
//! Control flow is strictly sequential; each layer is fully done before
//! the next starts. External collaborators (rootfs storage, image copy,
//! containerized command execution) plug in through the traits in
//! [`storage`], [`copier`], and [`runner`].

pub mod base;
pub mod build;
pub mod bundle;
pub mod cache;
pub mod copier;
pub mod hash;
pub mod imports;
pub mod oci;
pub mod recipe;
pub mod reference;
pub mod runner;
pub mod squashfs;
pub mod storage;

// Re-export common types
pub use base::{get_base_layer, BaseLayerOpts};
pub use build::{Build, BuildArgs};
pub use cache::{BuildCache, CacheEntry};
pub use copier::{ImageCopier, ImageCopyOpts, LayoutCopier};
pub use hash::aggregate_hash;
pub use oci::OciLayout;
pub use recipe::{ImageSource, Layer, Recipe, SourceType};
pub use reference::tag_from_image_url;
pub use runner::{Applier, ChrootRunner, DefaultApplier, Runner};
pub use squashfs::MEDIA_TYPE_LAYER_SQUASHFS;
pub use storage::{DirStorage, Storage};

/// PATH injected into image configs when neither the recipe nor the base
/// image provides one.
pub const REASONABLE_DEFAULT_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Annotation recording the recipe directory's git version.
pub const GIT_VERSION_ANNOTATION: &str = "io.strata.build.git-version";

/// Annotation embedding the full post-substitution recipe text when the
/// recipe directory is not a git checkout.
pub const RECIPE_CONTENTS_ANNOTATION: &str = "io.strata.build.recipe";

/// Name of the generated run script inside the staged imports directory.
pub const RUN_SCRIPT: &str = ".strata-run.sh";

/// Mount point of the staged imports inside the build rootfs.
pub const IMPORTS_MOUNT: &str = "/strata";
