//! OCI image layout support.
//!
//! This module provides the typed image-spec documents (manifest, config,
//! index, descriptor) and a content-addressed layout engine over an
//! on-disk OCI image layout:
//!
//! ```text
//! layout/
//! ├── oci-layout           (OCI layout marker)
//! ├── index.json           (image index; references live in annotations)
//! └── blobs/
//!     └── sha256/
//!         ├── <manifest>   (image manifest)
//!         ├── <config>     (image configuration)
//!         └── <layers>     (filesystem layers)
//! ```

mod layout;
pub mod spec;

pub use layout::OciLayout;
pub use spec::{
    Descriptor, History, ImageConfig, ImageConfiguration, ImageIndex, ImageManifest, RootFs,
    ANNOTATION_REF_NAME, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_INDEX,
    MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_LAYER_TAR, MEDIA_TYPE_LAYER_TAR_GZIP,
};
