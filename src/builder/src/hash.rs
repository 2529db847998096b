//! Aggregate content hash over a manifest's layer chain.

use sha2::{Digest, Sha256};
use strata_core::{Result, StrataError};

use crate::oci::spec::{Descriptor, ImageManifest, ANNOTATION_REF_NAME};

/// Compute a cumulative hash over a prefix of a manifest's layer chain.
///
/// The stringified digests of layers `[0..=k]` are fed into a SHA-256
/// hasher, where `k` is the index of `descriptor` in the chain. The
/// result identifies "the content of this image truncated at a given
/// layer": a recipe layer built atop a base is cache-keyed by the base
/// chain rather than the full base manifest, which may legitimately grow
/// later.
pub fn aggregate_hash(manifest: &ImageManifest, descriptor: &Descriptor) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut found = false;

    for layer in &manifest.layers {
        hasher.update(layer.digest.as_bytes());
        if layer.digest == descriptor.digest {
            found = true;
            break;
        }
    }

    if !found {
        let reference = manifest
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .cloned()
            .unwrap_or_default();
        return Err(StrataError::DescriptorNotInManifest {
            digest: descriptor.digest.clone(),
            reference,
        });
    }

    Ok(hex::encode(hasher.finalize()))
}
