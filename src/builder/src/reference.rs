//! Image URL parsing.
//!
//! Extracts the reference name under which an imported base image is
//! stored in the layer-base cache.

use strata_core::{Result, StrataError};

/// Extract a tag from a registry-style or OCI-layout URL.
///
/// Supported forms:
/// - `docker://[host[:port]/]path[:tag]`: the tag is the basename of the
///   path (before an optional `:tag`), or the host portion (before any
///   port) when there is no path. `docker://centos:latest` and
///   `docker://docker.io/library/centos:latest` both yield `centos`.
/// - `oci:<path>:<tag>`: the tag is the third colon-delimited field.
pub fn tag_from_image_url(url: &str) -> Result<String> {
    if url.starts_with("docker") {
        let Some(rest) = url.strip_prefix("docker://") else {
            return Err(StrataError::BadUrl(url.to_string()));
        };
        if rest.is_empty() {
            return Err(StrataError::BadUrl(url.to_string()));
        }

        let tag = match rest.split_once('/') {
            // basename of the path, before any `:tag`
            Some((_host, path)) => path
                .split(':')
                .next()
                .unwrap_or_default()
                .rsplit('/')
                .next()
                .unwrap_or_default(),
            // no path: the host, before any port
            None => rest.split(':').next().unwrap_or_default(),
        };

        if tag.is_empty() {
            return Err(StrataError::BadUrl(url.to_string()));
        }
        Ok(tag.to_string())
    } else if url.starts_with("oci") {
        let pieces: Vec<&str> = url.split(':').collect();
        if pieces.len() != 3 {
            return Err(StrataError::BadOciTag(url.to_string()));
        }
        Ok(pieces[2].to_string())
    } else {
        Err(StrataError::InvalidImageUrl(url.to_string()))
    }
}
