//! Container image reference resolution.
//!
//! Images are converted ahead of time by an external helper and stored as
//! flat artifacts inside the image directory; the artifact name is a
//! filesystem-safe rendering of the image reference.

use crate::AgentResult;
use crate::Error;

/// The filename extension of on-disk image artifacts.
const IMAGE_EXTENSION: &str = ".sif";

/// The tag assumed when an image reference does not carry one.
const DEFAULT_TAG: &str = "latest";

/// Resolves an image reference to the basename of its on-disk artifact.
///
/// A registry scheme prefix such as `docker://` is stripped, a missing tag
/// defaults to `latest`, and path separators become underscores:
/// `tensorflow/serving:latest-gpu` resolves to
/// `tensorflow_serving_latest-gpu.sif`.
pub fn resolve(reference: &str) -> AgentResult<String> {
    let stripped = match reference.split_once("://") {
        Some((_, rest)) => rest,
        None => reference,
    };

    if stripped.is_empty() || stripped.chars().any(char::is_whitespace) {
        return Err(Error::Config(format!(
            "image reference `{reference}` cannot be resolved to an artifact name"
        )));
    }

    // A tag is a `:` that comes after the last path separator; anything else
    // is a registry port.
    let tagged = match stripped.rsplit_once(':') {
        Some((_, tag)) if !tag.contains('/') => stripped.to_string(),
        _ => format!("{stripped}:{DEFAULT_TAG}"),
    };

    let name: String = tagged
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            c => c,
        })
        .collect();

    Ok(format!("{name}{IMAGE_EXTENSION}"))
}
