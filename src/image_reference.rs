/// Last path segment of an image together with its tag or digest, e.g.
/// `busybox:latest` for `quay.io/busybox:latest`.
pub fn bare_name(image: &str) -> &str {
    image.rsplit('/').next().unwrap_or(image)
}

/// Whether `image` already lives in the trusted registry.
///
/// Plain byte-wise prefix test without any normalization. An empty
/// `trusted_registry` never matches, so an unconfigured policy treats every
/// image as untrusted.
pub fn matches_registry(image: &str, trusted_registry: &str) -> bool {
    if trusted_registry.is_empty() {
        return false;
    }
    image.starts_with(trusted_registry)
}

/// Image reference the container should use once its image was backed up:
/// the original registry and namespace are replaced by `backup_registry`.
pub fn rewrite_to_backup(image: &str, backup_registry: &str) -> String {
    format!("{}/{}", backup_registry, bare_name(image))
}
