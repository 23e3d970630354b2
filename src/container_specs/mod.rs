pub mod blob_reference;
pub mod manifest;
pub mod serde_impl;

pub use blob_reference::{BlobReference, BlobReferenceType};
pub use manifest::{Manifest, RawManifest};

pub const MEDIA_TYPE_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Accept list sent when looking up a manifest by tag or digest.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    MEDIA_TYPE_SCHEMA1_SIGNED,
    MEDIA_TYPE_SCHEMA2,
    MEDIA_TYPE_MANIFEST_LIST,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
];

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum SpecificationType {
    Oci,
    Docker,
}

impl Default for SpecificationType {
    fn default() -> Self {
        SpecificationType::Oci
    }
}

/// Registries that predate schema2 answer with a plain json content type.
pub fn normalize_content_type(content_type: &str) -> &str {
    if content_type.contains("application/json") {
        MEDIA_TYPE_SCHEMA1_SIGNED
    } else {
        content_type
            .split(';')
            .next()
            .map(|e| e.trim())
            .unwrap_or(content_type)
    }
}

/// `sha256:<hex>` of the given bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    use sha2::Digest;
    format!("sha256:{}", hex::encode(sha2::Sha256::digest(data)))
}

pub fn is_digest(reference: &str) -> bool {
    reference.starts_with("sha256:") || reference.starts_with("sha512:")
}
