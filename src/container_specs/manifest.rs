use bytes::Bytes;

use super::{
    blob_reference::{BlobReference, BlobReferenceType},
    SpecificationType, MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
};
use crate::error::{Error, Result};

/// A manifest as it travels over the wire. The payload is kept byte for byte so
/// the destination computes the same digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub digest: String,
    pub media_type: String,
    pub payload: Bytes,
}

impl RawManifest {
    pub fn parse(&self) -> Result<Manifest> {
        Manifest::parse(&self.media_type, &self.payload)
    }
}

#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Manifest {
    pub schema_version: u16,
    pub media_type: String,
    pub specification_type: SpecificationType,
    pub config: Option<BlobReference>,
    pub layers: Vec<BlobReference>,
    pub manifests: Vec<BlobReference>,
}

impl Manifest {
    pub fn parse(media_type: &str, manifest_bytes: &[u8]) -> Result<Manifest> {
        let mut u: Manifest = serde_json::from_slice(manifest_bytes).map_err(|e| {
            Error::Internal(format!("unable to parse manifest of type {}: {}", media_type, e))
        })?;
        if !media_type.is_empty() {
            u.media_type = media_type.to_string();
        }
        Ok(u)
    }

    pub fn is_index(&self) -> bool {
        self.media_type == MEDIA_TYPE_OCI_INDEX
            || self.media_type == MEDIA_TYPE_MANIFEST_LIST
            || !self.manifests.is_empty()
    }

    /// The config descriptor of a schema2 or OCI image manifest.
    pub fn target(&self) -> Option<&BlobReference> {
        self.config.as_ref()
    }

    /// Everything the manifest points at: layers for images, child manifests for indexes.
    pub fn references(&self) -> Vec<&BlobReference> {
        self.layers.iter().chain(self.manifests.iter()).collect()
    }

    /// Digests of the blobs that must exist in the repository before the manifest
    /// can be pushed, in manifest order and without duplicates. Foreign layers are skipped.
    pub fn required_blobs(&self) -> Vec<String> {
        self.transferable_blobs()
            .into_iter()
            .map(|e| e.digest.clone())
            .collect()
    }

    /// Descriptors behind [`Manifest::required_blobs`].
    pub fn transferable_blobs(&self) -> Vec<&BlobReference> {
        let mut out: Vec<&BlobReference> = Vec::new();
        let candidates = self
            .references()
            .into_iter()
            .chain(self.target())
            .filter(|e| e.is_transferable_blob());
        for blob in candidates {
            if !out.iter().any(|d| d.digest == blob.digest) {
                out.push(blob);
            }
        }
        out
    }

    pub fn child_manifests(&self) -> Vec<&BlobReference> {
        self.manifests
            .iter()
            .filter(|e| {
                e.blob_reference_type == BlobReferenceType::Manifest
                    || e.blob_reference_type == BlobReferenceType::Other
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_specs::{MEDIA_TYPE_SCHEMA1_SIGNED, MEDIA_TYPE_SCHEMA2};

    const SCHEMA2: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1469,
            "digest": "sha256:cc"
        },
        "layers": [
            {"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 10, "digest": "sha256:aa"},
            {"mediaType": "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip", "size": 10, "digest": "sha256:ff"},
            {"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 10, "digest": "sha256:aa"}
        ]
    }"#;

    #[test]
    fn test_schema2_required_blobs_include_config() {
        let m = Manifest::parse(MEDIA_TYPE_SCHEMA2, SCHEMA2.as_bytes()).unwrap();
        assert_eq!(m.specification_type, SpecificationType::Docker);
        assert_eq!(m.target().map(|e| e.digest.as_str()), Some("sha256:cc"));
        assert_eq!(m.required_blobs(), vec!["sha256:aa", "sha256:cc"]);
        assert!(!m.is_index());
    }

    #[test]
    fn test_schema1_uses_fs_layers() {
        let payload = r#"{
            "schemaVersion": 1,
            "name": "library/alpine",
            "tag": "3.19",
            "fsLayers": [{"blobSum": "sha256:11"}, {"blobSum": "sha256:22"}, {"blobSum": "sha256:11"}],
            "signatures": []
        }"#;
        let m = Manifest::parse(MEDIA_TYPE_SCHEMA1_SIGNED, payload.as_bytes()).unwrap();
        assert_eq!(m.schema_version, 1);
        assert!(m.target().is_none());
        assert_eq!(m.required_blobs(), vec!["sha256:11", "sha256:22"]);
    }

    #[test]
    fn test_oci_index_children() {
        let payload = r#"{
            "schemaVersion": 2,
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "size": 7, "digest": "sha256:m1",
                 "platform": {"architecture": "amd64", "os": "linux"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "size": 7, "digest": "sha256:m2"}
            ]
        }"#;
        let m = Manifest::parse("", payload.as_bytes()).unwrap();
        assert!(m.is_index());
        assert_eq!(m.media_type, MEDIA_TYPE_OCI_INDEX);
        assert_eq!(m.child_manifests().len(), 2);
        assert!(m.required_blobs().is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Manifest::parse(MEDIA_TYPE_SCHEMA2, b"not json").is_err());
    }
}
