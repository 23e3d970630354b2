use super::SpecificationType;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum BlobReferenceType {
    Config,
    Layer,
    /// Layers that must not be copied between registries, like windows base layers.
    ForeignLayer,
    /// A child manifest of an index or manifest list.
    Manifest,
    Other,
}
impl Default for BlobReferenceType {
    fn default() -> Self {
        BlobReferenceType::Other
    }
}

/// A descriptor `{mediaType, digest, size}` found inside a manifest.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct BlobReference {
    pub blob_reference_type: BlobReferenceType,
    pub specification_type: SpecificationType,
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

impl BlobReference {
    pub fn from_media_type(media_type: &str, digest: String, size: u64) -> BlobReference {
        let (specification_type, blob_reference_type) = classify(media_type);
        BlobReference {
            blob_reference_type,
            specification_type,
            media_type: media_type.to_string(),
            size,
            digest,
        }
    }

    /// Whether the referenced content lives in the blob store of the repository.
    pub fn is_transferable_blob(&self) -> bool {
        matches!(
            self.blob_reference_type,
            BlobReferenceType::Config | BlobReferenceType::Layer | BlobReferenceType::Other
        )
    }
}

pub(crate) fn classify(media_type: &str) -> (SpecificationType, BlobReferenceType) {
    match media_type {
        "application/vnd.oci.image.config.v1+json" => {
            (SpecificationType::Oci, BlobReferenceType::Config)
        }
        "application/vnd.docker.container.image.v1+json" => {
            (SpecificationType::Docker, BlobReferenceType::Config)
        }
        "application/vnd.oci.image.layer.v1.tar+gzip"
        | "application/vnd.oci.image.layer.v1.tar+zstd"
        | "application/vnd.oci.image.layer.v1.tar" => {
            (SpecificationType::Oci, BlobReferenceType::Layer)
        }
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
        | "application/vnd.oci.image.layer.nondistributable.v1.tar" => {
            (SpecificationType::Oci, BlobReferenceType::ForeignLayer)
        }
        "application/vnd.docker.image.rootfs.diff.tar.gzip"
        | "application/vnd.docker.image.rootfs.diff.tar" => {
            (SpecificationType::Docker, BlobReferenceType::Layer)
        }
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" => {
            (SpecificationType::Docker, BlobReferenceType::ForeignLayer)
        }
        super::MEDIA_TYPE_SCHEMA2 | super::MEDIA_TYPE_SCHEMA1_SIGNED | super::MEDIA_TYPE_SCHEMA1 => {
            (SpecificationType::Docker, BlobReferenceType::Manifest)
        }
        super::MEDIA_TYPE_OCI_MANIFEST => (SpecificationType::Oci, BlobReferenceType::Manifest),
        other if other.starts_with("application/vnd.docker") => {
            (SpecificationType::Docker, BlobReferenceType::Other)
        }
        _ => (SpecificationType::Oci, BlobReferenceType::Other),
    }
}
