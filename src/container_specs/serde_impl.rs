use serde::Deserialize;

use super::{
    blob_reference::{classify, BlobReference, BlobReferenceType},
    manifest::Manifest,
    SpecificationType, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_SCHEMA1_SIGNED,
};
use serde::de::Error as SerdeError;

impl<'de> Deserialize<'de> for BlobReference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawVersion {
            #[serde(rename = "mediaType", default)]
            pub media_type: String,
            #[serde(default)]
            pub size: u64,
            pub digest: String,
        }
        let r = RawVersion::deserialize(deserializer)?;
        Ok(BlobReference::from_media_type(
            &r.media_type,
            r.digest,
            r.size,
        ))
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FsLayer {
            #[serde(rename = "blobSum")]
            pub blob_sum: String,
        }

        #[derive(Deserialize)]
        struct RawVersion {
            #[serde(rename = "schemaVersion")]
            pub schema_version: u16,
            #[serde(rename = "mediaType")]
            pub media_type: Option<String>,
            pub config: Option<BlobReference>,
            #[serde(default)]
            pub layers: Vec<BlobReference>,
            #[serde(default)]
            pub manifests: Vec<BlobReference>,
            #[serde(rename = "fsLayers", default)]
            pub fs_layers: Vec<FsLayer>,
        }
        let r = RawVersion::deserialize(deserializer)?;

        if r.schema_version == 1 {
            if r.fs_layers.is_empty() {
                return Err(D::Error::custom("schema1 manifest without fsLayers"));
            }
            let layers = r
                .fs_layers
                .into_iter()
                .map(|l| BlobReference {
                    blob_reference_type: BlobReferenceType::Layer,
                    specification_type: SpecificationType::Docker,
                    media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
                    size: 0,
                    digest: l.blob_sum,
                })
                .collect();
            return Ok(Manifest {
                schema_version: 1,
                media_type: MEDIA_TYPE_SCHEMA1_SIGNED.to_string(),
                specification_type: SpecificationType::Docker,
                config: None,
                layers,
                manifests: Vec::new(),
            });
        }

        let media_type = match r.media_type {
            Some(m) => m,
            None if !r.manifests.is_empty() => MEDIA_TYPE_OCI_INDEX.to_string(),
            None => MEDIA_TYPE_OCI_MANIFEST.to_string(),
        };
        if r.config.is_none() && r.manifests.is_empty() {
            return Err(D::Error::custom(format!(
                "manifest of type {} has neither a config nor child manifests",
                media_type
            )));
        }
        let (specification_type, _) = classify(&media_type);

        Ok(Manifest {
            schema_version: r.schema_version,
            media_type,
            specification_type,
            config: r.config,
            layers: r.layers,
            manifests: r.manifests,
        })
    }
}
