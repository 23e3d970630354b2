use crate::container_specs::BlobReference;
use crate::error::{Error, Result};
use crate::registry::BlobStore;

use super::handlers::TransferContext;

pub const BYTES_IN_MB: u64 = 1024 * 1024;
pub const BYTES_IN_GB: u64 = BYTES_IN_MB * 1024;

pub fn size_to_string(size: u64) -> String {
    let gb = size / BYTES_IN_GB;
    let mb = size / BYTES_IN_MB;
    if gb > 0 {
        let gb_flt = (gb as f64) + ((mb % 1024) as f64) / 1024_f64;
        format!("{:.2} GB", gb_flt)
    } else if mb > 0 {
        format!("{} MB", mb)
    } else {
        format!("{} B", size)
    }
}

/// Blob work done by one job, written to its log when it finishes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionsTaken {
    already_present: usize,
    already_present_size: u64,

    mounted_from_source_repository: usize,
    mounted_from_source_repository_size: u64,

    copied_from_source_registry: usize,
    copied_from_source_registry_size: u64,
}

impl std::fmt::Display for ActionsTaken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "blobs already present: {} ({}), mounted: {} ({}), copied: {} ({})",
            self.already_present,
            size_to_string(self.already_present_size),
            self.mounted_from_source_repository,
            size_to_string(self.mounted_from_source_repository_size),
            self.copied_from_source_registry,
            size_to_string(self.copied_from_source_registry_size)
        )
    }
}

impl ActionsTaken {
    pub fn merge(&mut self, other: &ActionsTaken) {
        self.already_present += other.already_present;
        self.already_present_size += other.already_present_size;
        self.mounted_from_source_repository += other.mounted_from_source_repository;
        self.mounted_from_source_repository_size += other.mounted_from_source_repository_size;
        self.copied_from_source_registry += other.copied_from_source_registry;
        self.copied_from_source_registry_size += other.copied_from_source_registry_size;
    }

    pub fn already_present(blob: &BlobReference) -> ActionsTaken {
        ActionsTaken {
            already_present: 1,
            already_present_size: blob.size,
            ..Default::default()
        }
    }

    pub fn mounted_from_source_repository(blob: &BlobReference) -> ActionsTaken {
        ActionsTaken {
            mounted_from_source_repository: 1,
            mounted_from_source_repository_size: blob.size,
            ..Default::default()
        }
    }

    pub fn copied_from_source_registry(size: u64) -> ActionsTaken {
        ActionsTaken {
            copied_from_source_registry: 1,
            copied_from_source_registry_size: size,
            ..Default::default()
        }
    }

    pub fn is_mount(&self) -> bool {
        self.mounted_from_source_repository > 0
    }

    pub fn transferred(&self) -> usize {
        self.mounted_from_source_repository + self.copied_from_source_registry
    }

    pub fn is_empty(&self) -> bool {
        *self == ActionsTaken::default()
    }
}

/// Gets one missing blob into the destination repository: a cross repository
/// mount when both sides are the same registry, otherwise a streamed copy.
pub async fn ensure_present(ctx: &TransferContext, blob: &BlobReference) -> Result<ActionsTaken> {
    let source = ctx.source.registry();
    let destination = ctx.destination.registry();

    if destination.same_endpoint(source) && ctx.source_repository != ctx.dest_repository {
        match destination
            .mount_blob(&ctx.source_repository, &blob.digest, &ctx.dest_repository)
            .await
        {
            Ok(true) => return Ok(ActionsTaken::mounted_from_source_repository(blob)),
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(
                    "Failed to mount a missing digest between repositories, will copy: digest: {}, from: {}, to: {}; error: {}",
                    blob.digest, ctx.source_repository, ctx.dest_repository, e
                );
                if destination
                    .blob_exist(&ctx.dest_repository, &blob.digest)
                    .await?
                {
                    return Ok(ActionsTaken::mounted_from_source_repository(blob));
                }
            }
        }
    }

    let policy = destination.http_client().policy().clone();
    let mut attempt = 0;
    let mut rate_limited = 0;
    let mut refreshed = false;
    loop {
        match copy_blob(ctx, blob).await {
            Ok(size) => return Ok(ActionsTaken::copied_from_source_registry(size)),
            // The failed PUT already let the authorizer drop its token.
            Err(Error::Auth(e)) if !refreshed => {
                refreshed = true;
                tracing::debug!(
                    digest = blob.digest.as_str(),
                    "blob copy unauthorized, retrying: {}",
                    e
                );
            }
            Err(Error::RateLimited(e)) if rate_limited < policy.rate_limit_retries => {
                let wait = policy.backoff(rate_limited);
                rate_limited += 1;
                tracing::warn!(
                    digest = blob.digest.as_str(),
                    "blob copy rate limited, retrying in {:?}: {}",
                    wait, e
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let wait = policy.backoff(attempt);
                attempt += 1;
                tracing::warn!(
                    digest = blob.digest.as_str(),
                    "blob copy failed, retrying in {:?}: {}",
                    wait, e
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One streamed copy: a fresh read from the source into a fresh upload session.
async fn copy_blob(ctx: &TransferContext, blob: &BlobReference) -> Result<u64> {
    let (size, stream) = ctx
        .source
        .registry()
        .pull_blob(&ctx.source_repository, &blob.digest)
        .await?;
    tracing::debug!(
        digest = blob.digest.as_str(),
        "copying {} from {}",
        size_to_string(size),
        ctx.source_repository
    );
    ctx.destination
        .registry()
        .push_blob(&ctx.dest_repository, &blob.digest, size, stream)
        .await?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_to_string() {
        assert_eq!(size_to_string(512), "512 B");
        assert_eq!(size_to_string(3 * BYTES_IN_MB + 7), "3 MB");
        assert_eq!(size_to_string(BYTES_IN_GB + BYTES_IN_GB / 2), "1.50 GB");
    }

    #[test]
    fn test_merge_and_display() {
        let blob = BlobReference::from_media_type(
            "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "sha256:aa".to_string(),
            2 * BYTES_IN_MB,
        );
        let mut total = ActionsTaken::default();
        assert!(total.is_empty());
        total.merge(&ActionsTaken::already_present(&blob));
        total.merge(&ActionsTaken::copied_from_source_registry(10));
        assert_eq!(total.transferred(), 1);
        assert_eq!(
            total.to_string(),
            "blobs already present: 1 (2 MB), mounted: 0 (0 B), copied: 1 (10 B)"
        );
    }
}
