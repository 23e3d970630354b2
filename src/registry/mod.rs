//! Docker Registry HTTP API V2 client.

pub mod auth;
pub mod http;
pub mod ratelimit;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::container_specs::RawManifest;
use crate::error::{Error, Result};

pub use self::http::HttpRegistry;

/// A blob body as it comes off the wire. Dropping it closes the connection.
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

#[async_trait::async_trait]
pub trait ManifestStore: Send + Sync {
    /// `GET /v2/`, authorized the same way every other call is.
    async fn ping(&self) -> Result<()>;

    /// Repository names, following `Link` pagination lazily.
    fn catalog(&self, page_size: usize) -> BoxStream<'_, Result<String>>;

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Digest of the manifest `reference` points at, `None` when it does not exist.
    async fn manifest_exist(&self, repository: &str, reference: &str) -> Result<Option<String>>;

    async fn pull_manifest(
        &self,
        repository: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<RawManifest>;

    /// Returns the digest the registry reports for the stored manifest.
    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<String>;

    /// Deleting a manifest that is already gone succeeds.
    async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<()>;

    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        match self.manifest_exist(repository, tag).await? {
            Some(digest) => self.delete_manifest(repository, &digest).await,
            None => Err(Error::NotFound(format!("{}:{}", repository, tag))),
        }
    }
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn blob_exist(&self, repository: &str, digest: &str) -> Result<bool>;

    /// Size from `Content-Length` and the streamed body.
    async fn pull_blob(&self, repository: &str, digest: &str) -> Result<(u64, BlobStream)>;

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        stream: BlobStream,
    ) -> Result<()>;

    /// Cross repository mount within one registry. `false` when the registry
    /// declined and the blob has to be uploaded.
    async fn mount_blob(&self, from_repository: &str, digest: &str, repository: &str)
        -> Result<bool>;

    async fn delete_blob(&self, repository: &str, digest: &str) -> Result<()>;
}

pub trait Registry: ManifestStore + BlobStore {}

impl<T> Registry for T where T: ManifestStore + BlobStore {}
