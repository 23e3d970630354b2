use std::time::Duration;

use futures::TryStreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{Method, StatusCode};

use super::util::{error_from_response, resolve_location};
use crate::error::{Error, Result};
use crate::registry::{BlobStore, BlobStream};

/// Upload throughput assumed when stretching the per-call deadline for large blobs.
const MIN_UPLOAD_BYTES_PER_SEC: u64 = 1024 * 1024;

#[async_trait::async_trait]
impl BlobStore for super::HttpRegistry {
    async fn blob_exist(&self, repository: &str, digest: &str) -> Result<bool> {
        let uri = self.repository_uri_from_path(repository, format!("/blobs/{}", digest))?;
        let r = self.http_client.request_simple(&uri, Method::HEAD).await?;

        match r.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(error_from_response(r).await),
        }
    }

    async fn pull_blob(&self, repository: &str, digest: &str) -> Result<(u64, BlobStream)> {
        let uri = self.repository_uri_from_path(repository, format!("/blobs/{}", digest))?;
        let response = self.http_client.request_simple(&uri, Method::GET).await?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::NotFound(format!("blob {}@{}", repository, digest)))
            }
            _ => return Err(error_from_response(response).await),
        }

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|e| e.to_str().ok())
            .and_then(|e| e.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                Error::Internal(format!(
                    "response for blob {}@{} has no valid Content-Length",
                    repository, digest
                ))
            })?;

        let stream: BlobStream = Box::pin(response.into_body().map_err(Error::Transport));
        Ok((size, stream))
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        stream: BlobStream,
    ) -> Result<()> {
        let post_target_uri = self.repository_uri_from_path(repository, "/blobs/uploads/")?;
        // The POST answers with the location of the real upload.
        let r = self
            .http_client
            .request(&post_target_uri, (), |_, c| async move {
                c.method(Method::POST)
                    .header(CONTENT_LENGTH, 0)
                    .body(hyper::Body::empty())
                    .map_err(|e| e.into())
            })
            .await?;

        if r.status() != StatusCode::ACCEPTED {
            return Err(error_from_response(r).await);
        }

        let location_str = match r.headers().get(LOCATION).and_then(|e| e.to_str().ok()) {
            Some(l) => l.to_string(),
            None => {
                return Err(Error::Internal(format!(
                    "upload session for {} has no Location header",
                    post_target_uri
                )))
            }
        };
        let chr = if location_str.contains('?') { '&' } else { '?' };
        let location_uri = resolve_location(
            &post_target_uri,
            &format!(
                "{}{}digest={}",
                location_str,
                chr,
                urlencoding::encode(digest)
            ),
        )?;

        // A streamed body can only be sent once. The caller retries the whole
        // transfer with a fresh source stream and upload session.
        let deadline = self.http_client.policy().deadline
            + Duration::from_secs(size / MIN_UPLOAD_BYTES_PER_SEC);
        let same_origin = location_uri.authority() == post_target_uri.authority();
        let request = http::Request::builder()
            .method(Method::PUT)
            .uri(location_uri)
            .header(CONTENT_LENGTH, size)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(hyper::Body::wrap_stream(stream))?;
        let r = self
            .http_client
            .send_once(request, same_origin, deadline)
            .await?;

        if r.status() != StatusCode::CREATED && r.status() != StatusCode::OK {
            return Err(error_from_response(r).await);
        }

        tracing::debug!(
            repository,
            digest,
            size,
            "blob upload complete, stored at {:?}",
            r.headers().get(LOCATION)
        );
        Ok(())
    }

    async fn mount_blob(
        &self,
        from_repository: &str,
        digest: &str,
        repository: &str,
    ) -> Result<bool> {
        self.try_mount_from(from_repository, digest, repository)
            .await
    }

    async fn delete_blob(&self, repository: &str, digest: &str) -> Result<()> {
        let uri = self.repository_uri_from_path(repository, format!("/blobs/{}", digest))?;
        let r = self
            .http_client
            .request_simple(&uri, Method::DELETE)
            .await?;
        match r.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(error_from_response(r).await),
        }
    }
}
