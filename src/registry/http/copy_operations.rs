use http::{Method, StatusCode};

use super::util::{error_from_response, resolve_location};
use crate::error::{Error, Result};

impl super::HttpRegistry {
    /// `POST /blobs/uploads/?mount=&from=`. A 201 means the blob is now linked
    /// into `repository`; a 202 means the registry opened an ordinary upload
    /// session instead, which is abandoned here.
    pub(super) async fn try_mount_from(
        &self,
        from_repository: &str,
        digest: &str,
        repository: &str,
    ) -> Result<bool> {
        let uri = self.repository_uri_from_path(
            repository,
            format!(
                "/blobs/uploads/?mount={}&from={}",
                urlencoding::encode(digest),
                urlencoding::encode(from_repository)
            ),
        )?;

        let r = self
            .http_client
            .request(&uri, (), |_, c| async move {
                c.method(Method::POST)
                    .header(http::header::CONTENT_LENGTH, 0)
                    .body(hyper::Body::empty())
                    .map_err(|e| e.into())
            })
            .await?;

        match r.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => {
                self.cancel_upload(&uri, &r, repository).await;
                Ok(false)
            }
            _ => Err(error_from_response(r).await),
        }
    }

    /// Opens and immediately cancels a blob upload to prove push access to
    /// `repository`. A refusal comes back as `Auth`.
    pub async fn check_push_access(&self, repository: &str) -> Result<()> {
        let uri = self.repository_uri_from_path(repository, "/blobs/uploads/")?;
        let r = self
            .http_client
            .request(&uri, (), |_, c| async move {
                c.method(Method::POST)
                    .header(http::header::CONTENT_LENGTH, 0)
                    .body(hyper::Body::empty())
                    .map_err(|e| e.into())
            })
            .await?;
        if r.status() != StatusCode::ACCEPTED {
            return Err(match error_from_response(r).await {
                Error::Registry { status, detail } if status.is_client_error() => Error::Auth(
                    format!("no write privilege on {}: {} {}", repository, status, detail),
                ),
                other => other,
            });
        }
        self.cancel_upload(&uri, &r, repository).await;
        Ok(())
    }

    async fn cancel_upload(&self, post_uri: &http::Uri, r: &http::Response<hyper::Body>, repository: &str) {
        let session = match r
            .headers()
            .get(http::header::LOCATION)
            .and_then(|e| e.to_str().ok())
            .map(|l| resolve_location(post_uri, l))
        {
            Some(Ok(session)) => session,
            _ => return,
        };
        if let Err(e) = self.http_client.request_simple(&session, Method::DELETE).await {
            tracing::debug!("failed to cancel upload session on {}: {}", repository, e);
        }
    }
}
