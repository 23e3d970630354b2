use bytes::Bytes;
use http::header::HeaderMap;
use http::{Response, StatusCode, Uri};
use hyper::body::HttpBody as _;
use hyper::Body;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub(crate) async fn dump_body_to_string(response: &mut Response<Body>) -> Result<String> {
    let mut buffer = Vec::default();
    while let Some(chunk) = response.body_mut().data().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub(crate) async fn read_body_bytes(response: Response<Body>) -> Result<Bytes> {
    Ok(hyper::body::to_bytes(response.into_body()).await?)
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response<Body>) -> Result<T> {
    let body = read_body_bytes(response).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Maps an unexpected response onto the error kinds the engine understands.
pub(crate) async fn error_from_response(mut response: Response<Body>) -> Error {
    let status = response.status();
    let body = dump_body_to_string(&mut response)
        .await
        .unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => Error::Auth(format!("{}: {}", status, body.trim())),
        StatusCode::TOO_MANY_REQUESTS => {
            Error::RateLimited(format!("gave up after repeated 429 responses: {}", body.trim()))
        }
        _ => Error::registry(status, &body),
    }
}

/// Resolves a `Location` or `Link` target, which may omit scheme and host,
/// against the uri of the request that produced it.
pub(crate) fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    let location_uri = location.parse::<Uri>().map_err(|e| {
        Error::Internal(format!(
            "unable to parse location header {:?}: {}",
            location, e
        ))
    })?;
    if location_uri.host().is_some() {
        return Ok(location_uri);
    }
    let mut parts = base.clone().into_parts();
    parts.path_and_query = location_uri.path_and_query().cloned();
    Uri::from_parts(parts).map_err(|e| {
        Error::Internal(format!(
            "constructed an invalid uri from location {:?}: {}",
            location, e
        ))
    })
}

/// The `rel="next"` target of a `Link` header, used by catalog and tag pagination.
pub(crate) fn parse_link_next(headers: &HeaderMap, current: &Uri) -> Result<Option<Uri>> {
    for value in headers.get_all(http::header::LINK).iter() {
        let value = match value.to_str() {
            Ok(v) => v,
            Err(_) => continue,
        };
        for link in value.split(',') {
            let mut pieces = link.split(';');
            let target = match pieces.next() {
                Some(t) => t.trim(),
                None => continue,
            };
            let is_next = pieces.any(|p| {
                let p = p.trim().replace(' ', "");
                p == "rel=\"next\"" || p == "rel=next"
            });
            if is_next {
                let target = target.trim_start_matches('<').trim_end_matches('>');
                return resolve_location(current, target).map(Some);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_next() {
        let current: Uri = "https://registry.example.com/v2/_catalog?n=2".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::LINK,
            "</v2/_catalog?last=b&n=2>; rel=\"next\"".parse().unwrap(),
        );
        let next = parse_link_next(&headers, &current).unwrap().unwrap();
        assert_eq!(
            next.to_string(),
            "https://registry.example.com/v2/_catalog?last=b&n=2"
        );

        assert!(parse_link_next(&HeaderMap::new(), &current)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_resolve_location_keeps_absolute_targets() {
        let base: Uri = "http://127.0.0.1:5000/v2/a/blobs/uploads/".parse().unwrap();
        assert_eq!(
            resolve_location(&base, "https://s3.example.com/blob?sig=1")
                .unwrap()
                .to_string(),
            "https://s3.example.com/blob?sig=1"
        );
        assert_eq!(
            resolve_location(&base, "/v2/a/blobs/uploads/123?_state=x")
                .unwrap()
                .to_string(),
            "http://127.0.0.1:5000/v2/a/blobs/uploads/123?_state=x"
        );
    }
}
