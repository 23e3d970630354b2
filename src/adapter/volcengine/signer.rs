//! HMAC-SHA256 request signing for the Volcengine OpenAPI.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{HeaderName, HeaderValue};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HMAC-SHA256";

#[derive(Clone)]
pub struct Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .field("service", &self.service)
            .finish()
    }
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Internal(format!("failed to create HMAC: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl Signer {
    pub fn new(access_key: &str, secret_key: &str, region: &str, service: &str) -> Signer {
        Signer {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            region: region.to_string(),
            service: service.to_string(),
        }
    }

    fn signing_key(&self, date: &str) -> Result<Vec<u8>> {
        let k_date = hmac(self.secret_key.as_bytes(), date)?;
        let k_region = hmac(&k_date, &self.region)?;
        let k_service = hmac(&k_region, &self.service)?;
        hmac(&k_service, "request")
    }

    /// Headers to add to a request: `X-Date`, `X-Content-Sha256` and `Authorization`.
    ///
    /// `query` must already be in canonical form, keys sorted and values encoded.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query: &str,
        content_type: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Vec<(HeaderName, HeaderValue)>> {
        let x_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let short_date = &x_date[..8];
        let payload_hash = hex_sha256(body);

        let signed_headers = "content-type;host;x-content-sha256;x-date";
        let canonical_request = format!(
            "{}\n{}\n{}\ncontent-type:{}\nhost:{}\nx-content-sha256:{}\nx-date:{}\n\n{}\n{}",
            method,
            if path.is_empty() { "/" } else { path },
            query,
            content_type,
            host,
            payload_hash,
            x_date,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/{}/request", short_date, self.region, self.service);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            x_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac(&self.signing_key(short_date)?, &string_to_sign)?);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, scope, signed_headers, signature
        );
        let value = |v: String| {
            HeaderValue::from_str(&v)
                .map_err(|e| Error::Configuration(format!("unusable signing input: {}", e)))
        };
        let mut auth = value(authorization)?;
        auth.set_sensitive(true);
        Ok(vec![
            (HeaderName::from_static("x-date"), value(x_date.clone())?),
            (HeaderName::from_static("x-content-sha256"), value(payload_hash)?),
            (http::header::AUTHORIZATION, auth),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sign(body: &[u8]) -> Vec<(HeaderName, HeaderValue)> {
        let signer = Signer::new("AKLTtest", "c2VjcmV0", "cn-beijing", "cr");
        signer
            .sign(
                "POST",
                "open.volcengineapi.com",
                "/",
                "Action=ListNamespaces&Version=2022-05-12",
                "application/json",
                body,
                Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn test_signature_headers() {
        let headers = sign(b"{}");
        assert_eq!(headers[0].1, "20240301T083000Z");
        assert_eq!(
            headers[1].1,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        let auth = headers[2].1.to_str().unwrap();
        assert!(auth.starts_with(
            "HMAC-SHA256 Credential=AKLTtest/20240301/cn-beijing/cr/request, SignedHeaders=content-type;host;x-content-sha256;x-date, Signature="
        ));
        let signature = auth.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_signature_depends_on_body() {
        assert_eq!(sign(b"{}")[2].1, sign(b"{}")[2].1);
        assert_ne!(sign(b"{}")[2].1, sign(b"{\"a\":1}")[2].1);
    }
}
