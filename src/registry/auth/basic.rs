use http::header::{HeaderValue, AUTHORIZATION};
use http::Request;
use hyper::Body;

use crate::error::{Error, Result};
use crate::model::Credential;
use crate::registry::http::Modifier;

pub struct BasicAuthorizer {
    header: HeaderValue,
}

impl BasicAuthorizer {
    pub fn new(credential: &Credential) -> Result<BasicAuthorizer> {
        use base64::prelude::*;

        let encoded = BASE64_STANDARD.encode(format!(
            "{}:{}",
            credential.access_key, credential.access_secret
        ));
        let mut header = HeaderValue::from_str(&format!("Basic {}", encoded))
            .map_err(|e| Error::Configuration(format!("invalid credential: {}", e)))?;
        header.set_sensitive(true);
        Ok(BasicAuthorizer { header })
    }
}

#[async_trait::async_trait]
impl Modifier for BasicAuthorizer {
    async fn modify(&self, request: &mut Request<Body>) -> Result<()> {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.header.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_header() {
        let authorizer = BasicAuthorizer::new(&Credential {
            access_key: "admin".to_string(),
            access_secret: "Harbor12345".to_string(),
        })
        .unwrap();
        let mut request = Request::builder()
            .uri("https://r/v2/")
            .body(Body::empty())
            .unwrap();
        authorizer.modify(&mut request).await.unwrap();
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Basic YWRtaW46SGFyYm9yMTIzNDU="
        );
    }
}
