//! Instance identity from the link-local metadata service.
//!
//! Only the session-token flavour of the protocol is spoken: a `PUT` to the
//! token endpoint yields a short-lived token, and every metadata read must
//! present it.  Plain unauthenticated reads are never attempted.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};

use super::IdentitySource;
use crate::error::ReclaimError;
use crate::types::InstanceIdentity;

const TOKEN_PATH: &str = "/latest/api/token";
const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";
const REGION_PATH: &str = "/latest/meta-data/placement/region";

const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

/// Longest token lifetime the metadata service hands out.
pub const MAX_TOKEN_TTL_SECS: u32 = 21_600;

/// Requests one `identify` makes in sequence: token, instance id, region.
pub const REQUESTS_PER_IDENTIFY: u32 = 3;

pub struct ImdsIdentity {
    client: Client,
    endpoint: String,
    token_ttl_secs: u32,
}

impl ImdsIdentity {
    pub fn new(
        endpoint: &str,
        token_ttl_secs: u32,
        timeout: Duration,
    ) -> Result<Self, ReclaimError> {
        // The endpoint is link-local; never route it through a proxy.
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| ReclaimError::IdentityUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token_ttl_secs: token_ttl_secs.clamp(1, MAX_TOKEN_TTL_SECS),
        })
    }

    async fn fetch_token(&self) -> Result<String, ReclaimError> {
        let url = format!("{}{}", self.endpoint, TOKEN_PATH);
        debug!("Requesting metadata session token from {}", url);
        let response = self
            .client
            .put(&url)
            .header(TOKEN_TTL_HEADER, self.token_ttl_secs.to_string())
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(ReclaimError::IdentityUnavailable(format!(
                "token request returned {}",
                response.status()
            )));
        }

        let token = response.text().await.map_err(unavailable)?;
        let token = token.trim();
        if token.is_empty() {
            return Err(ReclaimError::IdentityUnavailable(
                "token endpoint returned an empty token".into(),
            ));
        }
        Ok(token.to_string())
    }

    /// Read one metadata value. A missing key is `Ok(None)`.
    async fn read(&self, token: &str, path: &str) -> Result<Option<String>, ReclaimError> {
        let url = format!("{}{}", self.endpoint, path);
        debug!("Reading instance metadata {}", path);
        let response = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.text().await.map_err(unavailable)?;
                let value = body.trim();
                Ok((!value.is_empty()).then(|| value.to_string()))
            }
            status => Err(ReclaimError::IdentityUnavailable(format!(
                "{} returned {}",
                path, status
            ))),
        }
    }
}

#[async_trait]
impl IdentitySource for ImdsIdentity {
    async fn identify(&self) -> Result<InstanceIdentity, ReclaimError> {
        let token = self.fetch_token().await?;

        let instance_id = self.read(&token, INSTANCE_ID_PATH).await?.ok_or_else(|| {
            ReclaimError::IdentityUnavailable("metadata service has no instance id".into())
        })?;
        let region = self.read(&token, REGION_PATH).await?;

        Ok(InstanceIdentity {
            instance_id,
            region,
        })
    }
}

fn unavailable(e: reqwest::Error) -> ReclaimError {
    if e.is_timeout() {
        ReclaimError::IdentityUnavailable(format!("metadata request timed out: {}", e))
    } else {
        ReclaimError::IdentityUnavailable(e.to_string())
    }
}
