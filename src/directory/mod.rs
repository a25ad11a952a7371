use crate::error::ReclaimError;
use crate::types::{AssociateRequest, Association, StableAddress};
use async_trait::async_trait;

pub mod aws_cli;
pub use aws_cli::AwsCliDirectory;

#[cfg(test)]
pub mod memory;

#[async_trait]
pub trait AddressDirectory: Send + Sync {
    /// List every address whose tag `tag_key` equals `value`.
    /// No ordering is guaranteed.
    async fn find_by_tag(
        &self,
        region: Option<&str>,
        tag_key: &str,
        value: &str,
    ) -> Result<Vec<StableAddress>, ReclaimError>;

    /// Bind an address to an instance. Asserting an existing binding again
    /// must leave the platform in the same state.
    async fn associate(
        &self,
        region: Option<&str>,
        request: &AssociateRequest,
    ) -> Result<Association, ReclaimError>;
}

#[async_trait]
impl<T: AddressDirectory + ?Sized> AddressDirectory for std::sync::Arc<T> {
    async fn find_by_tag(
        &self,
        region: Option<&str>,
        tag_key: &str,
        value: &str,
    ) -> Result<Vec<StableAddress>, ReclaimError> {
        (**self).find_by_tag(region, tag_key, value).await
    }

    async fn associate(
        &self,
        region: Option<&str>,
        request: &AssociateRequest,
    ) -> Result<Association, ReclaimError> {
        (**self).associate(region, request).await
    }
}
