use crate::error::ReclaimError;
use crate::types::InstanceIdentity;
use async_trait::async_trait;

pub mod imds;
pub use imds::ImdsIdentity;

#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Work out which instance this process runs on.
    /// Implementations must authenticate against the local source and
    /// bound every request they make.
    async fn identify(&self) -> Result<InstanceIdentity, ReclaimError>;
}
