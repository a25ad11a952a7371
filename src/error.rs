//! Error taxonomy of the reclaim agent.

use std::time::Duration;

/// Everything that can stop an address reclaim attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReclaimError {
    /// The local identity endpoint did not answer, or answered garbage.
    #[error("instance identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// No address carries the configured tag.
    #[error("no address tagged {tag_key}={stable_name}")]
    AddressNotFound {
        tag_key: String,
        stable_name: String,
    },

    /// The platform refused or failed the association request.
    #[error("association rejected: {0}")]
    AssociationRejected(String),

    /// The address lookup failed.
    #[error("address directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The platform or the local tooling refuses the call, and will keep
    /// refusing it until someone fixes permissions or setup.
    #[error("misconfigured: {0}")]
    Misconfigured(String),

    /// A step did not complete in time.
    #[error("{step} timed out after {}s", .after.as_secs_f64())]
    Timeout { step: &'static str, after: Duration },
}

impl ReclaimError {
    /// Check if another attempt could succeed where this one failed.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IdentityUnavailable(_)
                | Self::AssociationRejected(_)
                | Self::DirectoryUnavailable(_)
                | Self::Timeout { .. }
        )
    }
}
