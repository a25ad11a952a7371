//! Data structures shared by the agent and its collaborators.
//!
//! The provisioning platform owns all of these records.  The agent only
//! reads them and proposes new associations, so the fields mirror what
//! the platform reports and nothing more.

/// Who this instance is, as reported by the local identity source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_id: String,
    /// Region the instance runs in, when the identity source knows it.
    pub region: Option<String>,
}

/// A long-lived public address, identified by its allocation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableAddress {
    pub allocation_id: String,
    pub public_ip: Option<String>,
    /// Instance currently bound to this address, if any.
    pub instance_id: Option<String>,
    pub association_id: Option<String>,
}

impl StableAddress {
    /// Whether the address is currently bound to `instance_id`.
    pub fn is_held_by(&self, instance_id: &str) -> bool {
        self.instance_id.as_deref() == Some(instance_id)
    }
}

/// The binding of a stable address to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub allocation_id: String,
    pub instance_id: String,
    pub association_id: Option<String>,
}

/// A proposal to bind an address to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRequest {
    pub allocation_id: String,
    pub instance_id: String,
    /// Take the address even if another instance currently holds it.
    pub allow_reassociation: bool,
}
