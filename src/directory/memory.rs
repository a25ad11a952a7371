//! In-process stand-in for the provisioning platform.
//!
//! Associations are last-writer-wins, like the real thing.  Failures can be
//! queued up front to exercise the agent's retry handling.

use super::AddressDirectory;
use crate::error::ReclaimError;
use crate::types::{AssociateRequest, Association, StableAddress};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    addresses: Vec<(StableAddress, Vec<(String, String)>)>,
    next_association: u64,
    describe_failures: VecDeque<ReclaimError>,
    associate_failures: VecDeque<ReclaimError>,
    describe_calls: u32,
    associate_calls: u32,
    regions: Vec<Option<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unassociated address carrying the given tags.
    pub fn with_address(self, allocation_id: &str, public_ip: &str, tags: &[(&str, &str)]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let tags = tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            state.addresses.push((
                StableAddress {
                    allocation_id: allocation_id.to_string(),
                    public_ip: Some(public_ip.to_string()),
                    instance_id: None,
                    association_id: None,
                },
                tags,
            ));
        }
        self
    }

    /// Make the next lookups fail with `errors`, in order.
    pub fn fail_describe(&self, errors: impl IntoIterator<Item = ReclaimError>) {
        self.state.lock().unwrap().describe_failures.extend(errors);
    }

    /// Make the next associations fail with `errors`, in order.
    pub fn fail_associate(&self, errors: impl IntoIterator<Item = ReclaimError>) {
        self.state.lock().unwrap().associate_failures.extend(errors);
    }

    /// Instance currently holding `allocation_id`.
    pub fn holder(&self, allocation_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .addresses
            .iter()
            .find(|(a, _)| a.allocation_id == allocation_id)
            .and_then(|(a, _)| a.instance_id.clone())
    }

    /// Bind an address behind the agent's back.
    pub fn force_holder(&self, allocation_id: &str, instance_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_association += 1;
        let association_id = format!("eipassoc-{}", state.next_association);
        if let Some((address, _)) = state
            .addresses
            .iter_mut()
            .find(|(a, _)| a.allocation_id == allocation_id)
        {
            address.instance_id = Some(instance_id.to_string());
            address.association_id = Some(association_id);
        }
    }

    pub fn describe_calls(&self) -> u32 {
        self.state.lock().unwrap().describe_calls
    }

    pub fn associate_calls(&self) -> u32 {
        self.state.lock().unwrap().associate_calls
    }

    /// Region passed with every call so far.
    pub fn regions(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().regions.clone()
    }
}

#[async_trait]
impl AddressDirectory for MemoryDirectory {
    async fn find_by_tag(
        &self,
        region: Option<&str>,
        tag_key: &str,
        value: &str,
    ) -> Result<Vec<StableAddress>, ReclaimError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        state.describe_calls += 1;
        state.regions.push(region.map(str::to_string));
        if let Some(err) = state.describe_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .addresses
            .iter()
            .filter(|(_, tags)| tags.iter().any(|(k, v)| k == tag_key && v == value))
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn associate(
        &self,
        region: Option<&str>,
        request: &AssociateRequest,
    ) -> Result<Association, ReclaimError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        state.associate_calls += 1;
        state.regions.push(region.map(str::to_string));
        if let Some(err) = state.associate_failures.pop_front() {
            return Err(err);
        }

        state.next_association += 1;
        let fresh_id = format!("eipassoc-{}", state.next_association);
        let address = state
            .addresses
            .iter_mut()
            .map(|(a, _)| a)
            .find(|a| a.allocation_id == request.allocation_id)
            .ok_or_else(|| {
                ReclaimError::Misconfigured(format!(
                    "InvalidAllocationID.NotFound: {}",
                    request.allocation_id
                ))
            })?;

        let holder = address.instance_id.clone();
        match holder.as_deref() {
            Some(holder) if holder == request.instance_id => {}
            Some(holder) if !request.allow_reassociation => {
                return Err(ReclaimError::AssociationRejected(format!(
                    "Resource.AlreadyAssociated: held by {}",
                    holder
                )));
            }
            _ => {
                address.instance_id = Some(request.instance_id.clone());
                address.association_id = Some(fresh_id);
            }
        }

        Ok(Association {
            allocation_id: address.allocation_id.clone(),
            instance_id: request.instance_id.clone(),
            association_id: address.association_id.clone(),
        })
    }
}
