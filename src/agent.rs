//! The address reclaim agent.
//!
//! One run walks `Identify → Discover → Associate → Verify` and ends either
//! with this instance bound to the stable address or with an error for the
//! caller to log.  Nothing is remembered between runs; every boot starts
//! from scratch.  Concurrent runs on an outgoing and an incoming instance
//! are expected during replacement.  The platform's association call
//! settles them, last writer wins.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::timeout;

use crate::directory::AddressDirectory;
use crate::error::ReclaimError;
use crate::identity::IdentitySource;
use crate::retry::{retry, RetryPolicy};
use crate::types::{AssociateRequest, Association, StableAddress};

/// Process exit status after a successful reclaim.
pub const EXIT_RECLAIMED: u8 = 0;
/// Process exit status after a failed reclaim. Advisory only.
pub const EXIT_FAILED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Identify,
    Discover,
    Associate,
    Verify,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Identify => "identify",
            Phase::Discover => "discover",
            Phase::Associate => "associate",
            Phase::Verify => "verify",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub tag_key: String,
    pub stable_name: String,
    /// Overrides the region reported by the identity source.
    pub region: Option<String>,
    /// Bound on each external call.
    pub step_timeout: Duration,
    /// Bound on one identity lookup, which may span several requests.
    pub identify_timeout: Duration,
    /// Bound on the whole run, retries included.
    pub total_budget: Duration,
    pub verify: bool,
    pub policy: RetryPolicy,
}

/// What the platform reported after re-reading the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Held,
    /// A later writer took the address, or it is no longer bound.
    LostTo(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub association: Association,
    pub public_ip: Option<String>,
    /// The address was already bound to this instance before the run.
    pub already_held: bool,
    /// `None` when verification is off or the re-read failed.
    pub verification: Option<Verification>,
}

pub struct Agent<I, D> {
    identity: I,
    directory: D,
    settings: AgentSettings,
}

impl<I, D> Agent<I, D>
where
    I: IdentitySource,
    D: AddressDirectory,
{
    pub fn new(identity: I, directory: D, settings: AgentSettings) -> Self {
        Self {
            identity,
            directory,
            settings,
        }
    }

    /// Run once, within the total budget.
    pub async fn run(&self) -> Result<Reclaimed, ReclaimError> {
        let budget = self.settings.total_budget;
        let result = match timeout(budget, self.reclaim()).await {
            Ok(result) => result,
            Err(_) => Err(ReclaimError::Timeout {
                step: "reclaim",
                after: budget,
            }),
        };

        match &result {
            Ok(reclaimed) => info!(
                "Done: {} ({}) bound to {} via {}{}{}",
                reclaimed.association.allocation_id,
                reclaimed.public_ip.as_deref().unwrap_or("no public ip"),
                reclaimed.association.instance_id,
                reclaimed.association.association_id.as_deref().unwrap_or("unknown association"),
                if reclaimed.already_held { ", unchanged" } else { "" },
                match &reclaimed.verification {
                    Some(Verification::Held) => ", verified",
                    Some(Verification::LostTo(_)) => ", since taken by a later writer",
                    None => "",
                }
            ),
            Err(e) => error!("Failed to reclaim stable address: {}", e),
        }
        result
    }

    async fn reclaim(&self) -> Result<Reclaimed, ReclaimError> {
        let tag_key = self.settings.tag_key.as_str();
        let stable_name = self.settings.stable_name.as_str();

        let identity = self
            .step(Phase::Identify, self.settings.identify_timeout, || {
                self.identity.identify()
            })
            .await?;
        info!("Running on instance {}", identity.instance_id);

        let region = self
            .settings
            .region
            .as_deref()
            .or(identity.region.as_deref());

        let candidates = self
            .step(Phase::Discover, self.settings.step_timeout, || {
                self.directory.find_by_tag(region, tag_key, stable_name)
            })
            .await?;
        let address = select_address(candidates, tag_key, stable_name)?;
        info!(
            "Found {} ({}) tagged {}={}",
            address.allocation_id,
            address.public_ip.as_deref().unwrap_or("no public ip"),
            tag_key,
            stable_name
        );

        let already_held = address.is_held_by(&identity.instance_id);
        let association = if already_held {
            info!("{} is already bound to this instance", address.allocation_id);
            Association {
                allocation_id: address.allocation_id.clone(),
                instance_id: identity.instance_id.clone(),
                association_id: address.association_id.clone(),
            }
        } else {
            if let Some(holder) = &address.instance_id {
                info!("{} is held by {}, taking it over", address.allocation_id, holder);
            }
            let request = AssociateRequest {
                allocation_id: address.allocation_id.clone(),
                instance_id: identity.instance_id.clone(),
                allow_reassociation: true,
            };
            self.step(Phase::Associate, self.settings.step_timeout, || {
                self.directory.associate(region, &request)
            })
            .await?
        };

        let verification = if self.settings.verify {
            self.verify(region, &address.allocation_id, &identity.instance_id)
                .await
        } else {
            None
        };

        Ok(Reclaimed {
            association,
            public_ip: address.public_ip,
            already_held,
            verification,
        })
    }

    /// Re-read the address once. Losing it here is not an error: another
    /// instance asserted its own association after ours.
    async fn verify(
        &self,
        region: Option<&str>,
        allocation_id: &str,
        instance_id: &str,
    ) -> Option<Verification> {
        info!("Entering {}", Phase::Verify);
        let step_timeout = self.settings.step_timeout;
        let lookup = self.directory.find_by_tag(
            region,
            &self.settings.tag_key,
            &self.settings.stable_name,
        );
        let addresses = match timeout(step_timeout, lookup).await {
            Ok(Ok(addresses)) => addresses,
            Ok(Err(e)) => {
                warn!("Could not verify association: {}", e);
                return None;
            }
            Err(_) => {
                warn!("Could not verify association: timed out after {:?}", step_timeout);
                return None;
            }
        };

        let holder = addresses
            .into_iter()
            .find(|a| a.allocation_id == allocation_id)
            .and_then(|a| a.instance_id);
        if holder.as_deref() == Some(instance_id) {
            Some(Verification::Held)
        } else {
            warn!(
                "{} is now bound to {:?}; a later writer won the replacement race",
                allocation_id, holder
            );
            Some(Verification::LostTo(holder))
        }
    }

    /// Run one phase under the retry policy, bounding every attempt.
    async fn step<T, F, Fut>(
        &self,
        phase: Phase,
        step_timeout: Duration,
        mut op: F,
    ) -> Result<T, ReclaimError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ReclaimError>>,
    {
        info!("Entering {}", phase);
        retry(
            &self.settings.policy,
            phase.as_str(),
            |_| {
                let attempt = op();
                async move {
                    timeout(step_timeout, attempt).await.unwrap_or_else(|_| {
                        Err(ReclaimError::Timeout {
                            step: phase.as_str(),
                            after: step_timeout,
                        })
                    })
                }
            },
            ReclaimError::is_retryable,
        )
        .await
    }
}

/// Pick the address to claim. Several addresses sharing the tag is a
/// misconfiguration; the lowest allocation id wins so repeated runs agree.
pub fn select_address(
    mut candidates: Vec<StableAddress>,
    tag_key: &str,
    stable_name: &str,
) -> Result<StableAddress, ReclaimError> {
    candidates.sort_by(|a, b| a.allocation_id.cmp(&b.allocation_id));
    if candidates.len() > 1 {
        let ids: Vec<&str> = candidates.iter().map(|a| a.allocation_id.as_str()).collect();
        warn!(
            "{} addresses tagged {}={} ({}); using {}",
            candidates.len(),
            tag_key,
            stable_name,
            ids.join(", "),
            ids[0]
        );
    }
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ReclaimError::AddressNotFound {
            tag_key: tag_key.to_string(),
            stable_name: stable_name.to_string(),
        })
}

/// Advisory process exit status for a run.
pub fn exit_code(result: &Result<Reclaimed, ReclaimError>) -> u8 {
    match result {
        Ok(_) => EXIT_RECLAIMED,
        Err(_) => EXIT_FAILED,
    }
}
