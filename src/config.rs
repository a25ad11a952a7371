use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::agent::AgentSettings;
use crate::identity::imds::{MAX_TOKEN_TTL_SECS, REQUESTS_PER_IDENTIFY};
use crate::retry::{Backoff, RetryPolicy};

const DEFAULT_CONFIG_PATH: &str = "/etc/eip-reclaim/reclaim.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub stable_name: String,
    pub tag_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    pub request_timeout_secs: u64,
    pub total_budget_secs: u64,
    pub imds_endpoint: String,
    pub token_ttl_secs: u32,
    pub aws_cli: String,
    pub verify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stable_name: "vpn-eip".into(),
            tag_key: "Name".into(),
            region: None,
            max_attempts: 4,
            retry_delay_ms: 2_000,
            backoff: Backoff::Linear,
            request_timeout_secs: 5,
            total_budget_secs: 180,
            imds_endpoint: "http://169.254.169.254".into(),
            // One run needs the token for seconds, not hours.
            token_ttl_secs: 300,
            aws_cli: "aws".into(),
            verify: true,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file, then its `.json` sibling, then
    /// `RECLAIM_*` environment variables.
    pub fn figment() -> Figment {
        let path = std::env::var_os("RECLAIM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(&path))
            .merge(Json::file(path.with_extension("json")))
            .merge(Env::prefixed("RECLAIM_"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;

        let worst_case = config.worst_case_run();
        if worst_case > config.total_budget() {
            warn!(
                "A run can take up to {:?} with every attempt timing out, beyond the total budget \
                 of {:?}; a slow platform will end in a reclaim timeout instead of its own error",
                worst_case,
                config.total_budget()
            );
        }
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stable_name.trim().is_empty() {
            bail!("stable_name must not be empty");
        }
        if self.tag_key.trim().is_empty() {
            bail!("tag_key must not be empty");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if self.total_budget_secs == 0 {
            bail!("total_budget_secs must be at least 1");
        }
        if !(1..=MAX_TOKEN_TTL_SECS).contains(&self.token_ttl_secs) {
            bail!("token_ttl_secs must be between 1 and {}", MAX_TOKEN_TTL_SECS);
        }
        if !self.imds_endpoint.starts_with("http://") {
            bail!("imds_endpoint must be a plain http:// URL, got {}", self.imds_endpoint);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// One identity lookup spans several sequential requests.
    pub fn identify_timeout(&self) -> Duration {
        self.request_timeout().saturating_mul(REQUESTS_PER_IDENTIFY)
    }

    /// Longest a run can last when every attempt of every step times out:
    /// identify, discover and associate each use all attempts and delays,
    /// then verification makes one more request.
    pub fn worst_case_run(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let delays = self.retry_policy().total_delay();
        let identify = self.identify_timeout().saturating_mul(attempts);
        let platform_step = self.request_timeout().saturating_mul(attempts);
        let verify = if self.verify {
            self.request_timeout()
        } else {
            Duration::ZERO
        };

        identify
            .saturating_add(platform_step.saturating_mul(2))
            .saturating_add(delays.saturating_mul(3))
            .saturating_add(verify)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.total_budget_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_delay_ms),
            self.backoff,
        )
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            tag_key: self.tag_key.clone(),
            stable_name: self.stable_name.clone(),
            region: self.region.clone(),
            step_timeout: self.request_timeout(),
            identify_timeout: self.identify_timeout(),
            total_budget: self.total_budget(),
            verify: self.verify,
            policy: self.retry_policy(),
        }
    }
}
