//! eip-reclaim entry point.
//!
//! Runs once per instance boot and binds the tagged stable address to this
//! instance.  The exit status is advisory: boot scripts are expected to log
//! it and carry on.

use std::process::ExitCode;

use log::{error, info};

mod agent;
mod config;
mod directory;
mod error;
mod identity;
mod retry;
mod types;

use agent::{exit_code, Agent};
use config::Config;
use directory::AwsCliDirectory;
use identity::ImdsIdentity;

/// Exit status when the agent could not even be set up.
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!("Starting eip-reclaim with config: {:?}", cfg);

    // Identity source (link-local metadata service)
    let identity = match ImdsIdentity::new(&cfg.imds_endpoint, cfg.token_ttl_secs, cfg.request_timeout())
    {
        Ok(identity) => identity,
        Err(e) => {
            error!("Unable to set up identity source: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Address directory (platform CLI)
    let directory = AwsCliDirectory::new(&cfg.aws_cli, cfg.request_timeout());

    let agent = Agent::new(identity, directory, cfg.agent_settings());
    let result = agent.run().await;
    if result.is_err() {
        info!("Continuing boot without the stable address; reassociate it manually if needed.");
    }
    ExitCode::from(exit_code(&result))
}
