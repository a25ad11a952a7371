use super::AddressDirectory;
use crate::error::ReclaimError;
use crate::types::{AssociateRequest, Association, StableAddress};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Error codes that will not go away by asking again.
const FINAL_ERROR_CODES: &[&str] = &[
    "AuthFailure",
    "UnauthorizedOperation",
    "InvalidClientTokenId",
    "OptInRequired",
    "InvalidParameterValue",
    "InvalidParameterCombination",
    "MissingParameter",
    "InvalidAllocationID.Malformed",
    "InvalidInstanceID.Malformed",
];

/// Talks to the platform through its command line client.
///
/// The CLI resolves credentials from the instance profile on its own, so
/// this type only has to build commands and read their JSON output.
pub struct AwsCliDirectory {
    program: OsString,
    leading_args: Vec<OsString>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeAddressesOutput {
    #[serde(default)]
    addresses: Vec<AddressRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddressRecord {
    allocation_id: Option<String>,
    public_ip: Option<String>,
    instance_id: Option<String>,
    association_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssociateAddressOutput {
    association_id: Option<String>,
}

/// Why a CLI invocation produced no usable output.
enum CliFailure {
    Spawn(io::Error),
    TimedOut,
    Exit { code: Option<i32>, stderr: String },
}

impl AwsCliDirectory {
    pub fn new(program: impl Into<OsString>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            timeout,
        }
    }

    /// Run a CLI stand-in script through `sh`.
    #[cfg(test)]
    fn shim(script: &std::path::Path, timeout: Duration) -> Self {
        Self {
            program: "sh".into(),
            leading_args: vec![script.as_os_str().to_owned()],
            timeout,
        }
    }

    async fn run(&self, region: Option<&str>, args: &[&str]) -> Result<Vec<u8>, CliFailure> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg("ec2")
            .args(args)
            .args(["--output", "json"]);
        if let Some(region) = region {
            cmd.args(["--region", region]);
        }
        cmd.env("AWS_PAGER", "")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running platform CLI: {:?}", cmd);
        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(CliFailure::Spawn(e)),
            Err(_) => return Err(CliFailure::TimedOut),
        };

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(CliFailure::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Map a CLI failure onto the error taxonomy. `transient` builds the
    /// retryable error appropriate for the operation that failed.
    fn classify(
        &self,
        step: &'static str,
        failure: CliFailure,
        transient: fn(String) -> ReclaimError,
    ) -> ReclaimError {
        match failure {
            CliFailure::Spawn(e) if e.kind() == io::ErrorKind::NotFound => ReclaimError::Misconfigured(
                format!("platform CLI {:?} not found", self.program),
            ),
            CliFailure::Spawn(e) => transient(format!("failed to run platform CLI: {}", e)),
            CliFailure::TimedOut => ReclaimError::Timeout {
                step,
                after: self.timeout,
            },
            CliFailure::Exit { code, stderr } => {
                let is_final = error_code(&stderr).map_or(false, |c| FINAL_ERROR_CODES.contains(&c));
                if is_final {
                    ReclaimError::Misconfigured(stderr)
                } else {
                    transient(format!("exit status {:?}: {}", code, stderr))
                }
            }
        }
    }
}

#[async_trait]
impl AddressDirectory for AwsCliDirectory {
    async fn find_by_tag(
        &self,
        region: Option<&str>,
        tag_key: &str,
        value: &str,
    ) -> Result<Vec<StableAddress>, ReclaimError> {
        // JSON filter syntax survives commas and spaces in tag values.
        let filters = serde_json::json!([{
            "Name": format!("tag:{}", tag_key),
            "Values": [value],
        }])
        .to_string();

        let stdout = self
            .run(region, &["describe-addresses", "--filters", filters.as_str()])
            .await
            .map_err(|f| self.classify("describe-addresses", f, ReclaimError::DirectoryUnavailable))?;

        parse_addresses(&stdout)
    }

    async fn associate(
        &self,
        region: Option<&str>,
        request: &AssociateRequest,
    ) -> Result<Association, ReclaimError> {
        let reassociation = if request.allow_reassociation {
            "--allow-reassociation"
        } else {
            "--no-allow-reassociation"
        };
        let args: [&str; 6] = [
            "associate-address",
            "--allocation-id",
            &request.allocation_id,
            "--instance-id",
            &request.instance_id,
            reassociation,
        ];

        let stdout = self
            .run(region, &args)
            .await
            .map_err(|f| self.classify("associate-address", f, ReclaimError::AssociationRejected))?;

        let output: AssociateAddressOutput = serde_json::from_slice(&stdout).map_err(|e| {
            ReclaimError::AssociationRejected(format!("unreadable associate-address output: {}", e))
        })?;

        Ok(Association {
            allocation_id: request.allocation_id.clone(),
            instance_id: request.instance_id.clone(),
            association_id: output.association_id,
        })
    }
}

fn parse_addresses(stdout: &[u8]) -> Result<Vec<StableAddress>, ReclaimError> {
    let output: DescribeAddressesOutput = serde_json::from_slice(stdout).map_err(|e| {
        ReclaimError::DirectoryUnavailable(format!("unreadable describe-addresses output: {}", e))
    })?;

    let addresses = output
        .addresses
        .into_iter()
        .filter_map(|record| match record.allocation_id {
            Some(allocation_id) => Some(StableAddress {
                allocation_id,
                public_ip: record.public_ip,
                instance_id: record.instance_id,
                association_id: record.association_id,
            }),
            None => {
                debug!("Skipping address without allocation id: {:?}", record.public_ip);
                None
            }
        })
        .collect();
    Ok(addresses)
}

/// Pull the service error code out of CLI stderr, which reads
/// `An error occurred (Code) when calling the Op operation: message`.
fn error_code(stderr: &str) -> Option<&str> {
    let start = stderr.find("An error occurred (")? + "An error occurred (".len();
    let len = stderr[start..].find(')')?;
    Some(&stderr[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const DESCRIBE_OUTPUT: &str = r#"{
        "Addresses": [
            {
                "PublicIp": "203.0.113.10",
                "AllocationId": "eipalloc-0b",
                "Domain": "vpc",
                "InstanceId": "i-old",
                "AssociationId": "eipassoc-1",
                "Tags": [{"Key": "Name", "Value": "vpn-eip"}]
            },
            {
                "PublicIp": "198.51.100.7",
                "Domain": "standard"
            },
            {
                "PublicIp": "203.0.113.11",
                "AllocationId": "eipalloc-0a",
                "Domain": "vpc"
            }
        ]
    }"#;

    /// Write a stand-in CLI that records its arguments and runs `body`.
    fn shim(body: &str) -> (TempDir, AwsCliDirectory, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("aws.sh");
        let args_log = dir.path().join("args");
        std::fs::write(
            &script,
            format!("echo \"$@\" >> '{}'\n{}\n", args_log.display(), body),
        )
        .unwrap();
        let directory = AwsCliDirectory::shim(&script, Duration::from_secs(5));
        (dir, directory, args_log)
    }

    #[test]
    fn parses_addresses_and_skips_classic_records() {
        let addresses = parse_addresses(DESCRIBE_OUTPUT.as_bytes()).unwrap();

        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].allocation_id, "eipalloc-0b");
        assert!(addresses[0].is_held_by("i-old"));
        assert_eq!(addresses[1].instance_id, None);
    }

    #[test]
    fn empty_listing_is_not_an_error() {
        let addresses = parse_addresses(br#"{"Addresses": []}"#).unwrap();
        assert!(addresses.is_empty());
    }

    #[test]
    fn garbage_output_is_retryable() {
        let err = parse_addresses(b"<html>").unwrap_err();
        assert!(matches!(err, ReclaimError::DirectoryUnavailable(_)));
    }

    #[test]
    fn extracts_service_error_code() {
        let stderr = "\nAn error occurred (RequestLimitExceeded) when calling the \
                      AssociateAddress operation: Request limit exceeded.";
        assert_eq!(error_code(stderr), Some("RequestLimitExceeded"));
        assert_eq!(error_code("Unable to locate credentials"), None);
    }

    #[tokio::test]
    async fn describe_filters_by_tag_in_region() {
        let (_dir, directory, args_log) = shim(&format!("cat <<'JSON'\n{}\nJSON", DESCRIBE_OUTPUT));

        let addresses = directory
            .find_by_tag(Some("eu-west-1"), "Name", "vpn-eip")
            .await
            .unwrap();

        assert_eq!(addresses.len(), 2);
        let args = std::fs::read_to_string(args_log).unwrap();
        assert!(args.starts_with("ec2 describe-addresses --filters"));
        assert!(args.contains(r#"[{"Name":"tag:Name","Values":["vpn-eip"]}]"#));
        assert!(args.contains("--output json --region eu-west-1"));
    }

    #[tokio::test]
    async fn associate_always_passes_reassociation_flag() {
        let (_dir, directory, args_log) = shim(r#"echo '{"AssociationId": "eipassoc-9"}'"#);
        let request = AssociateRequest {
            allocation_id: "eipalloc-0a".into(),
            instance_id: "i-0001".into(),
            allow_reassociation: true,
        };

        let association = directory.associate(None, &request).await.unwrap();

        assert_eq!(association.instance_id, "i-0001");
        assert_eq!(association.association_id.as_deref(), Some("eipassoc-9"));
        let args = std::fs::read_to_string(args_log).unwrap();
        assert!(args.contains("associate-address --allocation-id eipalloc-0a --instance-id i-0001 --allow-reassociation"));
        assert!(!args.contains("--region"));
    }

    #[tokio::test]
    async fn throttling_is_retryable() {
        let (_dir, directory, _) = shim(
            "echo 'An error occurred (RequestLimitExceeded) when calling the AssociateAddress operation: slow down' >&2\nexit 254",
        );
        let request = AssociateRequest {
            allocation_id: "eipalloc-0a".into(),
            instance_id: "i-0001".into(),
            allow_reassociation: true,
        };

        let err = directory.associate(None, &request).await.unwrap_err();

        assert!(matches!(err, ReclaimError::AssociationRejected(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn permission_errors_are_final() {
        let (_dir, directory, _) = shim(
            "echo 'An error occurred (UnauthorizedOperation) when calling the DescribeAddresses operation: denied' >&2\nexit 254",
        );

        let err = directory.find_by_tag(None, "Name", "vpn-eip").await.unwrap_err();

        assert!(matches!(err, ReclaimError::Misconfigured(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn hung_cli_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("aws.sh");
        std::fs::write(&script, "sleep 30\n").unwrap();
        let directory = AwsCliDirectory::shim(&script, Duration::from_millis(200));

        let err = directory.find_by_tag(None, "Name", "vpn-eip").await.unwrap_err();

        assert!(matches!(err, ReclaimError::Timeout { step: "describe-addresses", .. }));
    }

    #[tokio::test]
    async fn missing_cli_is_final() {
        let directory = AwsCliDirectory::new("/nonexistent/aws", Duration::from_secs(1));

        let err = directory.find_by_tag(None, "Name", "vpn-eip").await.unwrap_err();

        assert!(matches!(err, ReclaimError::Misconfigured(_)));
    }
}
