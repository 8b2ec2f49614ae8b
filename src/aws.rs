use anyhow::{Context, Result};
use log::debug;
use serde_json::Value;
use tokio::process::Command;

use crate::config::AwsConfig;
use crate::error::MigrateError;

/// Thin wrapper over the `aws` command line, which already knows how to find
/// the operator's credentials.
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: String,
}

impl AwsCli {
    pub fn new(config: &AwsConfig) -> Self {
        Self {
            program: config.program.clone(),
            region: config.region.clone(),
        }
    }

    /// Run `aws <args>` and parse its JSON output. Empty output yields `Null`.
    pub async fn run(&self, args: &[&str]) -> Result<Value> {
        debug!("Running {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(args)
            .args(["--region", &self.region, "--output", "json"])
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            let command: Vec<&str> = args.iter().take(2).copied().collect();
            return Err(MigrateError::Command {
                program: format!("{} {}", self.program, command.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        parse_output(&output.stdout)
    }
}

fn parse_output(stdout: &[u8]) -> Result<Value> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(stdout).context("Failed to parse aws CLI JSON output")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_and_empty_output() {
        assert_eq!(parse_output(b"  \n").unwrap(), Value::Null);
        let value = parse_output(br#"{"Certificate": {"Status": "ISSUED"}}"#).unwrap();
        assert_eq!(value["Certificate"]["Status"], "ISSUED");
        assert!(parse_output(b"not json").is_err());
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let cli = AwsCli::new(&AwsConfig {
            program: "dns-migrate-no-such-aws-binary".to_string(),
            ..AwsConfig::default()
        });
        assert!(cli.run(&["sts", "get-caller-identity"]).await.is_err());
    }
}
