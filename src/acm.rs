use anyhow::{Context, Result};
use serde_json::Value;

use crate::aws::AwsCli;

pub struct Acm {
    aws: AwsCli,
}

impl Acm {
    pub fn new(aws: AwsCli) -> Self {
        Self { aws }
    }

    /// Current lifecycle status, e.g. `PENDING_VALIDATION` or `ISSUED`.
    pub async fn certificate_status(&self, arn: &str) -> Result<String> {
        let output = self
            .aws
            .run(&["acm", "describe-certificate", "--certificate-arn", arn])
            .await?;
        parse_status(&output)
    }
}

fn parse_status(output: &Value) -> Result<String> {
    output["Certificate"]["Status"]
        .as_str()
        .map(str::to_string)
        .context("describe-certificate returned no Certificate.Status")
}
