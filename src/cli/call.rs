//! `call`: one raw control-plane request from the shell.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use crate::client::BridgeClient;

/// Send `method` with optional JSON `params` and print the pretty result.
pub async fn run_call_command(
    socket: &Path,
    method: &str,
    params: Option<&str>,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let params = params.map(parse_params).transpose()?;
    let client = BridgeClient::new(socket).with_timeout(Duration::from_secs(timeout_secs));

    let result = client
        .call(method, params)
        .await
        .with_context(|| format!("{method} failed"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn parse_params(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw).context("params must be valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("params must be a JSON object");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params(r#"{"limit":5}"#).unwrap()["limit"], 5);
        assert!(parse_params("[1,2]").is_err());
        assert!(parse_params("{nope").is_err());
    }
}
