//! Bridge status CLI command.
//!
//! Queries a running bridge for its state, containers and chat relay.

use std::path::Path;

use serde_json::Value;

use crate::client::BridgeClient;

/// Run the status command, printing bridge health info.
pub async fn run_status_command(socket: &Path) -> anyhow::Result<()> {
    let client = BridgeClient::new(socket);

    println!("ArmorClaw Bridge Status");
    println!("=======================\n");
    println!("  CLI:         {} v{}", env!("CARGO_PKG_NAME"), crate::VERSION);
    println!("  Socket:      {}", socket.display());

    let status = match client.status().await {
        Ok(status) => status,
        Err(e) if e.is_connection_error() => {
            println!("  Bridge:      not running ({e})");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("  Bridge:      {} (v{})", status.state, status.version);

    print!("  Containers:  ");
    if status.container_ids.is_empty() {
        println!("none");
    } else {
        println!("{}", status.containers);
        for id in &status.container_ids {
            println!("               - {id}");
        }
    }

    print!("  Matrix:      ");
    match client.matrix_status().await {
        Ok(matrix) => println!("{}", describe_matrix(&matrix)),
        Err(e) => println!("error ({e})"),
    }
    Ok(())
}

fn describe_matrix(status: &Value) -> String {
    if !status["enabled"].as_bool().unwrap_or(false) {
        return "not configured".to_string();
    }
    let state = status["status"].as_str().unwrap_or("unknown");
    match status["user_id"].as_str().filter(|u| !u.is_empty()) {
        Some(user) => format!("{state} as {user}"),
        None => state.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_describe_matrix() {
        assert_eq!(
            describe_matrix(&json!({"enabled": false, "status": "not_configured"})),
            "not configured"
        );
        assert_eq!(
            describe_matrix(&json!({
                "enabled": true,
                "status": "connected",
                "user_id": "@bridge:example.org",
                "logged_in": true,
            })),
            "connected as @bridge:example.org"
        );
    }
}
