#![allow(dead_code)]

use blackbox_gateway::Gateway;
use blackbox_gateway::oauth::{DEFAULT_PENDING_TTL, HttpTokenExchanger};
use blackbox_gateway::registry::BackendRegistry;
use blackbox_gateway::rmcp_backend::RmcpConnector;
use std::sync::Arc;
use std::time::Duration;

pub fn test_server_bin() -> &'static str {
    env!("CARGO_BIN_EXE_blackbox-stdio-test-server")
}

pub fn gateway_bin() -> &'static str {
    env!("CARGO_BIN_EXE_blackbox-gateway")
}

/// Gateway over the real rmcp client, with backends loaded from `config_json`.
pub fn real_gateway(config_json: &str) -> anyhow::Result<(Gateway, tempfile::NamedTempFile)> {
    let file = blackbox_test_support::write_backends_file(config_json, ".json")?;
    let registry = Arc::new(BackendRegistry::load(file.path())?);
    let gateway = Gateway::new(
        registry,
        Arc::new(RmcpConnector {
            http_connect_timeout: Some(Duration::from_secs(5)),
        }),
        Arc::new(HttpTokenExchanger::default()),
        DEFAULT_PENDING_TTL,
    );
    Ok((gateway, file))
}

/// A stdio backend record pointing at the test server binary.
pub fn stdio_record(id: &str, lifecycle: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "transport": "stdio",
        "command": test_server_bin(),
        "lifecycle": lifecycle,
    })
}
