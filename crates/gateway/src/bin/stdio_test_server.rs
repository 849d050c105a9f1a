//! Minimal MCP stdio backend used only by gateway integration tests.
//!
//! Speaks JSON-RPC over stdio directly (one JSON message per line) so the tests exercise the real
//! protocol client against something independent of the gateway's own code.
//!
//! Tools:
//! - `whoami`: per-process instance id and call count (distinguishes fresh connections)
//! - `echo`: returns its arguments as `structuredContent`
//! - `get_user`: returns `{"user": {"id": 42, "name": "ada"}}` as a JSON text block
//! - `fail`: a tool-level error result

use serde_json::{Value, json};
use std::io::{BufRead as _, Write};
use std::time::{SystemTime, UNIX_EPOCH};

fn main() -> anyhow::Result<()> {
    let mut state = ServerState::new();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if let Some(resp) = handle_line(&mut state, &line) {
            serde_json::to_writer(&mut stdout, &resp)?;
            stdout.write_all(b"\n")?;
            stdout.flush()?;
        }
    }

    Ok(())
}

struct ServerState {
    instance_id: String,
    call_count: u64,
}

impl ServerState {
    fn new() -> Self {
        let started_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self {
            instance_id: format!("{}-{started_ns}", std::process::id()),
            call_count: 0,
        }
    }
}

fn handle_line(state: &mut ServerState, line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let msg: Value = serde_json::from_str(line).ok()?;
    let method = msg.get("method").and_then(Value::as_str)?;
    // Notifications carry no id and get no reply.
    let id = msg.get("id")?.clone();

    let reply = match method {
        "initialize" => Ok(initialize_result(&msg)),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(tools_list_result()),
        "tools/call" => tools_call_result(state, &msg),
        _ => Err(json!({ "code": -32601, "message": "method not found" })),
    };

    Some(match reply {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
    })
}

fn initialize_result(msg: &Value) -> Value {
    let protocol_version = msg
        .pointer("/params/protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or("2024-11-05");

    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": {} },
        "serverInfo": { "name": "blackbox-stdio-test-server", "version": "0" }
    })
}

fn tools_list_result() -> Value {
    let object = json!({ "type": "object" });
    json!({
        "tools": [
            { "name": "whoami", "description": "Per-process instance info", "inputSchema": object },
            { "name": "echo", "description": "Echo arguments", "inputSchema": object },
            { "name": "get_user", "description": "A fixed user record", "inputSchema": object },
            { "name": "fail", "description": "Always fails", "inputSchema": object },
        ]
    })
}

fn tools_call_result(state: &mut ServerState, msg: &Value) -> Result<Value, Value> {
    let name = msg
        .pointer("/params/name")
        .and_then(Value::as_str)
        .unwrap_or("");
    let arguments = msg
        .pointer("/params/arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    state.call_count += 1;
    match name {
        "whoami" => {
            let body = json!({
                "instanceId": state.instance_id,
                "callCount": state.call_count,
            });
            Ok(json!({ "content": [{ "type": "text", "text": body.to_string() }] }))
        }
        "echo" => Ok(json!({
            "content": [{ "type": "text", "text": arguments.to_string() }],
            "structuredContent": arguments,
        })),
        "get_user" => {
            let body = json!({ "user": { "id": 42, "name": "ada" } });
            Ok(json!({ "content": [{ "type": "text", "text": body.to_string() }] }))
        }
        "fail" => Ok(json!({
            "content": [{ "type": "text", "text": "requested failure" }],
            "isError": true,
        })),
        _ => Err(json!({ "code": -32602, "message": "unknown tool" })),
    }
}
