//! In-process fakes for the backend client seam.

use crate::backend::{
    BackendConnector, BackendSession, Capability, ConnectionHandle, SessionCapabilities,
    TransportParams,
};
use crate::error::{GatewayError, Result};
use crate::registry::{BackendDescriptor, Lifecycle, TransportKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) fn stdio_descriptor(id: &str) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        transport: TransportKind::Stdio,
        command: Some(format!("{id}-server")),
        args: Vec::new(),
        env: HashMap::new(),
        url: None,
        lifecycle: Lifecycle::Persistent,
        authorization: None,
    }
}

/// Counts connects/closes and hands out [`FakeSession`]s.
#[derive(Default)]
pub(crate) struct FakeConnector {
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    /// Delay inside `connect`, to widen race windows.
    pub connect_delay: Option<Duration>,
    pub fail_close: bool,
    pub list_tools: bool,
    pub seen_params: Mutex<Vec<TransportParams>>,
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(&self, backend_id: &str, params: TransportParams) -> Result<ConnectionHandle> {
        if let Some(d) = self.connect_delay {
            tokio::time::sleep(d).await;
        }
        let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_params.lock().push(params);
        Ok(Arc::new(FakeSession {
            backend_id: backend_id.to_string(),
            serial,
            closes: self.closes.clone(),
            closed: AtomicBool::new(false),
            fail_close: self.fail_close,
            list_tools: self.list_tools,
        }))
    }
}

/// Operations:
/// - `echo`: returns the arguments object
/// - `whoami`: returns `{"backend": id, "serial": n}` (serial = connect count at open time)
/// - `fail`: transport-style failure
/// - `unauthorized`: the backend rejects the credentials
/// - `missing_invoice`: tool error whose text happens to contain `401`
pub(crate) struct FakeSession {
    backend_id: String,
    serial: usize,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
    fail_close: bool,
    list_tools: bool,
}

#[async_trait]
impl BackendSession for FakeSession {
    async fn call(&self, operation: &str, arguments: Map<String, Value>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Backend {
                backend_id: self.backend_id.clone(),
                message: "session closed".into(),
            });
        }
        match operation {
            "echo" => Ok(Value::Object(arguments)),
            "whoami" => Ok(json!({"backend": self.backend_id, "serial": self.serial})),
            "unauthorized" => Err(GatewayError::Unauthorized {
                backend_id: self.backend_id.clone(),
            }),
            "missing_invoice" => Err(GatewayError::ToolFailed {
                backend_id: self.backend_id.clone(),
                operation: operation.to_string(),
                message: "invoice 4012 missing (401 Unauthorized upstream)".into(),
            }),
            other => Err(GatewayError::Backend {
                backend_id: self.backend_id.clone(),
                message: format!("operation '{other}' failed"),
            }),
        }
    }

    fn capabilities(&self) -> SessionCapabilities {
        SessionCapabilities {
            list_tools: self.list_tools,
        }
    }

    async fn list_capabilities(&self) -> Result<Vec<Capability>> {
        Ok(vec![
            Capability {
                name: "echo".into(),
                description: Some("Echo arguments".into()),
            },
            Capability {
                name: "whoami".into(),
                description: None,
            },
        ])
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(GatewayError::Backend {
                backend_id: self.backend_id.clone(),
                message: "broken pipe".into(),
            });
        }
        Ok(())
    }
}
