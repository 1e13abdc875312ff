//! Simulated lab devices.

use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use armada_runtime::collab::Credentials;
use armada_runtime::connection::{ConnectionDriver, ConnectionHandle, Session};
use armada_runtime::error::ConnectionError;
use armada_workflow::Device;

/// How a lab device misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every command times out.
    Unreachable,
    /// The management interface reports down.
    MgmtDown,
}

/// A session to a simulated device.
#[derive(Debug)]
pub struct LabSession {
    device: Device,
    fault: Option<Fault>,
    log: Mutex<Vec<String>>,
}

impl LabSession {
    fn respond(&self, command: &str) -> Result<Value, ConnectionError> {
        let name = &self.device.name;
        match command {
            "show version" => Ok(json!(format!("{name}: Armada OS 4.2.1, uptime 12 days"))),
            "show running-config" => Ok(json!(format!(
                "hostname {name}\ninterface mgmt0\n ip address {}/24\n",
                self.device.address
            ))),
            "show interfaces" => {
                let mgmt = if self.fault == Some(Fault::MgmtDown) { "down" } else { "up" };
                Ok(json!(
                    json!({
                        "mgmt0": {"status": mgmt, "mtu": 1500},
                        "eth1": {"status": "up", "mtu": 9000},
                    })
                    .to_string()
                ))
            }
            other => Err(ConnectionError::Invoke(format!("{name}: unknown command '{other}'"))),
        }
    }
}

#[async_trait]
impl Session for LabSession {
    async fn invoke(&self, command: &str, _options: &Value) -> Result<Value, ConnectionError> {
        self.log.lock().push(command.to_owned());
        if self.fault == Some(Fault::Unreachable) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(ConnectionError::Invoke(format!(
                "{}: command timed out",
                self.device.name
            )));
        }
        self.respond(command)
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        tracing::debug!(device = %self.device.name, commands = self.log.lock().len(), "lab session closed");
        Ok(())
    }
}

/// Driver of kind `lab` with per-device faults.
#[derive(Debug, Default)]
pub struct LabDriver {
    faults: Vec<(String, Fault)>,
}

impl LabDriver {
    /// Creates a driver where every device is healthy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a fault for the named device.
    #[must_use]
    pub fn with_fault(mut self, device: impl Into<String>, fault: Fault) -> Self {
        self.faults.push((device.into(), fault));
        self
    }

    fn fault(&self, device: &str) -> Option<Fault> {
        self.faults
            .iter()
            .find(|(name, _)| name == device)
            .map(|(_, fault)| *fault)
    }
}

#[async_trait]
impl ConnectionDriver for LabDriver {
    fn kind(&self) -> &str {
        "lab"
    }

    async fn open(
        &self,
        device: &Device,
        credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<ConnectionHandle, ConnectionError> {
        tracing::debug!(device = %device.name, user = %credentials.username, "opening lab session");
        Ok(Arc::new(LabSession {
            device: device.clone(),
            fault: self.fault(&device.name),
            log: Mutex::new(Vec::new()),
        }))
    }
}
