//! Demo fleet maintenance run built with Armada.
//!
//! A lab inventory of edge routers goes through a maintenance workflow:
//!
//! ```text
//!            ┌─────────┐ ok  ┌────────┐ ok  ┌────────────┐ ok
//!  Start ───▶│ version │────▶│ backup │────▶│ interfaces │────▶ End
//!            └────┬────┘     └────────┘     └─────┬──────┘
//!                 │ failed                        │ failed
//!                 ▼                               ▼
//!            ┌────────────────────────────────────────┐
//!            │              quarantine                │
//!            └────────────────────────────────────────┘
//! ```
//!
//! Each device follows its own path: devices that fail a check are
//! quarantined and never reach *End*, so they are reported as failures.

pub mod lab;

use core::time::Duration;
use std::sync::Arc;

use serde_json::json;

use armada_notifiers::ChatNotifier;
use armada_runtime::prelude::*;
use armada_workflow::prelude::*;

pub use lab::{Fault, LabDriver};

/// Name of the pool holding every lab device.
pub const POOL: &str = "edge";

/// Builds an inventory of `count` lab routers named `edge-1..=edge-N`, all in
/// the [`POOL`] pool.
#[must_use]
pub fn lab_inventory(count: u64) -> MemoryPersistence {
    let store = MemoryPersistence::new().with_pool(Pool::new(POOL, (1..=count).map(DeviceId)));
    for id in 1..=count {
        let site = if id % 2 == 0 { "lon" } else { "par" };
        store.add_device(
            Device::new(id, format!("edge-{id}"), format!("192.0.2.{id}"), "lab")
                .with_property("site", site),
        );
    }
    store
}

fn command(id: u64, name: &str, command: &str) -> Service {
    Service::atomic(id, name, "command").with_parameters(json!({ "command": command }))
}

/// Builds the maintenance workflow, targeting the whole [`POOL`].
///
/// # Errors
///
/// Fails only if the graph is wired inconsistently.
pub fn maintenance_workflow(run_mode: RunMode) -> Result<Service, WorkflowError> {
    let version = command(1, "version", "show version")
        .with_retry(RetryPolicy::new(2).with_delay(Duration::from_millis(50)))
        .with_validation(ValidationPolicy::new(ValidationMethod::regex(r"Armada OS 4\.\d")));
    let backup = command(2, "backup", "show running-config")
        .with_validation(ValidationPolicy::new(ValidationMethod::text("hostname")));
    let interfaces = command(3, "interfaces", "show interfaces")
        .with_conversion(ConversionMethod::Json)
        .with_validation(ValidationPolicy::new(ValidationMethod::dict_included(
            json!({"mgmt0": {"status": "up"}}),
        )));
    let quarantine = Service::atomic(4, "quarantine", "expression")
        .with_parameters(json!({"expression": "'quarantined ' + device.name"}))
        .with_postprocessing("success = False", PostprocessingMode::Always);

    let mut workflow = Workflow::new();
    let (start, end) = (workflow.start(), workflow.end());
    let version = workflow.add_service(version);
    let backup = workflow.add_service(backup);
    let interfaces = workflow.add_service(interfaces);
    let quarantine = workflow.add_service(quarantine);
    workflow
        .on_success(start, version)?
        .on_success(version, backup)?
        .on_success(backup, interfaces)?
        .on_success(interfaces, end)?
        .on_failure(version, quarantine)?
        .on_failure(interfaces, quarantine)?;
    if let Some(member) = workflow.member_mut(quarantine) {
        member.max_runs = Some(2);
    }

    let members = workflow.member_count();
    tracing::debug!(members, "maintenance workflow built");
    Ok(Service::workflow(100, "maintenance", workflow)
        .with_run_mode(run_mode)
        .with_max_processes(4)
        .with_targets(TargetConfig {
            pools: vec![POOL.to_owned()],
            require_targets: true,
            ..TargetConfig::default()
        })
        .with_notification(NotificationPolicy {
            send: true,
            channel: "log".to_owned(),
            include_device_results: true,
            ..NotificationPolicy::default()
        }))
}

/// Builds an engine over the lab inventory.
///
/// Engine settings come from `ARMADA_*` variables. Lab credentials come from
/// `LAB_USER`/`LAB_PASSWORD`. When `CHAT_WEBHOOK_URL` is set, a chat notifier
/// is registered under the `chat` channel.
///
/// # Errors
///
/// Returns [`ConfigError`] for invalid `ARMADA_*` values.
pub fn lab_engine(store: MemoryPersistence, driver: LabDriver) -> Result<Engine, ConfigError> {
    let config = EngineConfig::default().with_env_overrides()?;
    let username = std::env::var("LAB_USER").unwrap_or_else(|_| "lab".to_owned());
    let password = std::env::var("LAB_PASSWORD").unwrap_or_else(|_| "lab".to_owned());

    let mut builder = Engine::builder()
        .with_config(config)
        .with_persistence(Arc::new(store))
        .with_credentials(Arc::new(
            StaticCredentials::new().with_fallback(Credentials::new(username, password)),
        ))
        .with_driver(Arc::new(driver));
    if let Ok(notifier) = ChatNotifier::from_env("chat", "CHAT_WEBHOOK_URL") {
        builder = builder.with_notifier(Arc::new(notifier));
    }
    builder.build()
}
