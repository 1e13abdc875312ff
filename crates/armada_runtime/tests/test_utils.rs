//! Shared test utilities for `armada_runtime` integration tests.
//!
//! Provides a simulated device driver, scripted jobs, a recording notifier and
//! helpers that wire them into an [`Engine`].

#![allow(
    dead_code,
    missing_docs,
    reason = "shared test utilities, not every item is used by every test binary"
)]

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde_json::{Value, json};

use armada_runtime::prelude::*;
use armada_workflow::policy::TargetConfig;
use armada_workflow::{Device, DeviceId, Pool};

// ═══════════════════════════════════════════════════════════════════════════════
// SIMULATED DEVICES
// ═══════════════════════════════════════════════════════════════════════════════

/// A session that echoes commands and can be made to fail its probe.
#[derive(Debug)]
pub struct SimSession {
    device: String,
    healthy: AtomicBool,
    closes: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl SimSession {
    fn new(device: &str) -> Self {
        Self {
            device: device.to_owned(),
            healthy: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl Session for SimSession {
    async fn invoke(&self, command: &str, _options: &Value) -> Result<Value, ConnectionError> {
        self.commands.lock().push(command.to_owned());
        Ok(Value::String(format!("{}# {command}", self.device)))
    }

    async fn is_alive(&self) -> bool {
        self.closes() == 0
    }

    async fn probe(&self) -> Result<(), ConnectionError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::Probe(format!("{} is unresponsive", self.device)))
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Driver of kind `sim` that remembers every session it opened.
#[derive(Debug, Default)]
pub struct SimDriver {
    sessions: Mutex<Vec<Arc<SimSession>>>,
}

impl SimDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<Arc<SimSession>> {
        self.sessions.lock().clone()
    }

    /// Makes every session opened so far fail its liveness probe.
    pub fn fail_probes(&self) {
        for session in self.sessions.lock().iter() {
            session.set_healthy(false);
        }
    }
}

#[async_trait]
impl ConnectionDriver for SimDriver {
    fn kind(&self) -> &str {
        "sim"
    }

    async fn open(
        &self,
        device: &Device,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let session = Arc::new(SimSession::new(&device.name));
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JOBS
// ═══════════════════════════════════════════════════════════════════════════════

type JobFn = dyn Fn(&JobContext<'_>) -> Result<Value, JobError> + Send + Sync;

/// A job backed by a closure.
pub struct FnJob {
    name: String,
    calls: AtomicUsize,
    body: Box<JobFn>,
}

impl FnJob {
    pub fn new<F>(name: &str, body: F) -> Arc<Self>
    where
        F: Fn(&JobContext<'_>) -> Result<Value, JobError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_owned(),
            calls: AtomicUsize::new(0),
            body: Box::new(body),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for FnJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &JobContext<'_>) -> Result<Value, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.body)(ctx)
    }
}

/// Fails the first `failures` attempts of every device, then succeeds.
#[derive(Debug)]
pub struct FlakyJob {
    failures: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FlakyJob {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn attempts(&self, device: &str) -> u32 {
        self.attempts.lock().get(device).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Job for FlakyJob {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(&self, ctx: &JobContext<'_>) -> Result<Value, JobError> {
        let device = ctx.device().map_or("-", |d| d.name.as_str()).to_owned();
        let attempt = {
            let mut attempts = self.attempts.lock();
            let attempt = attempts.entry(device.clone()).or_insert(0);
            *attempt += 1;
            *attempt
        };
        if attempt <= self.failures {
            return Err(JobError::failed(format!("{device} unreachable (attempt {attempt})")));
        }
        Ok(json!({"device": device, "attempt": attempt}))
    }
}

/// Succeeds, and requests a stop of its own run on the `stop_at`-th call.
#[derive(Debug)]
pub struct StoppingJob {
    engine: OnceLock<Engine>,
    stop_at: u32,
    calls: AtomicU32,
}

impl StoppingJob {
    pub fn new(stop_at: u32) -> Arc<Self> {
        Arc::new(Self {
            engine: OnceLock::new(),
            stop_at,
            calls: AtomicU32::new(0),
        })
    }

    pub fn attach(&self, engine: &Engine) {
        let _ = self.engine.set(engine.clone());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for StoppingJob {
    fn name(&self) -> &str {
        "stopping"
    }

    async fn run(&self, ctx: &JobContext<'_>) -> Result<Value, JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.stop_at
            && let Some(engine) = self.engine.get()
        {
            engine.request_stop(ctx.runtime());
        }
        Ok(json!({"call": call}))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NOTIFIER
// ═══════════════════════════════════════════════════════════════════════════════

/// Notifier on channel `test` that keeps what it was sent.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> &str {
        "test"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FIXTURES
// ═══════════════════════════════════════════════════════════════════════════════

/// Devices `r1..=rN` on the `sim` driver, all in pool `core`.
pub fn inventory(count: u64) -> Arc<MemoryPersistence> {
    let store = MemoryPersistence::new().with_pool(Pool::new("core", (1..=count).map(DeviceId)));
    for id in 1..=count {
        store.add_device(
            Device::new(id, format!("r{id}"), format!("10.0.0.{id}"), "sim")
                .with_property("site", if id % 2 == 0 { "lon" } else { "par" }),
        );
    }
    Arc::new(store)
}

/// Device IDs `1..=count`.
pub fn device_ids(count: u64) -> Vec<DeviceId> {
    (1..=count).map(DeviceId).collect()
}

/// An engine builder over `store` with the simulated driver and fallback
/// credentials.
pub fn builder(store: &Arc<MemoryPersistence>, driver: &Arc<SimDriver>) -> EngineBuilder {
    let persistence: Arc<dyn Persistence> = store.clone();
    let connection: Arc<dyn ConnectionDriver> = driver.clone();
    Engine::builder()
        .with_persistence(persistence)
        .with_credentials(Arc::new(
            StaticCredentials::new().with_fallback(Credentials::new("admin", "admin")),
        ))
        .with_driver(connection)
}

/// Collects every hook event emitted by `engine`.
pub fn record_events(engine: &Engine) -> Arc<Mutex<Vec<RunEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine
        .hooks()
        .observe_all("recorder", move |event| sink.lock().push(event.clone()))
        .expect("recorder registers once");
    events
}

/// A target config naming devices explicitly.
pub fn targets(ids: &[u64]) -> TargetConfig {
    TargetConfig {
        devices: ids.iter().copied().map(DeviceId).collect(),
        ..TargetConfig::default()
    }
}
