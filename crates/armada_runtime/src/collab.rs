//! External collaborators consumed by the engine.
//!
//! The engine never talks to a database, an identity provider or a secret
//! store directly. It goes through the traits below. In-memory
//! implementations ship alongside them for tests and demos.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use armada_workflow::policy::CredentialMode;
use armada_workflow::{Device, DeviceId, Pool};

use crate::error::{ConnectionError, PersistenceError};
use crate::result::{RunStatus, RuntimeId, StepResult};

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// A persisted step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Run lineage.
    pub runtime: RuntimeId,
    /// Step path inside the lineage.
    pub path: String,
    /// The result. Aggregate records have no device.
    pub result: StepResult,
}

/// A persisted run lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run lineage.
    pub runtime: RuntimeId,
    /// Root service name.
    pub service: String,
    /// Who started the run.
    pub creator: String,
    /// The run this one restarts, if any.
    pub parent: Option<RuntimeId>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Overall success, once finished.
    pub success: Option<bool>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

/// Inventory and result storage.
///
/// Writes are staged until [`commit`](Persistence::commit); reads observe
/// staged writes (read-your-writes within a run).
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Fetches a device by ID.
    async fn device(&self, id: DeviceId) -> Result<Option<Device>, PersistenceError>;

    /// Fetches a device by name.
    async fn device_by_name(&self, name: &str) -> Result<Option<Device>, PersistenceError>;

    /// Fetches a pool by name.
    async fn pool(&self, name: &str) -> Result<Option<Pool>, PersistenceError>;

    /// Stages a result record.
    async fn create_result(&self, record: ResultRecord) -> Result<(), PersistenceError>;

    /// Returns every result recorded for a lineage.
    async fn results(&self, runtime: &RuntimeId) -> Result<Vec<ResultRecord>, PersistenceError>;

    /// Stages a run record, replacing any previous record for the lineage.
    async fn save_run(&self, run: RunRecord) -> Result<(), PersistenceError>;

    /// Fetches a run record.
    async fn run(&self, runtime: &RuntimeId) -> Result<Option<RunRecord>, PersistenceError>;

    /// Makes staged writes durable.
    async fn commit(&self) -> Result<(), PersistenceError>;

    /// Discards staged writes.
    async fn rollback(&self) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
struct Store {
    results: Vec<ResultRecord>,
    runs: IndexMap<RuntimeId, RunRecord>,
}

/// In-memory [`Persistence`].
///
/// Commits can be made to fail with [`MemoryPersistence::fail_commits`].
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    devices: RwLock<IndexMap<DeviceId, Device>>,
    pools: RwLock<HashMap<String, Pool>>,
    committed: RwLock<Store>,
    staged: RwLock<Store>,
    fail_commits: AtomicBool,
}

impl MemoryPersistence {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device and returns self for chaining.
    #[must_use]
    pub fn with_device(self, device: Device) -> Self {
        self.add_device(device);
        self
    }

    /// Adds a pool and returns self for chaining.
    #[must_use]
    pub fn with_pool(self, pool: Pool) -> Self {
        self.pools.write().insert(pool.name.clone(), pool);
        self
    }

    /// Adds or replaces a device.
    pub fn add_device(&self, device: Device) {
        self.devices.write().insert(device.id, device);
    }

    /// Makes every subsequent commit fail (or succeed again).
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Returns the committed result records.
    #[must_use]
    pub fn committed_results(&self) -> Vec<ResultRecord> {
        self.committed.read().results.clone()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn device(&self, id: DeviceId) -> Result<Option<Device>, PersistenceError> {
        Ok(self.devices.read().get(&id).cloned())
    }

    async fn device_by_name(&self, name: &str) -> Result<Option<Device>, PersistenceError> {
        Ok(self
            .devices
            .read()
            .values()
            .find(|device| device.name == name)
            .cloned())
    }

    async fn pool(&self, name: &str) -> Result<Option<Pool>, PersistenceError> {
        Ok(self.pools.read().get(name).cloned())
    }

    async fn create_result(&self, record: ResultRecord) -> Result<(), PersistenceError> {
        self.staged.write().results.push(record);
        Ok(())
    }

    async fn results(&self, runtime: &RuntimeId) -> Result<Vec<ResultRecord>, PersistenceError> {
        let committed = self.committed.read();
        let staged = self.staged.read();
        Ok(committed
            .results
            .iter()
            .chain(&staged.results)
            .filter(|record| &record.runtime == runtime)
            .cloned()
            .collect())
    }

    async fn save_run(&self, run: RunRecord) -> Result<(), PersistenceError> {
        self.staged.write().runs.insert(run.runtime.clone(), run);
        Ok(())
    }

    async fn run(&self, runtime: &RuntimeId) -> Result<Option<RunRecord>, PersistenceError> {
        if let Some(run) = self.staged.read().runs.get(runtime) {
            return Ok(Some(run.clone()));
        }
        Ok(self.committed.read().runs.get(runtime).cloned())
    }

    async fn commit(&self) -> Result<(), PersistenceError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("commit rejected".into()));
        }
        let staged = core::mem::take(&mut *self.staged.write());
        let mut committed = self.committed.write();
        committed.results.extend(staged.results);
        committed.runs.extend(staged.runs);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PersistenceError> {
        *self.staged.write() = Store::default();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization
// ─────────────────────────────────────────────────────────────────────────────

/// The devices a user may run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceScope {
    /// Every device.
    All,
    /// Only the listed devices.
    Only(HashSet<DeviceId>),
}

impl DeviceScope {
    /// Returns true if the scope includes `device`.
    #[must_use]
    pub fn contains(&self, device: DeviceId) -> bool {
        match self {
            DeviceScope::All => true,
            DeviceScope::Only(devices) => devices.contains(&device),
        }
    }
}

/// Resolves a user's authorized device scope.
#[async_trait]
pub trait Authorization: Send + Sync + 'static {
    /// Returns the devices `user` may run against.
    async fn authorized_devices(&self, user: &str) -> Result<DeviceScope, PersistenceError>;
}

/// Fixed per-user scopes.
#[derive(Debug, Clone)]
pub struct StaticAuthorization {
    users: HashMap<String, DeviceScope>,
    fallback: DeviceScope,
}

impl StaticAuthorization {
    /// Authorizes every user for every device.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            users: HashMap::new(),
            fallback: DeviceScope::All,
        }
    }

    /// Authorizes unknown users for no device.
    #[must_use]
    pub fn deny_by_default() -> Self {
        Self {
            users: HashMap::new(),
            fallback: DeviceScope::Only(HashSet::new()),
        }
    }

    /// Restricts `user` to `devices`.
    #[must_use]
    pub fn with_user(
        mut self,
        user: impl Into<String>,
        devices: impl IntoIterator<Item = DeviceId>,
    ) -> Self {
        self.users
            .insert(user.into(), DeviceScope::Only(devices.into_iter().collect()));
        self
    }
}

impl Default for StaticAuthorization {
    fn default() -> Self {
        Self::allow_all()
    }
}

#[async_trait]
impl Authorization for StaticAuthorization {
    async fn authorized_devices(&self, user: &str) -> Result<DeviceScope, PersistenceError> {
        Ok(self.users.get(user).unwrap_or(&self.fallback).clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// A secret whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Username and secret used to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password or key.
    pub secret: Secret,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::new(secret),
        }
    }
}

/// Resolves credentials for device-bound and user-bound modes.
///
/// Custom mode is rendered by the engine and never reaches the resolver.
#[async_trait]
pub trait CredentialResolver: Send + Sync + 'static {
    /// Returns the credentials for opening a session to `device`.
    async fn credentials_for(
        &self,
        device: &Device,
        user: &str,
        mode: &CredentialMode,
    ) -> Result<Credentials, ConnectionError>;
}

/// Fixed device and user credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    devices: HashMap<DeviceId, Credentials>,
    users: HashMap<String, Credentials>,
    fallback: Option<Credentials>,
}

impl StaticCredentials {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets credentials bound to a device.
    #[must_use]
    pub fn with_device(mut self, device: DeviceId, credentials: Credentials) -> Self {
        self.devices.insert(device, credentials);
        self
    }

    /// Sets credentials bound to a user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>, credentials: Credentials) -> Self {
        self.users.insert(user.into(), credentials);
        self
    }

    /// Sets credentials used when nothing more specific is known.
    #[must_use]
    pub fn with_fallback(mut self, credentials: Credentials) -> Self {
        self.fallback = Some(credentials);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn credentials_for(
        &self,
        device: &Device,
        user: &str,
        mode: &CredentialMode,
    ) -> Result<Credentials, ConnectionError> {
        let specific = match mode {
            CredentialMode::Device => self.devices.get(&device.id),
            CredentialMode::User => self.users.get(user),
            CredentialMode::Custom { .. } => None,
        };
        specific
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                ConnectionError::Credentials(format!("no credentials for {} ({mode:?})", device.name))
            })
    }
}
