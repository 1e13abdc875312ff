//! Device sessions, connection drivers and the per-lineage connection cache.
//!
//! Drivers are pluggable per device type. A [`ConnectionDriver`] opens a
//! [`Session`]; the [`ConnectionCache`] owns every open session, keyed by
//! [`ConnectionKey`], so steps of the same lineage reuse them.
//!
//! The cache never holds its lock across a probe, open or close call.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use armada_workflow::{Device, DeviceId};

use crate::collab::Credentials;
use crate::error::ConnectionError;
use crate::hooks::{RunEvent, RunHooks};
use crate::result::RuntimeId;

// ─────────────────────────────────────────────────────────────────────────────
// Session and driver traits
// ─────────────────────────────────────────────────────────────────────────────

/// An open session to a device.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Sends a command and returns its output.
    async fn invoke(&self, command: &str, options: &Value) -> Result<Value, ConnectionError>;

    /// Returns false once the session is known to be closed.
    async fn is_alive(&self) -> bool;

    /// Issues a harmless command to check the session still responds.
    async fn probe(&self) -> Result<(), ConnectionError>;

    /// Closes the session.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Shared handle to an open session.
pub type ConnectionHandle = Arc<dyn Session>;

/// Opens sessions for one kind of device.
#[async_trait]
pub trait ConnectionDriver: Send + Sync + 'static {
    /// The driver kind, matched against `Device::driver` or the service's
    /// connection policy.
    fn kind(&self) -> &str;

    /// Opens a session. The engine also enforces `timeout` around the call.
    async fn open(
        &self,
        device: &Device,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<ConnectionHandle, ConnectionError>;
}

/// Registry of connection drivers by kind.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: IndexMap<String, Arc<dyn ConnectionDriver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver under its kind, replacing any previous driver.
    pub fn register(&mut self, driver: Arc<dyn ConnectionDriver>) -> Option<Arc<dyn ConnectionDriver>> {
        self.drivers.insert(driver.kind().to_owned(), driver)
    }

    /// Returns the driver for `kind`.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn ConnectionDriver>> {
        self.drivers.get(kind).cloned()
    }

    /// Returns true if a driver is registered for `kind`.
    #[must_use]
    pub fn has(&self, kind: &str) -> bool {
        self.drivers.contains_key(kind)
    }

    /// Returns the registered kinds.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionKey
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of a cached session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Run lineage owning the session.
    pub runtime: RuntimeId,
    /// Target device.
    pub device: DeviceId,
    /// Driver kind.
    pub kind: String,
    /// Logical connection name.
    pub name: String,
}

impl ConnectionKey {
    /// Creates a key.
    pub fn new(
        runtime: RuntimeId,
        device: DeviceId,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            device,
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.runtime, self.device, self.kind, self.name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionCache
// ─────────────────────────────────────────────────────────────────────────────

/// Per-lineage cache of open sessions.
///
/// # Example
///
/// ```
/// # use armada_runtime::connection::{ConnectionCache, ConnectionKey};
/// # use armada_runtime::result::RuntimeId;
/// # use armada_workflow::DeviceId;
/// # async fn demo(cache: &ConnectionCache, runtime: RuntimeId) {
/// let key = ConnectionKey::new(runtime.clone(), DeviceId::new(1), "ssh", "default");
/// if cache.get(&key).await.is_none() {
///     // open a new session and `put` it
/// }
/// cache.close_all(&runtime).await;
/// # }
/// ```
pub struct ConnectionCache {
    handles: Mutex<HashMap<ConnectionKey, ConnectionHandle>>,
    close_concurrency: usize,
    hooks: Option<Arc<RunHooks>>,
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("open", &self.len())
            .field("close_concurrency", &self.close_concurrency)
            .finish()
    }
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new(8)
    }
}

impl ConnectionCache {
    /// Creates a cache closing at most `close_concurrency` sessions at once
    /// in [`close_all`](Self::close_all).
    #[must_use]
    pub fn new(close_concurrency: usize) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            close_concurrency: close_concurrency.max(1),
            hooks: None,
        }
    }

    /// Emits [`RunEvent::ConnectionClosed`] through `hooks`.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<RunHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Returns the number of cached sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns true if no session is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Returns true if a session is cached under `key`, without probing it.
    #[must_use]
    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.handles.lock().contains_key(key)
    }

    /// Returns the cached session for `key` if it passes a liveness probe.
    ///
    /// A session failing the probe is closed and evicted, and `None` is
    /// returned so the caller opens a fresh one.
    pub async fn get(&self, key: &ConnectionKey) -> Option<ConnectionHandle> {
        let handle = self.handles.lock().get(key).cloned()?;
        if handle.is_alive().await && handle.probe().await.is_ok() {
            return Some(handle);
        }
        tracing::debug!(connection = %key, "cached session failed liveness probe");
        let evicted = {
            let mut handles = self.handles.lock();
            // Another caller may have replaced the session meanwhile.
            match handles.get(key) {
                Some(current) if Arc::ptr_eq(current, &handle) => handles.remove(key),
                _ => None,
            }
        };
        if let Some(evicted) = evicted {
            self.close(key, &evicted).await;
        }
        None
    }

    /// Caches a session. A session previously cached under `key` is closed.
    pub async fn put(&self, key: ConnectionKey, handle: ConnectionHandle) {
        let replaced = self.handles.lock().insert(key.clone(), handle.clone());
        if let Some(replaced) = replaced
            && !Arc::ptr_eq(&replaced, &handle)
        {
            self.close(&key, &replaced).await;
        }
    }

    /// Closes and removes the session cached under `key`. Returns true if one
    /// was cached.
    pub async fn evict(&self, key: &ConnectionKey) -> bool {
        let removed = self.handles.lock().remove(key);
        match removed {
            Some(handle) => {
                self.close(key, &handle).await;
                true
            }
            None => false,
        }
    }

    /// Closes every session of a lineage with bounded fan-out. Close errors
    /// are logged. Returns the number of sessions closed.
    pub async fn close_all(&self, runtime: &RuntimeId) -> usize {
        let drained: Vec<(ConnectionKey, ConnectionHandle)> = {
            let mut handles = self.handles.lock();
            let keys: Vec<ConnectionKey> = handles
                .keys()
                .filter(|key| &key.runtime == runtime)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| handles.remove(&key).map(|handle| (key, handle)))
                .collect()
        };
        let count = drained.len();
        futures::stream::iter(drained)
            .for_each_concurrent(self.close_concurrency, |(key, handle)| async move {
                self.close(&key, &handle).await;
            })
            .await;
        if count > 0 {
            tracing::debug!(%runtime, count, "closed lineage connections");
        }
        count
    }

    async fn close(&self, key: &ConnectionKey, handle: &ConnectionHandle) {
        if let Err(err) = handle.close().await {
            tracing::warn!(connection = %key, error = %err, "failed to close session");
        }
        if let Some(hooks) = &self.hooks {
            hooks.emit(&RunEvent::ConnectionClosed {
                runtime: key.runtime.clone(),
                device: key.device,
                kind: key.kind.clone(),
                name: key.name.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSession {
        healthy: AtomicBool,
        closes: AtomicUsize,
    }

    impl FakeSession {
        fn healthy() -> Arc<Self> {
            let session = Self::default();
            session.healthy.store(true, Ordering::SeqCst);
            Arc::new(session)
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn invoke(&self, command: &str, _options: &Value) -> Result<Value, ConnectionError> {
            Ok(Value::from(command))
        }

        async fn is_alive(&self) -> bool {
            self.closes.load(Ordering::SeqCst) == 0
        }

        async fn probe(&self) -> Result<(), ConnectionError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ConnectionError::Probe("no prompt".into()))
            }
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(ConnectionError::Close("socket already gone".into()))
        }
    }

    fn key(runtime: &RuntimeId, device: u64) -> ConnectionKey {
        ConnectionKey::new(runtime.clone(), DeviceId::new(device), "ssh", "default")
    }

    #[tokio::test]
    async fn put_then_get_returns_same_handle() {
        let cache = ConnectionCache::default();
        let runtime = RuntimeId::new();
        let session = FakeSession::healthy();
        let handle: ConnectionHandle = session.clone();
        cache.put(key(&runtime, 1), handle.clone()).await;
        let cached = cache.get(&key(&runtime, 1)).await.unwrap();
        assert!(Arc::ptr_eq(&cached, &handle));
    }

    #[tokio::test]
    async fn failed_probe_evicts_and_closes() {
        let cache = ConnectionCache::default();
        let runtime = RuntimeId::new();
        let session = FakeSession::healthy();
        cache.put(key(&runtime, 1), session.clone()).await;
        session.healthy.store(false, Ordering::SeqCst);

        assert!(cache.get(&key(&runtime, 1)).await.is_none());
        assert!(!cache.contains(&key(&runtime, 1)));
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_all_only_touches_one_lineage() {
        let cache = ConnectionCache::new(2);
        let (a, b) = (RuntimeId::new(), RuntimeId::new());
        let sessions: Vec<_> = (0..5).map(|_| FakeSession::healthy()).collect();
        for (i, session) in sessions.iter().enumerate() {
            cache.put(key(&a, i as u64), session.clone()).await;
        }
        let other = FakeSession::healthy();
        cache.put(key(&b, 0), other.clone()).await;

        // Close errors are swallowed.
        assert_eq!(cache.close_all(&a).await, 5);
        assert_eq!(cache.len(), 1);
        assert!(sessions.iter().all(|s| s.closes.load(Ordering::SeqCst) == 1));
        assert_eq!(other.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replacing_a_handle_closes_the_old_one() {
        let cache = ConnectionCache::default();
        let runtime = RuntimeId::new();
        let first = FakeSession::healthy();
        cache.put(key(&runtime, 1), first.clone()).await;
        cache.put(key(&runtime, 1), FakeSession::healthy()).await;
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert!(cache.evict(&key(&runtime, 1)).await);
        assert!(cache.is_empty());
    }
}
