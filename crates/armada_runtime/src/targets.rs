//! Target resolution.
//!
//! A step's targets are the union of its explicit devices, the members of its
//! pools and the result of its dynamic query, de-duplicated in that order and
//! filtered against the caller's authorized scope.

use indexmap::IndexMap;
use serde_json::Value;

use armada_workflow::policy::TargetConfig;
use armada_workflow::{Device, DeviceId};

use crate::collab::{Authorization, Persistence};
use crate::error::RunError;
use crate::expression::{Evaluator, Scope};
use crate::telemetry::SECURITY_TARGET;

/// Resolves a [`TargetConfig`] into a concrete device set.
pub struct TargetResolver<'a> {
    persistence: &'a dyn Persistence,
    authorization: &'a dyn Authorization,
    evaluator: &'a Evaluator,
}

impl core::fmt::Debug for TargetResolver<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TargetResolver").finish_non_exhaustive()
    }
}

impl<'a> TargetResolver<'a> {
    /// Creates a resolver over the given collaborators.
    #[must_use]
    pub fn new(
        persistence: &'a dyn Persistence,
        authorization: &'a dyn Authorization,
        evaluator: &'a Evaluator,
    ) -> Self {
        Self {
            persistence,
            authorization,
            evaluator,
        }
    }

    /// Resolves `config` for `user`. The query is evaluated in `scope`.
    ///
    /// Devices outside the user's authorized scope are dropped and logged
    /// under the `armada::security` target.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::TargetResolution`] for unknown devices or pools and
    /// for query results that do not describe devices.
    pub async fn resolve(
        &self,
        config: &TargetConfig,
        user: &str,
        scope: &Scope<'_>,
    ) -> Result<Vec<Device>, RunError> {
        let mut resolved: IndexMap<DeviceId, Device> = IndexMap::new();

        for id in &config.devices {
            let device = self.by_id(*id).await?;
            resolved.entry(device.id).or_insert(device);
        }

        for name in &config.pools {
            let pool = self
                .persistence
                .pool(name)
                .await?
                .ok_or_else(|| RunError::TargetResolution(format!("unknown pool '{name}'")))?;
            for id in pool.devices {
                let device = self.by_id(id).await?;
                resolved.entry(device.id).or_insert(device);
            }
        }

        if let Some(query) = &config.query {
            let value = self
                .evaluator
                .evaluate(query, scope)
                .map_err(|err| RunError::TargetResolution(format!("target query failed: {err}")))?;
            for device in self.from_query(value).await? {
                resolved.entry(device.id).or_insert(device);
            }
        }

        let authorized = self.authorization.authorized_devices(user).await?;
        let (permitted, denied): (Vec<Device>, Vec<Device>) = resolved
            .into_values()
            .partition(|device| authorized.contains(device.id));
        for device in &denied {
            tracing::warn!(
                target: SECURITY_TARGET,
                user,
                device = %device.name,
                "dropping target outside authorized scope"
            );
        }
        Ok(permitted)
    }

    async fn by_id(&self, id: DeviceId) -> Result<Device, RunError> {
        self.persistence
            .device(id)
            .await?
            .ok_or_else(|| RunError::TargetResolution(format!("unknown device {id}")))
    }

    async fn by_name(&self, name: &str) -> Result<Device, RunError> {
        self.persistence
            .device_by_name(name)
            .await?
            .ok_or_else(|| RunError::TargetResolution(format!("unknown device '{name}'")))
    }

    /// Maps a query result to devices. A single value is treated as a
    /// one-element list; `null` selects nothing.
    async fn from_query(&self, value: Value) -> Result<Vec<Device>, RunError> {
        let items = match value {
            Value::Null => return Ok(Vec::new()),
            Value::Array(items) => items,
            single => vec![single],
        };
        let mut devices = Vec::with_capacity(items.len());
        for item in items {
            let device = match &item {
                Value::Number(n) => match n.as_u64() {
                    Some(id) => self.by_id(DeviceId::new(id)).await?,
                    None => return Err(invalid_item(&item)),
                },
                Value::String(name) => self.by_name(name).await?,
                Value::Object(map) => match (map.get("id").and_then(Value::as_u64), map.get("name")) {
                    (Some(id), _) => self.by_id(DeviceId::new(id)).await?,
                    (None, Some(Value::String(name))) => self.by_name(name).await?,
                    _ => return Err(invalid_item(&item)),
                },
                _ => return Err(invalid_item(&item)),
            };
            devices.push(device);
        }
        Ok(devices)
    }
}

fn invalid_item(item: &Value) -> RunError {
    RunError::TargetResolution(format!("target query returned a non-device value: {item}"))
}
