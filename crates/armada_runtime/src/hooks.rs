//! Lifecycle hooks for run execution.
//!
//! [`RunHooks`] is a registry of named observers. Every observer receives
//! `&RunEvent` and matches on the variants it cares about.
//!
//! # Example
//!
//! ```
//! use armada_runtime::hooks::{RunEvent, RunEventKind, RunHooks};
//!
//! let hooks = RunHooks::new();
//! hooks
//!     .register_observer("logger", &[RunEventKind::DeviceRetry], |event: &RunEvent| {
//!         if let RunEvent::DeviceRetry { device, attempt, .. } = event {
//!             tracing::info!(%device, attempt, "retrying");
//!         }
//!     })
//!     .unwrap();
//! ```

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use armada_workflow::DeviceId;

use crate::result::{RunStatus, RuntimeId};

// ─────────────────────────────────────────────────────────────────────────────
// RunEvent
// ─────────────────────────────────────────────────────────────────────────────

/// Events emitted during run execution.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A top-level run started.
    RunStart {
        /// Run lineage.
        runtime: RuntimeId,
        /// Root service.
        service: String,
    },
    /// A top-level run finished.
    RunComplete {
        /// Run lineage.
        runtime: RuntimeId,
        /// Terminal status.
        status: RunStatus,
        /// Overall success.
        success: bool,
        /// Total duration.
        duration: Duration,
    },
    /// A step started.
    StepStart {
        /// Run lineage.
        runtime: RuntimeId,
        /// Step path.
        path: String,
        /// Number of targets handed to the step, before resolution.
        targets: usize,
    },
    /// A step finished.
    StepComplete {
        /// Run lineage.
        runtime: RuntimeId,
        /// Step path.
        path: String,
        /// Aggregate success.
        success: bool,
        /// Step duration.
        duration: Duration,
    },
    /// A device-level attempt is starting.
    DeviceAttempt {
        /// Run lineage.
        runtime: RuntimeId,
        /// Step path.
        path: String,
        /// Device, or `None` for device-less steps.
        device: Option<DeviceId>,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A device-level attempt failed and will be retried.
    DeviceRetry {
        /// Run lineage.
        runtime: RuntimeId,
        /// Step path.
        path: String,
        /// Device label.
        device: String,
        /// The attempt that failed.
        attempt: u32,
        /// Its error text.
        error: Option<String>,
    },
    /// A device session was opened.
    ConnectionOpened {
        /// Run lineage.
        runtime: RuntimeId,
        /// Device.
        device: DeviceId,
        /// Driver kind.
        kind: String,
        /// Connection name.
        name: String,
    },
    /// A device session was closed.
    ConnectionClosed {
        /// Run lineage.
        runtime: RuntimeId,
        /// Device.
        device: DeviceId,
        /// Driver kind.
        kind: String,
        /// Connection name.
        name: String,
    },
}

/// Discriminant of [`RunEvent`], used to subscribe to a subset of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEventKind {
    /// [`RunEvent::RunStart`].
    RunStart,
    /// [`RunEvent::RunComplete`].
    RunComplete,
    /// [`RunEvent::StepStart`].
    StepStart,
    /// [`RunEvent::StepComplete`].
    StepComplete,
    /// [`RunEvent::DeviceAttempt`].
    DeviceAttempt,
    /// [`RunEvent::DeviceRetry`].
    DeviceRetry,
    /// [`RunEvent::ConnectionOpened`].
    ConnectionOpened,
    /// [`RunEvent::ConnectionClosed`].
    ConnectionClosed,
}

impl RunEventKind {
    /// Every event kind.
    pub const ALL: [RunEventKind; 8] = [
        RunEventKind::RunStart,
        RunEventKind::RunComplete,
        RunEventKind::StepStart,
        RunEventKind::StepComplete,
        RunEventKind::DeviceAttempt,
        RunEventKind::DeviceRetry,
        RunEventKind::ConnectionOpened,
        RunEventKind::ConnectionClosed,
    ];
}

impl RunEvent {
    /// Returns the event's kind.
    #[must_use]
    pub fn kind(&self) -> RunEventKind {
        match self {
            RunEvent::RunStart { .. } => RunEventKind::RunStart,
            RunEvent::RunComplete { .. } => RunEventKind::RunComplete,
            RunEvent::StepStart { .. } => RunEventKind::StepStart,
            RunEvent::StepComplete { .. } => RunEventKind::StepComplete,
            RunEvent::DeviceAttempt { .. } => RunEventKind::DeviceAttempt,
            RunEvent::DeviceRetry { .. } => RunEventKind::DeviceRetry,
            RunEvent::ConnectionOpened { .. } => RunEventKind::ConnectionOpened,
            RunEvent::ConnectionClosed { .. } => RunEventKind::ConnectionClosed,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HookRegistrationError
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during hook registration.
#[derive(Debug, Clone)]
pub enum HookRegistrationError {
    /// A hook with this name already exists for the event kind.
    DuplicateName {
        /// The event kind where the duplicate was found.
        kind: RunEventKind,
        /// The duplicate hook name.
        name: String,
    },
}

impl fmt::Display for HookRegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookRegistrationError::DuplicateName { kind, name } => {
                write!(f, "hook '{name}' already registered for {kind:?}")
            }
        }
    }
}

impl core::error::Error for HookRegistrationError {}

// ─────────────────────────────────────────────────────────────────────────────
// RunHooks
// ─────────────────────────────────────────────────────────────────────────────

type Observer = Arc<dyn Fn(&RunEvent) + Send + Sync>;

struct HookEntry {
    name: String,
    observer: Observer,
}

/// Registry of run lifecycle observers.
///
/// Uses interior mutability so hooks can be registered on a shared engine.
#[derive(Default)]
pub struct RunHooks {
    hooks: RwLock<HashMap<RunEventKind, Vec<HookEntry>>>,
}

impl fmt::Debug for RunHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        let mut map = f.debug_map();
        for (kind, entries) in hooks.iter() {
            map.entry(kind, &entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>());
        }
        map.finish()
    }
}

impl RunHooks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for the given event kinds.
    ///
    /// Registration is all-or-nothing: on a duplicate name nothing is added.
    ///
    /// # Errors
    ///
    /// Returns [`HookRegistrationError::DuplicateName`] if `name` is already
    /// registered for one of the kinds.
    pub fn register_observer<F>(
        &self,
        name: impl Into<String>,
        kinds: &[RunEventKind],
        observer: F,
    ) -> Result<&Self, HookRegistrationError>
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        let name = name.into();
        let observer: Observer = Arc::new(observer);
        let mut hooks = self.hooks.write();

        for kind in kinds {
            let taken = hooks
                .get(kind)
                .is_some_and(|entries| entries.iter().any(|entry| entry.name == name));
            if taken {
                return Err(HookRegistrationError::DuplicateName {
                    kind: *kind,
                    name,
                });
            }
        }
        for kind in kinds {
            hooks.entry(*kind).or_default().push(HookEntry {
                name: name.clone(),
                observer: Arc::clone(&observer),
            });
        }
        Ok(self)
    }

    /// Registers an observer for every event kind.
    ///
    /// # Errors
    ///
    /// See [`RunHooks::register_observer`].
    pub fn observe_all<F>(
        &self,
        name: impl Into<String>,
        observer: F,
    ) -> Result<&Self, HookRegistrationError>
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        self.register_observer(name, &RunEventKind::ALL, observer)
    }

    /// Invokes the observers registered for the event's kind, in
    /// registration order.
    pub fn emit(&self, event: &RunEvent) {
        // Clone out so observers may register hooks without deadlocking.
        let observers: Vec<Observer> = {
            let hooks = self.hooks.read();
            match hooks.get(&event.kind()) {
                Some(entries) => entries.iter().map(|e| Arc::clone(&e.observer)).collect(),
                None => return,
            }
        };
        for observer in observers {
            observer(event);
        }
    }

    /// Returns the number of observers for an event kind.
    #[must_use]
    pub fn hook_count(&self, kind: RunEventKind) -> usize {
        self.hooks.read().get(&kind).map_or(0, Vec::len)
    }

    /// Checks if a hook with the given name exists for the event kind.
    #[must_use]
    pub fn contains_hook(&self, kind: RunEventKind, name: &str) -> bool {
        self.hooks
            .read()
            .get(&kind)
            .is_some_and(|entries| entries.iter().any(|entry| entry.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn start() -> RunEvent {
        RunEvent::RunStart {
            runtime: RuntimeId::new(),
            service: "ping".into(),
        }
    }

    #[test]
    fn register_increments_count() {
        let hooks = RunHooks::new();
        hooks
            .register_observer("a", &[RunEventKind::RunStart], |_| {})
            .unwrap()
            .register_observer("b", &[RunEventKind::RunStart], |_| {})
            .unwrap();
        assert_eq!(hooks.hook_count(RunEventKind::RunStart), 2);
        assert_eq!(hooks.hook_count(RunEventKind::RunComplete), 0);
        assert!(hooks.contains_hook(RunEventKind::RunStart, "a"));
    }

    #[test]
    fn duplicate_name_is_rejected_without_partial_registration() {
        let hooks = RunHooks::new();
        hooks
            .register_observer("a", &[RunEventKind::StepStart], |_| {})
            .unwrap();
        let err = hooks
            .register_observer("a", &[RunEventKind::RunStart, RunEventKind::StepStart], |_| {})
            .unwrap_err();
        assert!(matches!(err, HookRegistrationError::DuplicateName { kind: RunEventKind::StepStart, .. }));
        assert_eq!(hooks.hook_count(RunEventKind::RunStart), 0);
    }

    #[test]
    fn emit_reaches_matching_observers_only() {
        let hooks = RunHooks::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        hooks
            .observe_all("counter", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        hooks
            .register_observer("never", &[RunEventKind::ConnectionClosed], |_| {
                panic!("should not be called");
            })
            .unwrap();
        hooks.emit(&start());
        hooks.emit(&start());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
