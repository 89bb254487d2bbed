//! Lazily loaded model handles with single-flight loading and admission control.
//!
//! One handle exists per catalog key for the life of the registry. Each handle
//! has its own lock, so loading one model never blocks an acquire of another.
//! The only state shared between handles is the memory budget, which is always
//! updated while the owning handle's lock is held (handle lock first, budget
//! lock second).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, ModelDescriptor};
use crate::error::{Error, Result};
use crate::{Loader, ModelLike};

type Backend = Arc<dyn ModelLike>;
type LoadOutcome = Option<std::result::Result<Backend, Arc<anyhow::Error>>>;

/// Lifecycle state of a handle as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

/// Point-in-time view of one handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleStatus {
    pub key: String,
    pub state: HandleState,
    /// Unix seconds of the last successful load.
    pub loaded_at: Option<u64>,
    pub load_attempts: u64,
    pub last_error: Option<String>,
}

// Ready is terminal: nothing unloads a model today. An eviction policy would move
// Ready back to Unloaded under the handle lock and release the memory units in the
// same critical section; callers already holding the backend Arc keep it alive
// until their inference finishes.
enum Slot {
    Unloaded,
    Loading {
        outcome: watch::Receiver<LoadOutcome>,
    },
    Ready {
        backend: Backend,
        loaded_at: SystemTime,
    },
    Failed {
        error: Arc<anyhow::Error>,
    },
}

impl Slot {
    fn state(&self) -> HandleState {
        match self {
            Slot::Unloaded => HandleState::Unloaded,
            Slot::Loading { .. } => HandleState::Loading,
            Slot::Ready { .. } => HandleState::Ready,
            Slot::Failed { .. } => HandleState::Failed,
        }
    }
}

struct HandleInner {
    slot: Slot,
    load_attempts: u64,
}

struct ModelHandle {
    descriptor: Arc<ModelDescriptor>,
    inner: Mutex<HandleInner>,
}

impl ModelHandle {
    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        // Nothing panics while holding this lock; recover the data if something did.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Budget {
    limit: u32,
    committed: Mutex<u32>,
}

impl Budget {
    fn committed(&self) -> MutexGuard<'_, u32> {
        self.committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_commit(&self, descriptor: &ModelDescriptor) -> Result<()> {
        let requested = descriptor.memory_class.weight();
        let mut committed = self.committed();
        if *committed + requested > self.limit {
            return Err(Error::CapacityExceeded {
                key: descriptor.key.clone(),
                class: descriptor.memory_class,
                requested,
                committed: *committed,
                budget: self.limit,
            });
        }
        *committed += requested;
        Ok(())
    }

    fn release(&self, descriptor: &ModelDescriptor) {
        let mut committed = self.committed();
        *committed = committed.saturating_sub(descriptor.memory_class.weight());
    }
}

/// Owns every model handle. Built once by the composition root and shared by
/// reference with request handlers.
pub struct ModelRegistry {
    catalog: Arc<Catalog>,
    loader: Arc<dyn Loader>,
    handles: HashMap<String, Arc<ModelHandle>>,
    budget: Arc<Budget>,
}

impl ModelRegistry {
    pub fn new(catalog: Arc<Catalog>, loader: Arc<dyn Loader>, memory_budget: u32) -> Self {
        let handles = catalog
            .list()
            .iter()
            .map(|descriptor| {
                let handle = ModelHandle {
                    descriptor: descriptor.clone(),
                    inner: Mutex::new(HandleInner {
                        slot: Slot::Unloaded,
                        load_attempts: 0,
                    }),
                };
                (descriptor.key.clone(), Arc::new(handle))
            })
            .collect();
        Self {
            catalog,
            loader,
            handles,
            budget: Arc::new(Budget {
                limit: memory_budget,
                committed: Mutex::new(0),
            }),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Returns a ready backend for `key`, loading it first if needed.
    ///
    /// Concurrent callers for a key that is not ready share one load and all
    /// observe its outcome. A failed key is retried by the next caller. The load
    /// runs on its own task, so a caller that stops waiting does not cancel it.
    pub async fn acquire(&self, key: &str) -> Result<Backend> {
        let handle = self
            .handles
            .get(key)
            .ok_or_else(|| Error::UnknownModel(key.to_string()))?;

        let mut outcome = {
            let mut inner = handle.lock();
            let in_flight = match &inner.slot {
                Slot::Ready { backend, .. } => return Ok(backend.clone()),
                Slot::Loading { outcome } => Some(outcome.clone()),
                Slot::Unloaded | Slot::Failed { .. } => None,
            };
            match in_flight {
                Some(outcome) => {
                    debug!(model = %key, "waiting for in-flight load");
                    outcome
                }
                None => {
                    if let Err(err) = self.budget.try_commit(&handle.descriptor) {
                        warn!(model = %key, "{err}");
                        return Err(err);
                    }
                    let (tx, rx) = watch::channel(None);
                    inner.slot = Slot::Loading {
                        outcome: rx.clone(),
                    };
                    inner.load_attempts += 1;
                    self.spawn_load(handle.clone(), tx);
                    rx
                }
            }
        };

        let resolved = outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());

        match resolved {
            Some(Ok(backend)) => Ok(backend),
            Some(Err(cause)) => Err(Error::LoadFailed {
                key: key.to_string(),
                cause,
            }),
            None => Err(Error::LoadFailed {
                key: key.to_string(),
                cause: Arc::new(anyhow!("load was abandoned before completing")),
            }),
        }
    }

    /// Loads `key` without running anything on it.
    pub async fn preload(&self, key: &str) -> Result<()> {
        self.acquire(key).await.map(|_| ())
    }

    fn spawn_load(&self, handle: Arc<ModelHandle>, tx: watch::Sender<LoadOutcome>) {
        let loader = self.loader.clone();
        let budget = self.budget.clone();
        tokio::spawn(async move {
            let descriptor = handle.descriptor.clone();
            let started = Instant::now();
            info!(model = %descriptor.key, architecture = %descriptor.architecture, "loading model");

            // Run the load on a child task so a panicking loader surfaces as a
            // failed load instead of leaving the handle stuck in Loading.
            let task = {
                let descriptor = descriptor.clone();
                tokio::spawn(async move { loader.load(&descriptor).await })
            };
            let result = match task.await {
                Ok(result) => result,
                Err(err) => Err(anyhow!("loader task failed: {err}")),
            };

            let outcome = {
                let mut inner = handle.lock();
                match result {
                    Ok(backend) => {
                        info!(
                            model = %descriptor.key,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "model loaded"
                        );
                        inner.slot = Slot::Ready {
                            backend: backend.clone(),
                            loaded_at: SystemTime::now(),
                        };
                        Ok(backend)
                    }
                    Err(err) => {
                        error!(model = %descriptor.key, error = ?err, "model failed to load");
                        let err = Arc::new(err);
                        budget.release(&descriptor);
                        inner.slot = Slot::Failed { error: err.clone() };
                        Err(err)
                    }
                }
            };
            tx.send_replace(Some(outcome));
        });
    }

    /// Snapshot of every handle, in catalog order.
    pub fn status(&self) -> Vec<HandleStatus> {
        self.catalog
            .list()
            .iter()
            .filter_map(|descriptor| self.handles.get(&descriptor.key))
            .map(|handle| {
                let inner = handle.lock();
                let (loaded_at, last_error) = match &inner.slot {
                    Slot::Ready { loaded_at, .. } => (
                        loaded_at
                            .duration_since(UNIX_EPOCH)
                            .ok()
                            .map(|d| d.as_secs()),
                        None,
                    ),
                    Slot::Failed { error } => (None, Some(format!("{error:#}"))),
                    Slot::Unloaded | Slot::Loading { .. } => (None, None),
                };
                HandleStatus {
                    key: handle.descriptor.key.clone(),
                    state: inner.slot.state(),
                    loaded_at,
                    load_attempts: inner.load_attempts,
                    last_error,
                }
            })
            .collect()
    }

    pub fn state(&self, key: &str) -> Result<HandleState> {
        let handle = self
            .handles
            .get(key)
            .ok_or_else(|| Error::UnknownModel(key.to_string()))?;
        let state = handle.lock().slot.state();
        Ok(state)
    }

    /// Memory units held by loading and loaded models.
    pub fn committed_units(&self) -> u32 {
        *self.budget.committed()
    }
}
