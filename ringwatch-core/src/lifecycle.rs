use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::MembershipError;

/// Well-known lifecycle stages, started in ascending order.
pub mod stages {
    /// Runs before anything else.
    pub const FIRST: i32 = i32::MIN;
    /// Runtime bootstrap.
    pub const RUNTIME_INITIALIZE: i32 = 2_000;
    /// Core runtime services; membership joins here.
    pub const RUNTIME_SERVICES: i32 = 4_000;
    /// Storage providers.
    pub const RUNTIME_STORAGE_SERVICES: i32 = 6_000;
    /// Application services.
    pub const APPLICATION_SERVICES: i32 = 10_000;
    /// The silo announces itself Active.
    pub const BECOME_ACTIVE: i32 = ACTIVE - 1;
    /// The silo is serving.
    pub const ACTIVE: i32 = 20_000;
    /// Runs after everything else.
    pub const LAST: i32 = i32::MAX;
}

type Callback =
    Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, Result<(), MembershipError>> + Send + Sync>;

struct Registration {
    stage: i32,
    name: String,
    callback: Callback,
}

/// Ordered `(stage, callback)` registry with a host-side driver.
///
/// Start callbacks run in ascending stage order and stop callbacks in
/// descending order. Callbacks registered for the same stage run concurrently.
/// Every callback receives the shared cancellation signal, which flips to
/// `true` when [`stop`](Self::stop) begins.
pub struct LifecycleRegistry {
    starts: Mutex<Vec<Registration>>,
    stops: Mutex<Vec<Registration>>,
    cancel: watch::Sender<bool>,
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            cancel,
        }
    }

    /// Registers a startup callback for `stage`.
    pub fn on_start<F, Fut>(&self, stage: i32, name: impl Into<String>, callback: F)
    where
        F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MembershipError>> + Send + 'static,
    {
        self.starts.lock().push(Registration {
            stage,
            name: name.into(),
            callback: boxed(callback),
        });
    }

    /// Registers a shutdown callback for `stage`.
    pub fn on_stop<F, Fut>(&self, stage: i32, name: impl Into<String>, callback: F)
    where
        F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MembershipError>> + Send + 'static,
    {
        self.stops.lock().push(Registration {
            stage,
            name: name.into(),
            callback: boxed(callback),
        });
    }

    /// Cancellation signal handed to callbacks.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Runs every start callback stage by stage.
    ///
    /// # Errors
    ///
    /// Stops at the first failing stage and returns
    /// [`MembershipError::Lifecycle`] naming it.
    pub async fn start(&self) -> Result<(), MembershipError> {
        let plan = group(&self.starts.lock());
        for (stage, callbacks) in plan {
            info!(stage, callbacks = callbacks.len(), "starting lifecycle stage");
            let results = join_all(callbacks.iter().map(|(name, callback)| {
                let cancel = self.cancel.subscribe();
                let future = callback(cancel);
                async move { (name.clone(), future.await) }
            }))
            .await;

            if let Some((name, Err(err))) = results.into_iter().find(|(_, result)| result.is_err()) {
                error!(stage, callback = %name, "lifecycle stage failed: {err}");
                return Err(MembershipError::Lifecycle {
                    stage,
                    reason: format!("{name}: {err}"),
                });
            }
        }
        Ok(())
    }

    /// Signals cancellation and runs every stop callback in descending stage
    /// order. Failures are logged and do not prevent later stages.
    pub async fn stop(&self) {
        self.cancel.send_replace(true);
        let plan = group(&self.stops.lock());
        for (stage, callbacks) in plan.into_iter().rev() {
            info!(stage, callbacks = callbacks.len(), "stopping lifecycle stage");
            let results = join_all(callbacks.iter().map(|(name, callback)| {
                let future = callback(self.cancel.subscribe());
                async move { (name.clone(), future.await) }
            }))
            .await;
            for (name, result) in results {
                if let Err(err) = result {
                    warn!(stage, callback = %name, "lifecycle stop callback failed: {err}");
                }
            }
        }
    }
}

/// Resolves once `cancel` flips to `true` or its sender goes away.
pub async fn cancelled(mut cancel: watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Registers a one-shot startup task, by default at [`stages::ACTIVE`].
pub fn add_startup_task<F, Fut>(registry: &LifecycleRegistry, stage: Option<i32>, task: F)
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MembershipError>> + Send + 'static,
{
    registry.on_start(stage.unwrap_or(stages::ACTIVE), "startup-task", task);
}

fn boxed<F, Fut>(callback: F) -> Callback
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MembershipError>> + Send + 'static,
{
    Arc::new(move |cancel| Box::pin(callback(cancel)))
}

fn group(registrations: &[Registration]) -> BTreeMap<i32, Vec<(String, Callback)>> {
    let mut plan: BTreeMap<i32, Vec<(String, Callback)>> = BTreeMap::new();
    for registration in registrations {
        plan.entry(registration.stage)
            .or_default()
            .push((registration.name.clone(), Arc::clone(&registration.callback)));
    }
    plan
}
