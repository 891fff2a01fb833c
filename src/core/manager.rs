//! Owner of the published object graph.
//!
//! All dispatch cycles and all reads go through one lock. Every completed
//! dispatch bumps a generation counter; [`ObjectManager::wait_for`] sleeps on
//! that counter and re-evaluates its predicate after each cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use super::configuration::ConfigTables;
use super::device::{HardwareEvent, Uevent};
use super::dispatcher::{DispatchInputs, Dispatcher, FollowUp};
use super::graph::ObjectGraph;
use super::mounts::MountSource;
use crate::config::DriveSettings;

struct Inner {
    graph: Mutex<ObjectGraph>,
    generation: watch::Sender<u64>,
    dispatcher: Dispatcher,
    tables: ConfigTables,
    mounts: Arc<dyn MountSource>,
    drive_settings: HashMap<String, DriveSettings>,
}

#[derive(Clone)]
pub struct ObjectManager {
    inner: Arc<Inner>,
}

impl ObjectManager {
    pub fn new(
        graph: ObjectGraph,
        dispatcher: Dispatcher,
        tables: ConfigTables,
        mounts: Arc<dyn MountSource>,
        drive_settings: HashMap<String, DriveSettings>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                graph: Mutex::new(graph),
                generation,
                dispatcher,
                tables,
                mounts,
                drive_settings,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ObjectGraph> {
        self.inner
            .graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn inputs(&self) -> DispatchInputs<'_> {
        DispatchInputs {
            mounts: self.inner.mounts.snapshot(),
            config: self.inner.tables.snapshot(),
            drive_settings: &self.inner.drive_settings,
        }
    }

    fn publish(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }

    pub fn handle_event(&self, event: &HardwareEvent) -> Vec<FollowUp> {
        match event {
            HardwareEvent::Uevent(uevent) => self.handle_uevent(uevent),
            HardwareEvent::MountsChanged => self.refresh_all(),
        }
    }

    /// Run one dispatch cycle and wake every waiter.
    pub fn handle_uevent(&self, event: &Uevent) -> Vec<FollowUp> {
        let inputs = self.inputs();
        let followups = {
            let mut graph = self.lock();
            self.inner.dispatcher.dispatch(&mut graph, &inputs, event)
        };
        self.publish();
        followups
    }

    /// Reconcile every object against freshly sampled mount and configuration state.
    pub fn refresh_all(&self) -> Vec<FollowUp> {
        let inputs = self.inputs();
        let followups = {
            let mut graph = self.lock();
            self.inner.dispatcher.refresh_all(&mut graph, &inputs)
        };
        self.publish();
        followups
    }

    /// Re-validate persisted unlock entries against the devices now present.
    pub fn prune_unlocked(&self) -> usize {
        self.lock().prune_stale_unlocks()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ObjectGraph) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate state that is not derived from events (the unlock registry).
    pub fn write<R>(&self, f: impl FnOnce(&mut ObjectGraph) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    pub fn tables(&self) -> &ConfigTables {
        &self.inner.tables
    }

    pub fn mounts(&self) -> &dyn MountSource {
        self.inner.mounts.as_ref()
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.inner.dispatcher.modules().names().to_vec()
    }

    /// Block until `predicate` yields a value or `timeout` elapses.
    ///
    /// The predicate runs under the graph lock, once immediately and then
    /// after every completed dispatch cycle. It never runs concurrently with
    /// dispatch. Returns `None` on timeout.
    pub async fn wait_for<T>(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&ObjectGraph) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.inner.generation.subscribe();
        loop {
            let seen = *rx.borrow_and_update();
            if let Some(value) = self.read(&mut predicate) {
                return Some(value);
            }
            trace!(generation = seen, "Condition not met, waiting for next dispatch");
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }
}
