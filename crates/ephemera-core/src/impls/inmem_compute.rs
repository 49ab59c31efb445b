//! InMemoryProvisioner - 開発・テスト用の ComputeProvisioner
//!
//! instance と volume を HashMap で管理し、呼び出し回数と障害注入を提供します。
//! volume は作成時に instance へ attach され、instance が terminated になると
//! delete-on-termination のものは消え、残りは detach されます。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{InstanceId, RunId};
use crate::ports::{ComputeError, ComputeProvisioner, InstanceSpec, InstanceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeOp {
    CheckAccess,
    Create,
    Terminate,
    Describe,
    ListStorage,
    DeleteStorage,
}

/// Kind of fault to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeFault {
    Throttled,
    Credentials,
    QuotaExceeded,
    Other,
}

impl ComputeFault {
    fn to_error(self, op: ComputeOp) -> ComputeError {
        let msg = format!("injected fault on {op:?}");
        match self {
            ComputeFault::Throttled => ComputeError::Throttled(msg),
            ComputeFault::Credentials => ComputeError::Credentials(msg),
            ComputeFault::QuotaExceeded => ComputeError::QuotaExceeded(msg),
            ComputeFault::Other => ComputeError::Other(msg),
        }
    }
}


struct Volume {
    owner: RunId,
    attached_to: Option<InstanceId>,
    delete_on_termination: bool,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<InstanceId, InstanceState>,
    storage: HashMap<String, Volume>,
    next_id: u64,
    faults: HashMap<ComputeOp, (u32, ComputeFault)>,
    calls: HashMap<ComputeOp, u32>,
}

impl Inner {
    fn enter(&mut self, op: ComputeOp) -> Result<(), ComputeError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some((remaining, fault)) = self.faults.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(fault.to_error(op));
        }
        Ok(())
    }

    /// Release the volumes of an instance that just reached `Terminated`.
    fn on_terminated(&mut self, instance_id: &InstanceId) {
        self.storage.retain(|_, v| {
            !(v.attached_to.as_ref() == Some(instance_id) && v.delete_on_termination)
        });
        for volume in self.storage.values_mut() {
            if volume.attached_to.as_ref() == Some(instance_id) {
                volume.attached_to = None;
            }
        }
    }
}

/// Fake provider. Terminated instances stay visible as `Terminated`, the way
/// cloud APIs keep reporting them for a while.
#[derive(Clone)]
pub struct InMemoryProvisioner {
    inner: Arc<Mutex<Inner>>,
    volumes_per_instance: usize,
    root_volume: bool,
    /// When false, terminate leaves the instance `ShuttingDown` until the next describe.
    instant_termination: bool,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            volumes_per_instance: 0,
            root_volume: false,
            instant_termination: true,
        }
    }

    /// Attach `n` run-tagged data volumes to every created instance. They are
    /// detached, not deleted, when the instance terminates.
    pub fn with_volumes(mut self, n: usize) -> Self {
        self.volumes_per_instance = n;
        self
    }

    /// Also attach a run-tagged root volume that goes away with the instance.
    pub fn with_root_volume(mut self) -> Self {
        self.root_volume = true;
        self
    }

    pub fn with_gradual_termination(mut self) -> Self {
        self.instant_termination = false;
        self
    }

    pub async fn fail_next(&self, op: ComputeOp, times: u32, fault: ComputeFault) {
        self.inner.lock().await.faults.insert(op, (times, fault));
    }

    pub async fn calls(&self, op: ComputeOp) -> u32 {
        self.inner.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn state_of(&self, instance_id: &InstanceId) -> Option<InstanceState> {
        self.inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .copied()
    }

    /// Instances not yet terminated.
    pub async fn running_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .instances
            .values()
            .filter(|state| !state.is_terminated())
            .count()
    }

    pub async fn storage_count(&self) -> usize {
        self.inner.lock().await.storage.len()
    }

    /// Register an instance created outside this fake (e.g. seeded state).
    pub async fn adopt(&self, instance_id: InstanceId) {
        self.inner
            .lock()
            .await
            .instances
            .insert(instance_id, InstanceState::Running);
    }
}

impl Default for InMemoryProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeProvisioner for InMemoryProvisioner {
    async fn check_access(&self, _spec: &InstanceSpec) -> Result<(), ComputeError> {
        self.inner.lock().await.enter(ComputeOp::CheckAccess)
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceId, ComputeError> {
        let mut inner = self.inner.lock().await;
        inner.enter(ComputeOp::Create)?;

        inner.next_id += 1;
        let instance_id = InstanceId::new(format!("i-{:08x}", inner.next_id));
        inner
            .instances
            .insert(instance_id.clone(), InstanceState::Running);
        let next_id = inner.next_id;
        let volumes = (0..self.volumes_per_instance)
            .map(|n| (format!("vol-{next_id:08x}-{n}"), false))
            .chain(self.root_volume.then(|| (format!("vol-{next_id:08x}-root"), true)));
        for (volume, delete_on_termination) in volumes.collect::<Vec<_>>() {
            inner.storage.insert(
                volume,
                Volume {
                    owner: spec.run_id.clone(),
                    attached_to: Some(instance_id.clone()),
                    delete_on_termination,
                },
            );
        }
        Ok(instance_id)
    }

    async fn terminate(&self, instance_id: &InstanceId) -> Result<InstanceState, ComputeError> {
        let mut inner = self.inner.lock().await;
        inner.enter(ComputeOp::Terminate)?;

        let instant = self.instant_termination;
        let state = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ComputeError::NotFound(instance_id.to_string()))?;
        if !state.is_terminated() {
            *state = if instant {
                InstanceState::Terminated
            } else {
                InstanceState::ShuttingDown
            };
        }
        let state = *state;
        if state.is_terminated() {
            inner.on_terminated(instance_id);
        }
        Ok(state)
    }

    async fn describe(&self, instance_id: &InstanceId) -> Result<InstanceState, ComputeError> {
        let mut inner = self.inner.lock().await;
        inner.enter(ComputeOp::Describe)?;

        let state = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ComputeError::NotFound(instance_id.to_string()))?;
        let observed = *state;
        if observed == InstanceState::ShuttingDown {
            *state = InstanceState::Terminated;
            inner.on_terminated(instance_id);
        }
        Ok(observed)
    }

    async fn list_storage(&self, run_id: &RunId) -> Result<Vec<String>, ComputeError> {
        let mut inner = self.inner.lock().await;
        inner.enter(ComputeOp::ListStorage)?;

        let mut volumes: Vec<String> = inner
            .storage
            .iter()
            .filter(|(_, v)| v.owner == *run_id)
            .filter(|(_, v)| !(v.attached_to.is_some() && v.delete_on_termination))
            .map(|(id, _)| id.clone())
            .collect();
        volumes.sort();
        Ok(volumes)
    }

    async fn delete_storage(&self, storage_id: &str) -> Result<(), ComputeError> {
        let mut inner = self.inner.lock().await;
        inner.enter(ComputeOp::DeleteStorage)?;

        let volume = inner
            .storage
            .get(storage_id)
            .ok_or_else(|| ComputeError::NotFound(storage_id.to_string()))?;
        if let Some(instance_id) = &volume.attached_to {
            return Err(ComputeError::InUse(format!(
                "{storage_id} is attached to {instance_id}"
            )));
        }
        inner.storage.remove(storage_id);
        Ok(())
    }
}
