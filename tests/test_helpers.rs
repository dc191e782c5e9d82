#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use lease_lock::{InMemoryLeaseStore, LeaseStore, LockConfig, StoreError};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub const NAMESPACE: &str = "namespace";
pub const LEASE: &str = "test-lease";

pub fn test_config(identity: &str) -> LockConfig {
    LockConfig::new(LEASE, NAMESPACE).with_holder_identity(identity)
}

/// A lease as the API server would return it. `renew_offset_secs` is relative
/// to now; `None` leaves `renewTime` unset.
pub fn lease(rv: &str, holder: Option<&str>, renew_offset_secs: Option<i64>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(LEASE.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: holder.map(str::to_string),
            renew_time: renew_offset_secs
                .map(|s| MicroTime(Utc::now() + chrono::Duration::seconds(s))),
            ..Default::default()
        }),
    }
}

/// Every call a [`ScriptedStore`] received, in order.
#[derive(Debug, Clone)]
pub enum Call {
    Get,
    Create(Lease),
    Patch(Lease),
}

type ReadScript = Box<dyn FnMut(usize) -> Result<Option<Lease>, StoreError> + Send>;

/// Lease store double whose reads come from a script and whose writes are
/// recorded. Patches succeed unless `patch_error` is set.
pub struct ScriptedStore {
    reads: Mutex<ReadScript>,
    read_count: Mutex<usize>,
    calls: Mutex<Vec<Call>>,
    pub create_error: Mutex<Option<StoreError>>,
    pub patch_error: Mutex<Option<StoreError>>,
    next_rv: AtomicU64,
}

impl ScriptedStore {
    /// `script` is called with the 0-based index of each read.
    pub fn new(
        script: impl FnMut(usize) -> Result<Option<Lease>, StoreError> + Send + 'static,
    ) -> Self {
        Self {
            reads: Mutex::new(Box::new(script)),
            read_count: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
            create_error: Mutex::new(None),
            patch_error: Mutex::new(None),
            next_rv: AtomicU64::new(5000),
        }
    }

    /// Every read returns a clone of `lease`.
    pub fn returning(lease: Option<Lease>) -> Self {
        Self::new(move |_| Ok(lease.clone()))
    }

    pub fn set_patch_error(&self, err: StoreError) {
        *self.patch_error.lock().unwrap() = Some(err);
    }

    pub fn set_create_error(&self, err: StoreError) {
        *self.create_error.lock().unwrap() = Some(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn gets(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Get))
            .count()
    }

    pub fn creates(&self) -> Vec<Lease> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn patches(&self) -> Vec<Lease> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Patch(l) => Some(l),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LeaseStore for ScriptedStore {
    async fn get_lease(&self, _namespace: &str, _name: &str) -> Result<Option<Lease>, StoreError> {
        self.calls.lock().unwrap().push(Call::Get);
        let idx = {
            let mut count = self.read_count.lock().unwrap();
            let idx = *count;
            *count += 1;
            idx
        };
        let mut script = self.reads.lock().unwrap();
        (script.as_mut())(idx)
    }

    async fn create_lease(&self, _namespace: &str, lease: &Lease) -> Result<Lease, StoreError> {
        self.calls.lock().unwrap().push(Call::Create(lease.clone()));
        if let Some(err) = self.create_error.lock().unwrap().clone() {
            return Err(err);
        }
        let mut created = lease.clone();
        created.metadata.resource_version = Some("1231".to_string());
        Ok(created)
    }

    async fn patch_lease(
        &self,
        _namespace: &str,
        _name: &str,
        patch: &Lease,
    ) -> Result<Lease, StoreError> {
        self.calls.lock().unwrap().push(Call::Patch(patch.clone()));
        if let Some(err) = self.patch_error.lock().unwrap().clone() {
            return Err(err);
        }
        let mut updated = patch.clone();
        updated.metadata.resource_version =
            Some(self.next_rv.fetch_add(1, Ordering::SeqCst).to_string());
        Ok(updated)
    }
}

/// In-memory store whose patches can be held at a gate, to observe what
/// happens while a write is in flight.
#[derive(Default)]
pub struct GatedStore {
    pub inner: InMemoryLeaseStore,
    armed: AtomicBool,
    parked: Notify,
    gate: Notify,
}

impl GatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every following patch until `release`.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a patch is parked at the gate.
    pub async fn wait_parked(&self) {
        self.parked.notified().await;
    }

    /// Let the parked patch through and stop gating.
    pub fn release(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }
}

#[async_trait]
impl LeaseStore for GatedStore {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, StoreError> {
        self.inner.get_lease(namespace, name).await
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, StoreError> {
        self.inner.create_lease(namespace, lease).await
    }

    async fn patch_lease(
        &self,
        namespace: &str,
        name: &str,
        patch: &Lease,
    ) -> Result<Lease, StoreError> {
        if self.armed.load(Ordering::SeqCst) {
            self.parked.notify_one();
            self.gate.notified().await;
        }
        self.inner.patch_lease(namespace, name, patch).await
    }
}

/// Poll `f` until it returns true or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
