//! In-memory lease store.
//!
//! Simulates the parts of the Kubernetes API server a lock relies on:
//! - monotonically increasing `resourceVersion`s
//! - CAS on patch via the supplied `resourceVersion`
//! - strategic-merge patches (unset fields untouched, labels merged by key)
//!
//! Clones share state, so several locks in one process can contend on it.
//! Call counters and failure injection make it usable as a test backend.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::trace;

use super::{LeaseStore, StoreError};

#[derive(Debug, Default)]
struct State {
    /// namespace -> name -> lease
    leases: Mutex<HashMap<String, HashMap<String, Lease>>>,
    resource_version: AtomicU64,
    failure: Mutex<Option<StoreError>>,
    gets: AtomicUsize,
    creates: AtomicUsize,
    patches: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseStore {
    state: Arc<State>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_version(&self) -> String {
        (self.state.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    async fn check_failure(&self) -> Result<(), StoreError> {
        match &*self.state.failure.lock().await {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Make every subsequent operation fail with `err` until cleared with `None`.
    pub async fn set_failure(&self, err: Option<StoreError>) {
        *self.state.failure.lock().await = err;
    }

    /// Insert or overwrite a lease unconditionally, assigning a fresh version.
    pub async fn put_lease(&self, namespace: &str, mut lease: Lease) -> Lease {
        let name = lease.metadata.name.clone().unwrap_or_default();
        lease.metadata.namespace = Some(namespace.to_string());
        lease.metadata.resource_version = Some(self.next_resource_version());
        let mut leases = self.state.leases.lock().await;
        leases
            .entry(namespace.to_string())
            .or_default()
            .insert(name, lease.clone());
        lease
    }

    /// Current stored copy, bypassing counters and failure injection.
    pub async fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        let leases = self.state.leases.lock().await;
        leases.get(namespace).and_then(|ns| ns.get(name)).cloned()
    }

    pub fn get_calls(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.state.creates.load(Ordering::SeqCst)
    }

    pub fn patch_calls(&self) -> usize {
        self.state.patches.load(Ordering::SeqCst)
    }
}

/// Apply `patch` onto `target` with strategic-merge semantics for the fields
/// a Lease carries.
pub fn merge_lease(target: &mut Lease, patch: &Lease) {
    if let Some(labels) = &patch.metadata.labels {
        target
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels.clone());
    }
    if let Some(annotations) = &patch.metadata.annotations {
        target
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend(annotations.clone());
    }

    let Some(src) = &patch.spec else {
        return;
    };
    let dst = target.spec.get_or_insert_with(LeaseSpec::default);
    if src.holder_identity.is_some() {
        dst.holder_identity = src.holder_identity.clone();
    }
    if src.lease_duration_seconds.is_some() {
        dst.lease_duration_seconds = src.lease_duration_seconds;
    }
    if src.acquire_time.is_some() {
        dst.acquire_time = src.acquire_time.clone();
    }
    if src.renew_time.is_some() {
        dst.renew_time = src.renew_time.clone();
    }
    if src.lease_transitions.is_some() {
        dst.lease_transitions = src.lease_transitions;
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, StoreError> {
        self.state.gets.fetch_add(1, Ordering::SeqCst);
        self.check_failure().await?;
        Ok(self.lease(namespace, name).await)
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, StoreError> {
        self.state.creates.fetch_add(1, Ordering::SeqCst);
        self.check_failure().await?;

        let name = lease
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::Backend("name is required".into()))?;

        let mut leases = self.state.leases.lock().await;
        let ns_leases = leases.entry(namespace.to_string()).or_default();
        if ns_leases.contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("{namespace}/{name}")));
        }

        let mut created = lease.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(self.next_resource_version());
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        ns_leases.insert(name.clone(), created.clone());

        trace!(namespace, name = %name, "memory: created lease");
        Ok(created)
    }

    async fn patch_lease(
        &self,
        namespace: &str,
        name: &str,
        patch: &Lease,
    ) -> Result<Lease, StoreError> {
        self.state.patches.fetch_add(1, Ordering::SeqCst);
        self.check_failure().await?;

        let mut leases = self.state.leases.lock().await;
        let existing = leases
            .get_mut(namespace)
            .and_then(|ns| ns.get_mut(name))
            .ok_or_else(|| StoreError::Backend(format!("lease {namespace}/{name} not found")))?;

        if let Some(provided_rv) = &patch.metadata.resource_version {
            if existing.metadata.resource_version.as_ref() != Some(provided_rv) {
                return Err(StoreError::Conflict(format!(
                    "provided {} != current {}",
                    provided_rv,
                    existing.metadata.resource_version.as_deref().unwrap_or("")
                )));
            }
        }

        merge_lease(existing, patch);
        existing.metadata.resource_version = Some(self.next_resource_version());

        trace!(namespace, name, rv = ?existing.metadata.resource_version, "memory: patched lease");
        Ok(existing.clone())
    }
}
