//! Lease storage backends.
//!
//! A lock only needs three operations from the coordination backend: read a
//! named lease, create one, and patch one under a `resourceVersion`
//! precondition. Available backends:
//!
//! - `k8s`: Kubernetes `coordination.k8s.io/v1` Lease objects via kube-rs
//! - `memory`: a process-local store with the same CAS and merge rules

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;

#[cfg(feature = "k8s")]
pub mod k8s;
pub mod memory;

#[cfg(feature = "k8s")]
pub use k8s::KubeLeaseStore;
pub use memory::InMemoryLeaseStore;

/// Error type for lease store operations
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// The `resourceVersion` carried by a patch is no longer current.
    #[error("resourceVersion conflict: {0}")]
    Conflict(String),
    #[error("lease already exists: {0}")]
    AlreadyExists(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Read/create/conditionally-update access to named Lease records.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Get a lease by namespace and name.
    /// Returns None if the lease doesn't exist.
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, StoreError>;

    /// Create a new lease.
    /// Returns `AlreadyExists` if a lease with that name is present.
    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, StoreError>;

    /// Merge `patch` into the stored lease (strategic merge: fields left unset
    /// on the patch are untouched, labels merge by key).
    ///
    /// When `patch.metadata.resource_version` is set it must equal the stored
    /// version, otherwise `Conflict` is returned and nothing is written.
    async fn patch_lease(
        &self,
        namespace: &str,
        name: &str,
        patch: &Lease,
    ) -> Result<Lease, StoreError>;
}

#[async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for std::sync::Arc<S> {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, StoreError> {
        (**self).get_lease(namespace, name).await
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, StoreError> {
        (**self).create_lease(namespace, lease).await
    }

    async fn patch_lease(
        &self,
        namespace: &str,
        name: &str,
        patch: &Lease,
    ) -> Result<Lease, StoreError> {
        (**self).patch_lease(namespace, name, patch).await
    }
}
