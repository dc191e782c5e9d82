//! Kubernetes Lease store using kube-rs.
//!
//! Conditional updates are strategic-merge patches whose body carries
//! `metadata.resourceVersion`; the API server rejects a stale version with
//! 409, which surfaces as [`StoreError::Conflict`].

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, Patch, PatchParams, PostParams};

use super::{LeaseStore, StoreError};

/// Lease store backed by a live Kubernetes API server.
#[derive(Clone)]
pub struct KubeLeaseStore {
    client: kube::Client,
}

impl KubeLeaseStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Create a store using the default in-cluster or kubeconfig configuration.
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn leases(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, StoreError> {
        match self.leases(namespace).get(name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, StoreError> {
        match self
            .leases(namespace)
            .create(&PostParams::default(), lease)
            .await
        {
            Ok(l) => Ok(l),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(StoreError::AlreadyExists(e.message)),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn patch_lease(
        &self,
        namespace: &str,
        name: &str,
        patch: &Lease,
    ) -> Result<Lease, StoreError> {
        match self
            .leases(namespace)
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
        {
            Ok(l) => Ok(l),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(StoreError::Conflict(e.message)),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }
}
