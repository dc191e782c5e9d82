//! Distributed mutual exclusion over a shared, versioned lease record.
//!
//! Any number of processes can point a [`LeaseLock`] at the same Kubernetes
//! Lease; the API server's `resourceVersion` check makes sure at most one of
//! them wins each acquisition round.

pub mod lock;
pub mod retry;
pub mod settings;
pub mod store;
pub mod trace;

pub use lease_lock_macros::test;
pub use lock::{LeaseLock, LockError, LockEvent, LockStatus};
pub use retry::RetryPolicy;
pub use settings::{ConfigError, LockConfig, RenewalErrorPolicy};
#[cfg(feature = "k8s")]
pub use store::KubeLeaseStore;
pub use store::{InMemoryLeaseStore, LeaseStore, StoreError};
