//! Lease-based distributed lock.
//!
//! ## Protocol
//!
//! Every attempt reads the lease, then writes only if the lease is expired
//! (`renewTime` absent or in the past) or already held by us. The write is a
//! strategic-merge patch carrying the `resourceVersion` that was read, so of
//! several processes racing on the same version exactly one wins and the
//! others see a conflict. A conflict is a lost round, not an error.
//!
//! `renewTime` is written as *now + lease duration*: it marks the end of the
//! holder's reservation rather than the moment of renewal.
//!
//! ## Lifecycle
//!
//! `start_locking` blocks until the lease is acquired, then spawns a renewal
//! task that re-runs the attempt every refresh interval. `stop_locking` only
//! clears a flag and wakes the task if it is sleeping; a renewal already in
//! flight completes first. The lease is left to expire on its own.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::settings::{ConfigError, LockConfig, RenewalErrorPolicy};
use crate::store::{LeaseStore, StoreError};

/// Error type for lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lease {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Snapshot returned by [`LeaseLock::start_locking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub is_locking: bool,
}

/// Ownership changes published through [`LeaseLock::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// We became the holder (the lease changed hands).
    Acquired,
    /// We were already the holder and extended the lease.
    Renewed,
    /// A renewal found the lease taken or lost the CAS race.
    Lost,
    /// A renewal attempt failed with a store error.
    RenewalFailed { error: String },
    /// The renewal task exited after `stop_locking`.
    Stopped,
}

struct Inner<S> {
    config: LockConfig,
    store: S,
    is_locking: AtomicBool,
    keep_locking: AtomicBool,
    /// Held for the whole read-then-write of one attempt, so clones of a lock
    /// never race each other on the same resourceVersion.
    attempt: Mutex<()>,
    renewal: Mutex<Option<JoinHandle<()>>>,
    /// True while a renewal task occupies `renewal`.
    running: watch::Sender<bool>,
    /// Cuts the renewal task's sleep short after `stop_locking`.
    wake: Notify,
    events: broadcast::Sender<LockEvent>,
}

/// A distributed lock over one named Lease.
///
/// Clones share state. The renewal task holds its own clone, so dropping every
/// handle does not stop renewal; call [`LeaseLock::stop_locking`].
pub struct LeaseLock<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for LeaseLock<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A lease is expired when it has no `renewTime` or that time has passed.
pub fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    spec.renew_time.as_ref().map(|t| t.0 < now).unwrap_or(true)
}

/// Build the claim/renew patch for `identity` given the spec that was read.
///
/// Only a change of holder bumps `leaseTransitions` and sets `acquireTime`.
pub fn build_claim(
    previous: &LeaseSpec,
    resource_version: &str,
    config: &LockConfig,
    now: DateTime<Utc>,
) -> Lease {
    let identity = &config.holder_identity;
    let mut spec = LeaseSpec {
        holder_identity: Some(identity.clone()),
        lease_duration_seconds: Some(config.lease_duration_secs),
        renew_time: Some(MicroTime(
            now + chrono::Duration::seconds(config.lease_duration_secs as i64),
        )),
        ..Default::default()
    };
    if previous.holder_identity.as_ref() != Some(identity) {
        spec.lease_transitions = Some(previous.lease_transitions.unwrap_or(0) + 1);
        spec.acquire_time = Some(MicroTime(now));
    }

    Lease {
        metadata: ObjectMeta {
            resource_version: Some(resource_version.to_string()),
            labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
            ..Default::default()
        },
        spec: Some(spec),
    }
}

impl<S: LeaseStore> LeaseLock<S> {
    pub fn new(config: LockConfig, store: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                is_locking: AtomicBool::new(false),
                keep_locking: AtomicBool::new(false),
                attempt: Mutex::new(()),
                renewal: Mutex::new(None),
                running: watch::Sender::new(false),
                wake: Notify::new(),
                events,
            }),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Outcome of the most recent attempt.
    pub fn is_locking(&self) -> bool {
        self.inner.is_locking.load(Ordering::SeqCst)
    }

    /// Whether the renewal task should keep going.
    pub fn keep_locking(&self) -> bool {
        self.inner.keep_locking.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LockStatus {
        LockStatus {
            is_locking: self.is_locking(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.inner.events.subscribe()
    }

    fn set_locking(&self, locking: bool) {
        self.inner.is_locking.store(locking, Ordering::SeqCst);
    }

    fn emit(&self, event: LockEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn not_found(&self) -> LockError {
        LockError::NotFound {
            namespace: self.inner.config.namespace.clone(),
            name: self.inner.config.lease_name.clone(),
        }
    }

    /// Read the lease, creating a bare one if it is missing and allowed to.
    async fn read_or_create(&self) -> Result<Lease, LockError> {
        let cfg = &self.inner.config;
        if let Some(lease) = self
            .inner
            .store
            .get_lease(&cfg.namespace, &cfg.lease_name)
            .await?
        {
            return Ok(lease);
        }

        if !cfg.create_lease_if_not_exist {
            debug!(lease = %cfg.lease_name, namespace = %cfg.namespace, "lease not found and creation disabled");
            return Err(self.not_found());
        }

        debug!(lease = %cfg.lease_name, namespace = %cfg.namespace, "lease not found, creating");
        let bare = Lease {
            metadata: ObjectMeta {
                name: Some(cfg.lease_name.clone()),
                labels: (!cfg.labels.is_empty()).then(|| cfg.labels.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec::default()),
        };
        match self.inner.store.create_lease(&cfg.namespace, &bare).await {
            Ok(created) => Ok(created),
            Err(StoreError::AlreadyExists(_)) => {
                // Another process created it first; use theirs.
                debug!(lease = %cfg.lease_name, "lease created concurrently, re-reading");
                self.inner
                    .store
                    .get_lease(&cfg.namespace, &cfg.lease_name)
                    .await?
                    .ok_or_else(|| self.not_found())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make one attempt to claim or renew the lease.
    ///
    /// Returns `Ok(false)` when another holder's lease is still valid (no write
    /// is issued) or when our write lost a `resourceVersion` race. Any other
    /// store failure is returned as an error.
    ///
    /// Attempts made through clones of one lock run one at a time.
    pub async fn attempt_acquire(&self) -> Result<bool, LockError> {
        let _turn = self.inner.attempt.lock().await;
        let cfg = &self.inner.config;
        let lease = self.read_or_create().await?;
        let spec = lease.spec.clone().unwrap_or_default();
        let now = Utc::now();

        let is_self = spec.holder_identity.as_ref() == Some(&cfg.holder_identity);
        if self.is_locking() && is_self {
            // Re-confirm ownership each round instead of trusting the flag.
            self.set_locking(false);
        }

        let expired = is_expired(&spec, now);
        if !expired && !is_self {
            debug!(
                lease = %cfg.lease_name,
                holder = ?spec.holder_identity,
                "lease held by another process"
            );
            self.set_locking(false);
            return Ok(false);
        }

        let rv = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LockError::MissingResourceVersion(cfg.lease_name.clone()))?;
        let claim = build_claim(&spec, &rv, cfg, now);

        match self
            .inner
            .store
            .patch_lease(&cfg.namespace, &cfg.lease_name, &claim)
            .await
        {
            Ok(updated) => {
                self.set_locking(true);
                if is_self {
                    debug!(
                        lease = %cfg.lease_name,
                        rv = ?updated.metadata.resource_version,
                        "renewed lease"
                    );
                    self.emit(LockEvent::Renewed);
                } else {
                    info!(
                        lease = %cfg.lease_name,
                        holder = %cfg.holder_identity,
                        previous = ?spec.holder_identity,
                        transitions = ?claim.spec.as_ref().and_then(|s| s.lease_transitions),
                        "acquired lease"
                    );
                    self.emit(LockEvent::Acquired);
                }
                Ok(true)
            }
            Err(StoreError::Conflict(reason)) => {
                debug!(lease = %cfg.lease_name, rv = %rv, reason = %reason, "lost resourceVersion race");
                self.set_locking(false);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Try to take the lock. With `wait_until_lock`, keep retrying under the
    /// configured [`RetryPolicy`] (unbounded unless `max_attempts` or
    /// `max_wait_ms` is set).
    pub async fn get_lock(&self, wait_until_lock: bool) -> Result<bool, LockError> {
        if !wait_until_lock {
            return self.attempt_acquire().await;
        }
        let policy = self.inner.config.retry_policy();
        self.get_lock_with(&policy).await
    }

    /// Retry `attempt_acquire` until it succeeds or `policy` is exhausted,
    /// in which case `Ok(false)` is returned. Errors abort immediately.
    pub async fn get_lock_with(&self, policy: &RetryPolicy) -> Result<bool, LockError> {
        let start = Instant::now();
        let mut failures: u32 = 0;
        loop {
            if self.attempt_acquire().await? {
                return Ok(true);
            }
            failures = failures.saturating_add(1);
            match policy.next_delay(failures, start.elapsed()) {
                Some(delay) => {
                    debug!(lease = %self.inner.config.lease_name, failures, ?delay, "lock busy, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(lease = %self.inner.config.lease_name, failures, "giving up waiting for lock");
                    return Ok(false);
                }
            }
        }
    }

    /// Acquire the lock (waiting as `get_lock(true)` does), then keep it
    /// renewed in the background until [`LeaseLock::stop_locking`].
    ///
    /// Safe to call from several clones: they share one renewal task, and
    /// their attempts are serialized with the task's.
    pub async fn start_locking(&self) -> Result<LockStatus, LockError> {
        if !self.get_lock(true).await? {
            return Ok(self.status());
        }

        let mut renewal = self.inner.renewal.lock().await;
        self.inner.keep_locking.store(true, Ordering::SeqCst);
        // A task that has not retired yet picks the flag back up.
        if renewal.is_none() {
            let runner = self.clone();
            *renewal = Some(tokio::spawn(async move { runner.run_renewal_loop().await }));
            self.inner.running.send_replace(true);
        }
        Ok(self.status())
    }

    /// Stop renewing. An in-flight renewal finishes, no further one starts.
    /// The lease is not released and expires after its duration.
    pub fn stop_locking(&self) {
        debug!(lease = %self.inner.config.lease_name, "stop locking requested");
        self.inner.keep_locking.store(false, Ordering::SeqCst);
        self.inner.wake.notify_waiters();
    }

    /// Wait for the renewal task, if any, to exit.
    pub async fn stopped(&self) {
        let mut running = self.inner.running.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = running.wait_for(|r| !*r).await;
    }

    /// Clear the task slot if renewal should end. Runs under the slot lock so
    /// a concurrent `start_locking` either sees the slot empty or keeps this
    /// task alive by setting the flag first.
    async fn retire(&self, force: bool) -> bool {
        let mut renewal = self.inner.renewal.lock().await;
        if force {
            self.inner.keep_locking.store(false, Ordering::SeqCst);
        } else if self.keep_locking() {
            return false;
        }
        renewal.take();
        self.inner.running.send_replace(false);
        true
    }

    async fn run_renewal_loop(self) {
        let cfg = &self.inner.config;
        let interval = cfg.refresh_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.inner.wake.notified() => {}
            }
            if !self.keep_locking() && self.retire(false).await {
                debug!(lease = %cfg.lease_name, "renewal loop stopped");
                self.emit(LockEvent::Stopped);
                break;
            }

            match self.attempt_acquire().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(lease = %cfg.lease_name, holder = %cfg.holder_identity, "lost lease ownership, stopping renewal");
                    self.retire(true).await;
                    self.emit(LockEvent::Lost);
                    break;
                }
                Err(e) => {
                    warn!(lease = %cfg.lease_name, error = %e, policy = ?cfg.on_renewal_error, "lease renewal failed");
                    self.set_locking(false);
                    let stop = cfg.on_renewal_error == RenewalErrorPolicy::Stop;
                    if stop {
                        self.retire(true).await;
                    }
                    self.emit(LockEvent::RenewalFailed {
                        error: e.to_string(),
                    });
                    if stop {
                        break;
                    }
                }
            }
        }
    }
}
