//! Connection Pool
//!
//! Maps a descriptor's identity to one shared [`ConnectionHandle`]. The
//! pool's job is deduplication and lifecycle; it never retries a failed
//! dial or probe.
//!
//! ## Creation
//!
//! ```text
//! get(descriptor)
//!    │
//!    ├─ read lock: entry present? ──────────────── yes ──> clone handle
//!    │
//!    └─ write lock
//!         ├─ re-check: entry present? ──────────── yes ──> clone handle
//!         ├─ validate descriptor
//!         ├─ factory.connect()   (dial timeout)
//!         ├─ handle.ping()       (probe timeout)
//!         └─ install entry ──────────────────────────────> clone handle
//! ```
//!
//! The re-check under the write lock collapses concurrent creators for the
//! same identity into a single dial. Both network steps are bounded so the
//! write lock is never held indefinitely. The entry is installed only after
//! the probe succeeds: dropping a `get` future mid-way installs nothing.

use crate::backend::{ConnectionFactory, ConnectionHandle, GroupStats};
use crate::session::descriptor::{ConnectionDescriptor, Digest};
use crate::session::error::SessionError;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Deadlines for establishing a new pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTimeouts {
    /// Creating the connection group, including warm-up
    pub dial: Duration,
    /// Liveness probe on a freshly created group
    pub probe: Duration,
}

impl Default for PoolTimeouts {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(5),
            probe: Duration::from_secs(3),
        }
    }
}

/// Snapshot of every pool entry, keyed by identity hex digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_pools: usize,
    pub pools: BTreeMap<String, GroupStats>,
}

struct PoolEntry {
    descriptor: ConnectionDescriptor,
    handle: ConnectionHandle,
}

/// Identity-keyed registry of connection groups.
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    entries: RwLock<HashMap<Digest, PoolEntry>>,
    timeouts: PoolTimeouts,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, timeouts: PoolTimeouts) -> Self {
        Self {
            factory,
            entries: RwLock::new(HashMap::new()),
            timeouts,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the shared handle for `descriptor`, creating it on first use.
    pub async fn get(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle, SessionError> {
        self.ensure_open()?;
        let identity = descriptor.identity();

        if let Some(entry) = self.entries.read().await.get(&identity) {
            debug!(identity = %identity.short(), "Pool hit");
            return Ok(Arc::clone(&entry.handle));
        }

        let mut entries = self.entries.write().await;
        // close_all may have drained the map while we waited.
        self.ensure_open()?;
        if let Some(entry) = entries.get(&identity) {
            debug!(identity = %identity.short(), "Pool hit after re-check");
            return Ok(Arc::clone(&entry.handle));
        }

        descriptor.validate()?;
        let handle = self.establish(descriptor).await?;
        entries.insert(
            identity,
            PoolEntry {
                descriptor: descriptor.clone(),
                handle: Arc::clone(&handle),
            },
        );

        info!(
            identity = %identity.short(),
            backend = %descriptor.address(),
            namespace = descriptor.namespace(),
            pools = entries.len(),
            "Connection group created"
        );
        Ok(handle)
    }

    async fn establish(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle, SessionError> {
        let addr = descriptor.address();

        let handle = match timeout(self.timeouts.dial, self.factory.connect(descriptor)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!(backend = %addr, error = %e, "Dial failed");
                return Err(SessionError::unreachable(addr, e));
            }
            Err(_) => {
                warn!(backend = %addr, "Dial timed out");
                return Err(SessionError::unreachable(
                    addr,
                    format!("dial timed out after {:?}", self.timeouts.dial),
                ));
            }
        };

        let reason = match timeout(self.timeouts.probe, handle.ping()).await {
            Ok(Ok(())) => return Ok(handle),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("probe timed out after {:?}", self.timeouts.probe),
        };

        warn!(backend = %addr, reason = %reason, "Liveness probe failed");
        if let Err(e) = handle.close().await {
            debug!(backend = %addr, error = %e, "Error discarding unprobed group");
        }
        Err(SessionError::unreachable(addr, reason))
    }

    /// Evicts and closes the entry for `descriptor`. Absent entries are a no-op.
    pub async fn remove(&self, descriptor: &ConnectionDescriptor) -> Result<(), SessionError> {
        let identity = descriptor.identity();
        let entry = self.entries.write().await.remove(&identity);

        let Some(entry) = entry else {
            return Ok(());
        };
        info!(
            identity = %identity.short(),
            backend = %entry.descriptor.address(),
            "Connection group removed"
        );
        close_entry(&entry).await
    }

    /// Drains every entry and closes it. The map is empty afterwards even if
    /// some handles fail to close; the last such error is returned as
    /// [`SessionError::CloseFailed`], which is not retryable.
    pub async fn close_all(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<PoolEntry> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        info!(pools = drained.len(), "Closing all connection groups");
        let mut last_err = None;
        for entry in &drained {
            if let Err(e) = close_entry(entry).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.read().await;
        PoolStats {
            total_pools: entries.len(),
            pools: entries
                .iter()
                .map(|(identity, entry)| (identity.to_hex(), entry.handle.stats()))
                .collect(),
        }
    }

    /// Pings every entry concurrently, keyed by identity hex digest.
    ///
    /// Handles are copied out under the read lock; the pings run without it.
    pub async fn health_check(&self) -> BTreeMap<String, Result<(), SessionError>> {
        let snapshot: Vec<(Digest, String, ConnectionHandle)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .map(|(identity, entry)| {
                    (*identity, entry.descriptor.address(), Arc::clone(&entry.handle))
                })
                .collect()
        };

        let probe = self.timeouts.probe;
        let checks = snapshot.into_iter().map(|(identity, addr, handle)| async move {
            let result = match timeout(probe, handle.ping()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SessionError::unreachable(addr, e)),
                Err(_) => Err(SessionError::unreachable(
                    addr,
                    format!("probe timed out after {probe:?}"),
                )),
            };
            (identity.to_hex(), result)
        });

        futures::future::join_all(checks).await.into_iter().collect()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::PoolClosed);
        }
        Ok(())
    }
}

async fn close_entry(entry: &PoolEntry) -> Result<(), SessionError> {
    entry.handle.close().await.map_err(|e| {
        let addr = entry.descriptor.address();
        warn!(backend = %addr, error = %e, "Error closing connection group");
        SessionError::CloseFailed {
            addr,
            reason: e.to_string(),
        }
    })
}
