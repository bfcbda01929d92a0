//! Connection Group
//!
//! A bounded set of [`RespConnection`]s to one descriptor. The group is what
//! the session pool hands out as a [`ConnectionHandle`](super::ConnectionHandle).
//!
//! ## Checkout
//!
//! 1. Take a slot from the semaphore (at most `pool_size` in flight),
//!    waiting up to `pool_wait`.
//! 2. Pop the most recently used idle connection. Connections idle longer
//!    than the idle timeout are discarded.
//! 3. Dial a new connection when nothing usable is idle.
//!
//! Commands that fail with a transport error are retried on a fresh
//! connection up to `max_retries` times. Error replies from the store are
//! not retried; they are returned to the caller as values.

use crate::backend::connection::RespConnection;
use crate::backend::{BackendConnection, BackendError, BackendTimeouts, GroupStats};
use crate::protocol::RespValue;
use crate::session::ConnectionDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct GroupCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale: AtomicU64,
    open: AtomicU32,
}

/// Pooled connections to one backend target.
#[derive(Debug)]
pub struct ConnectionGroup {
    descriptor: ConnectionDescriptor,
    timeouts: BackendTimeouts,
    idle: Mutex<Vec<RespConnection>>,
    slots: Semaphore,
    closed: AtomicBool,
    counters: GroupCounters,
}

impl ConnectionGroup {
    pub fn new(descriptor: ConnectionDescriptor, timeouts: BackendTimeouts) -> Self {
        let permits = descriptor.tuning().pool_size.max(1) as usize;
        Self {
            descriptor,
            timeouts,
            idle: Mutex::new(Vec::with_capacity(permits)),
            slots: Semaphore::new(permits),
            closed: AtomicBool::new(false),
            counters: GroupCounters::default(),
        }
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Opens connections until `min_idle` are idle, capped at `pool_size`.
    pub async fn warm_up(&self) -> Result<(), BackendError> {
        let tuning = self.descriptor.tuning();
        let target = tuning.min_idle.min(tuning.pool_size) as usize;

        loop {
            let idle = self.idle.lock().len();
            if idle >= target {
                break;
            }
            let conn = RespConnection::establish(&self.descriptor, &self.timeouts).await?;
            self.counters.open.fetch_add(1, Ordering::Relaxed);
            self.idle.lock().push(conn);
        }
        Ok(())
    }

    async fn checkout(&self) -> Result<(SemaphorePermit<'_>, RespConnection), BackendError> {
        let permit = match tokio::time::timeout(self.timeouts.pool_wait, self.slots.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BackendError::GroupClosed),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(BackendError::PoolTimeout);
            }
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::GroupClosed);
        }

        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(conn) if conn.idle_for() > self.timeouts.idle => {
                    self.counters.stale.fetch_add(1, Ordering::Relaxed);
                    self.counters.open.fetch_sub(1, Ordering::Relaxed);
                }
                Some(conn) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((permit, conn));
                }
                None => break,
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let conn = RespConnection::establish(&self.descriptor, &self.timeouts).await?;
        self.counters.open.fetch_add(1, Ordering::Relaxed);
        Ok((permit, conn))
    }

    fn checkin(&self, mut conn: RespConnection) {
        if self.closed.load(Ordering::Acquire) {
            self.discard(conn);
            return;
        }
        conn.touch();
        self.idle.lock().push(conn);
    }

    fn discard(&self, conn: RespConnection) {
        self.counters.open.fetch_sub(1, Ordering::Relaxed);
        drop(conn);
    }

    async fn execute_once(&self, command: &RespValue) -> Result<RespValue, BackendError> {
        let (_permit, mut conn) = self.checkout().await?;
        match conn.request(command).await {
            Ok(reply) => {
                self.checkin(conn);
                Ok(reply)
            }
            Err(e) => {
                self.discard(conn);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl BackendConnection for ConnectionGroup {
    fn address(&self) -> String {
        self.descriptor.address()
    }

    async fn ping(&self) -> Result<(), BackendError> {
        match self.execute_once(&RespValue::command(["PING"])).await? {
            RespValue::SimpleString(s) if s.eq_ignore_ascii_case("PONG") => Ok(()),
            other => Err(BackendError::UnexpectedReply {
                command: "PING",
                reply: other.to_string(),
            }),
        }
    }

    async fn execute(&self, command: RespValue) -> Result<RespValue, BackendError> {
        let attempts = self.descriptor.tuning().max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.execute_once(&command).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transport() && attempt < attempts => {
                    debug!(
                        backend = %self.descriptor.address(),
                        attempt = attempt,
                        error = %e,
                        "Retrying command on a fresh connection"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.slots.close();

        let idle = std::mem::take(&mut *self.idle.lock());
        let mut last_err = None;
        for conn in idle {
            self.counters.open.fetch_sub(1, Ordering::Relaxed);
            if let Err(e) = conn.shutdown().await {
                warn!(
                    backend = %self.descriptor.address(),
                    error = %e,
                    "Error closing backend connection"
                );
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stats(&self) -> GroupStats {
        GroupStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            total_conns: self.counters.open.load(Ordering::Relaxed),
            idle_conns: self.idle.lock().len() as u32,
            stale_conns: self.counters.stale.load(Ordering::Relaxed),
        }
    }
}
