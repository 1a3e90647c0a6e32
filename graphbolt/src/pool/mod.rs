//! Per-address connection pooling with reservations and waiters.
//!
//! These codes follow the checkout/checkin structure of `hyper`-style client
//! pools, adapted to a cluster driver: connections are owned by whoever
//! checked them out, admission is capped per address, and overlapping opens
//! are accounted for through reservations.

pub mod routing;

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::PoolConfig;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::net::{Address, ResolvedAddress};
use crate::protocol::{Connection, MakeConnection};

/// A collection of connections to one or more server addresses.
///
/// Cheaply cloneable; all clones share the same state.
pub struct Pool<M: MakeConnection> {
    inner: Arc<Inner<M>>,
}

impl<M: MakeConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<M: MakeConnection> {
    opener: M,
    config: PoolConfig,
    entries: Mutex<AHashMap<ResolvedAddress, Entry<M::Connection>>>,
    /// Woken as a group on every release; fairness is not guaranteed.
    released: Notify,
}

struct Entry<C> {
    idle: VecDeque<C>,
    in_use: usize,
    /// Slots taken for connections whose opener is still in flight; keeps the
    /// admission cap honest across overlapping opens.
    reservations: usize,
}

impl<C> Default for Entry<C> {
    fn default() -> Self {
        Entry {
            idle: VecDeque::new(),
            in_use: 0,
            reservations: 0,
        }
    }
}

impl<C> Entry<C> {
    fn size(&self) -> usize {
        self.idle.len() + self.in_use + self.reservations
    }

    fn is_vacant(&self) -> bool {
        self.idle.is_empty() && self.in_use == 0 && self.reservations == 0
    }
}

impl<M: MakeConnection> Pool<M> {
    pub fn new(opener: M, config: PoolConfig) -> Self {
        Pool {
            inner: Arc::new(Inner {
                opener,
                config,
                entries: Mutex::new(AHashMap::new()),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a connection to `address`, reusing a pooled one when a healthy
    /// one exists, opening a new one while the cap allows, and otherwise
    /// waiting for a release until `deadline`.
    pub async fn acquire(
        &self,
        address: &ResolvedAddress,
        deadline: Deadline,
        liveness_check_timeout: Option<Duration>,
    ) -> Result<PooledConnection<M>> {
        loop {
            // Scan the pool for a reusable connection, evicting unhealthy
            // ones as they turn up.
            while !deadline.expired() {
                let Some(mut conn) = self.checkout_idle(address) else {
                    break;
                };
                if self
                    .health_check(&mut conn, deadline, liveness_check_timeout)
                    .await
                {
                    tracing::debug!("[BOLT] reuse connection from pool for {}", address);
                    return Ok(self.wrap(address, conn));
                }
                tracing::debug!(
                    "[BOLT] removing old connection to {} (port={}, closed={}, defunct={}, stale={})",
                    address,
                    conn.local_port(),
                    conn.closed(),
                    conn.defunct(),
                    conn.stale()
                );
                conn.close().await;
                self.discard_checked_out(address);
            }

            if self.try_reserve(address) {
                return self.open_new(address, deadline).await;
            }

            // Pool is full and holds no free connection. Register as a waiter
            // before re-checking, so a release between the check and the wait
            // cannot be missed.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_idle(address) {
                continue;
            }
            if self.try_reserve(address) {
                return self.open_new(address, deadline).await;
            }

            match deadline.to_timeout() {
                Some(timeout) if timeout.is_zero() => {
                    return Err(Error::AcquisitionTimeout(deadline.original_secs()));
                }
                Some(timeout) => {
                    if tokio::time::timeout(timeout, notified).await.is_err() {
                        return Err(Error::AcquisitionTimeout(deadline.original_secs()));
                    }
                }
                None => notified.await,
            }
            // Woken up (or spuriously): restart the scan.
        }
    }

    /// Release a connection back into the pool, resetting it first unless it
    /// is already broken or clean.
    ///
    /// Reset failures are swallowed: the connection lands back in the pool
    /// and the next health check evicts it.
    pub async fn release(&self, mut pooled: PooledConnection<M>) {
        let Some(mut conn) = pooled.conn.take() else {
            return;
        };
        let address = pooled.address.clone();
        drop(pooled);

        if !(conn.closed() || conn.defunct() || conn.is_reset()) {
            if let Err(e) = conn.reset().await {
                tracing::debug!("[BOLT] failed to reset connection on release: {}", e);
            }
        }
        let broken = conn.closed() || conn.defunct();
        if broken {
            conn.close().await;
        }
        {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(&address) {
                entry.in_use = entry.in_use.saturating_sub(1);
                if !broken {
                    entry.idle.push_back(conn);
                }
                if entry.is_vacant() {
                    entries.remove(&address);
                }
            }
        }
        self.inner.released.notify_waiters();
    }

    /// Number of connections to `address` currently checked out.
    pub fn in_use_count(&self, address: &ResolvedAddress) -> usize {
        self.inner
            .entries
            .lock()
            .get(address)
            .map(|e| e.in_use)
            .unwrap_or(0)
    }

    /// Checked-out connections across every endpoint of an unresolved
    /// address; used by the routing pool's load balancing.
    pub fn in_use_count_host(&self, address: &Address) -> usize {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| &key.unresolved() == address)
            .map(|(_, e)| e.in_use)
            .sum()
    }

    pub fn idle_count(&self, address: &ResolvedAddress) -> usize {
        self.inner
            .entries
            .lock()
            .get(address)
            .map(|e| e.idle.len())
            .unwrap_or(0)
    }

    /// Every address the pool currently holds an entry for.
    pub fn addresses(&self) -> Vec<ResolvedAddress> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    /// Flag every pooled connection as stale; subsequent acquires will
    /// discard them at the health check.
    pub fn mark_all_stale(&self) {
        let mut entries = self.inner.entries.lock();
        for entry in entries.values_mut() {
            for conn in entry.idle.iter_mut() {
                conn.set_stale();
            }
        }
    }

    /// Close and remove every idle connection to `address`. Connections
    /// currently checked out are left to their holders.
    pub async fn deactivate(&self, address: &ResolvedAddress) {
        let idle = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(address) {
                Some(entry) => {
                    let idle: Vec<_> = entry.idle.drain(..).collect();
                    if entry.is_vacant() {
                        entries.remove(address);
                    }
                    idle
                }
                None => return,
            }
        };
        for mut conn in idle {
            conn.close().await;
        }
    }

    /// [`Pool::deactivate`] for every endpoint resolved from `address`.
    pub async fn deactivate_host(&self, address: &Address) {
        let idle = {
            let mut entries = self.inner.entries.lock();
            let keys: Vec<_> = entries
                .keys()
                .filter(|key| &key.unresolved() == address)
                .cloned()
                .collect();
            let mut idle = Vec::new();
            for key in keys {
                if let Some(entry) = entries.get_mut(&key) {
                    idle.extend(entry.idle.drain(..));
                    if entry.is_vacant() {
                        entries.remove(&key);
                    }
                }
            }
            idle
        };
        for mut conn in idle {
            conn.close().await;
        }
    }

    /// Close all connections and empty the pool. Idempotent.
    pub async fn close(&self) {
        let idle = {
            let mut entries = self.inner.entries.lock();
            let mut idle = Vec::new();
            for (_, mut entry) in entries.drain() {
                idle.extend(entry.idle.drain(..));
            }
            idle
        };
        for mut conn in idle {
            conn.close().await;
        }
    }

    fn checkout_idle(&self, address: &ResolvedAddress) -> Option<M::Connection> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(address)?;
        let conn = entry.idle.pop_front()?;
        // Counted as in use while the health check runs, so the admission cap
        // stays honest.
        entry.in_use += 1;
        Some(conn)
    }

    fn discard_checked_out(&self, address: &ResolvedAddress) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(address) {
            entry.in_use = entry.in_use.saturating_sub(1);
            if entry.is_vacant() {
                entries.remove(address);
            }
        }
    }

    fn has_idle(&self, address: &ResolvedAddress) -> bool {
        self.inner
            .entries
            .lock()
            .get(address)
            .map(|e| !e.idle.is_empty())
            .unwrap_or(false)
    }

    fn try_reserve(&self, address: &ResolvedAddress) -> bool {
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(address.clone()).or_default();
        let can_create = match self.inner.config.max_connection_pool_size {
            None => true,
            Some(max) => entry.size() < max,
        };
        if can_create {
            entry.reservations += 1;
        } else if entry.is_vacant() {
            entries.remove(address);
        }
        can_create
    }

    async fn open_new(
        &self,
        address: &ResolvedAddress,
        deadline: Deadline,
    ) -> Result<PooledConnection<M>> {
        tracing::debug!("[BOLT] opening new connection to {}", address);
        let timeout = deadline
            .merge_timeout(self.inner.config.connection_timeout)
            .to_timeout();
        match self.inner.opener.make_connection(address, timeout).await {
            Ok(conn) => {
                let mut entries = self.inner.entries.lock();
                let entry = entries.entry(address.clone()).or_default();
                entry.reservations = entry.reservations.saturating_sub(1);
                entry.in_use += 1;
                drop(entries);
                Ok(self.wrap(address, conn))
            }
            Err(e) => {
                {
                    let mut entries = self.inner.entries.lock();
                    if let Some(entry) = entries.get_mut(address) {
                        entry.reservations = entry.reservations.saturating_sub(1);
                        if entry.is_vacant() {
                            entries.remove(address);
                        }
                    }
                }
                if matches!(e, Error::ServiceUnavailable(_)) {
                    self.deactivate(address).await;
                }
                Err(e)
            }
        }
    }

    async fn health_check(
        &self,
        conn: &mut M::Connection,
        deadline: Deadline,
        liveness_check_timeout: Option<Duration>,
    ) -> bool {
        if conn.closed() || conn.defunct() || conn.stale() {
            return false;
        }
        if let Some(max_lifetime) = self.inner.config.max_connection_lifetime {
            if conn.age() >= max_lifetime {
                return false;
            }
        }
        if let Some(threshold) = liveness_check_timeout {
            if conn.idle_for() >= threshold {
                let prev = conn.set_io_deadline(Some(deadline));
                let res = conn.reset().await;
                conn.set_io_deadline(prev);
                if res.is_err() {
                    return false;
                }
            }
        }
        true
    }

    fn wrap(&self, address: &ResolvedAddress, conn: M::Connection) -> PooledConnection<M> {
        PooledConnection {
            conn: Some(conn),
            address: address.clone(),
            pool: Arc::downgrade(&self.inner),
        }
    }
}

/// A checked-out connection.
///
/// Hand it back with [`Pool::release`]; a guard that is merely dropped frees
/// its slot but its connection is discarded rather than reused, since nothing
/// can vouch for the state it was left in.
pub struct PooledConnection<M: MakeConnection> {
    conn: Option<M::Connection>,
    address: ResolvedAddress,
    // Non-owning: a checked-out connection never keeps its pool alive.
    pool: Weak<Inner<M>>,
}

impl<M: MakeConnection> PooledConnection<M> {
    pub fn address(&self) -> &ResolvedAddress {
        &self.address
    }
}

impl<M: MakeConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.address)
            .finish()
    }
}

impl<M: MakeConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("present until released")
    }
}

impl<M: MakeConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("present until released")
    }
}

impl<M: MakeConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        drop(conn);
        if let Some(inner) = self.pool.upgrade() {
            tracing::debug!(
                "[BOLT] connection to {} dropped without release",
                self.address
            );
            {
                let mut entries = inner.entries.lock();
                if let Some(entry) = entries.get_mut(&self.address) {
                    entry.in_use = entry.in_use.saturating_sub(1);
                    if entry.is_vacant() {
                        entries.remove(&self.address);
                    }
                }
            }
            inner.released.notify_waiters();
        }
    }
}
