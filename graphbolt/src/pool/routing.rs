//! The cluster-aware pool: per-database routing tables, rediscovery and
//! least-loaded address selection on top of the per-address pool.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use faststr::FastStr;
use rand::seq::IndexedRandom;
use tokio::sync::{Mutex, MutexGuard};

use super::{Pool, PooledConnection};
use crate::bookmarks::Bookmarks;
use crate::config::{AccessMode, PoolConfig};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::net::resolve::Resolve;
use crate::net::{Address, ResolvedAddress};
use crate::protocol::{Connection, MakeConnection};
use crate::routing::RoutingTable;

type Tables = AHashMap<Option<FastStr>, RoutingTable>;

/// Handler invoked with the server-reported database name once a routing
/// update succeeds; lets sessions cache their home database.
pub type DatabaseCallback<'a> = Option<&'a mut (dyn FnMut(Option<FastStr>) + Send)>;

/// Reborrow a `DatabaseCallback` with a fresh, shorter lifetime so it can be
/// passed into a nested call without moving out of the original binding.
fn reborrow_database_callback<'a>(cb: &'a mut DatabaseCallback<'_>) -> DatabaseCallback<'a> {
    match cb {
        Some(cb) => Some(&mut **cb),
        None => None,
    }
}

/// A connection pool that maintains one routing table per database and routes
/// acquisitions to the least-loaded member for the requested access mode.
pub struct RoutingPool<M: MakeConnection> {
    pool: Pool<M>,
    resolver: Arc<dyn Resolve>,
    /// Seed routers; rediscovery falls back to the first of them.
    initial_routers: Vec<Address>,
    default_database: Option<FastStr>,
    /// The refresh lock. Owning the tables means they can only be mutated
    /// while holding it. Taken before the pool lock, never after.
    tables: Mutex<Tables>,
}

impl<M: MakeConnection> RoutingPool<M> {
    pub fn new(
        initial_routers: Vec<Address>,
        opener: M,
        resolver: Arc<dyn Resolve>,
        config: PoolConfig,
        default_database: Option<FastStr>,
    ) -> Result<Self> {
        if initial_routers.is_empty() {
            return Err(Error::Config(
                "routing pool needs at least one initial router address".into(),
            ));
        }
        tracing::debug!("[BOLT] routing addresses {:?}", initial_routers);
        let mut tables = Tables::new();
        tables.insert(
            default_database.clone(),
            RoutingTable::new(default_database.clone(), initial_routers.clone()),
        );
        Ok(RoutingPool {
            pool: Pool::new(opener, config),
            resolver,
            initial_routers,
            default_database,
            tables: Mutex::new(tables),
        })
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    pub fn first_initial_router(&self) -> &Address {
        &self.initial_routers[0]
    }

    /// Acquire a connection for `access_mode` against `database`.
    ///
    /// Freshens the routing table first; that time is billed to `deadline`
    /// but not to `acquisition_timeout`, whose clock starts afterwards.
    pub async fn acquire(
        &self,
        access_mode: AccessMode,
        deadline: Deadline,
        acquisition_timeout: Duration,
        database: Option<&FastStr>,
        bookmarks: &Bookmarks,
        liveness_check_timeout: Option<Duration>,
    ) -> Result<PooledConnection<M>> {
        if acquisition_timeout.is_zero() {
            return Err(Error::client(
                "'acquisition_timeout' must be larger than 0",
            ));
        }
        self.ensure_routing_table_is_fresh(access_mode, database, None, bookmarks, deadline, None)
            .await?;

        let deadline = deadline.merge(Deadline::from_timeout(acquisition_timeout));
        loop {
            let address = match self.select_address(access_mode, database).await {
                Ok(address) => address,
                Err(e @ (Error::ReadServiceUnavailable | Error::WriteServiceUnavailable)) => {
                    return Err(Error::session_expired(format!(
                        "failed to obtain a connection towards {access_mode} server: {e}"
                    )));
                }
                Err(e) => return Err(e),
            };
            tracing::debug!(
                "[BOLT] acquire database={:?} address={}",
                database,
                address
            );
            match self
                .acquire_endpoint(&address, deadline, liveness_check_timeout)
                .await
            {
                Ok(conn) => return Ok(conn),
                Err(e) if e.rotates_address() => {
                    tracing::debug!("[BOLT] failed to acquire from {}: {}", address, e);
                    self.deactivate(&address).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve `address` and try its endpoints in emission order.
    async fn acquire_endpoint(
        &self,
        address: &Address,
        deadline: Deadline,
        liveness_check_timeout: Option<Duration>,
    ) -> Result<PooledConnection<M>> {
        let endpoints = self.resolver.resolve(address).await?;
        let mut last = None;
        for endpoint in endpoints {
            match self
                .pool
                .acquire(&endpoint, deadline, liveness_check_timeout)
                .await
            {
                Ok(conn) => return Ok(conn),
                Err(e) if e.rotates_address() => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::service_unavailable(format!("no endpoints resolved for {address}"))
        }))
    }

    /// Pick the reader (or writer) with the fewest in-use connections,
    /// uniformly at random among ties.
    pub async fn select_address(
        &self,
        access_mode: AccessMode,
        database: Option<&FastStr>,
    ) -> Result<Address> {
        // Grouping by usage happens under the refresh lock so the table
        // cannot shift underneath the selection.
        let tables = self.tables.lock().await;
        let addresses: Vec<Address> = tables
            .get(&database.cloned())
            .map(|t| t.servers_for_mode(access_mode).to_vec())
            .unwrap_or_default();
        let usage: Vec<(usize, Address)> = addresses
            .into_iter()
            .map(|a| (self.pool.in_use_count_host(&a), a))
            .collect();
        drop(tables);
        let no_service = || match access_mode {
            AccessMode::Read => Error::ReadServiceUnavailable,
            AccessMode::Write => Error::WriteServiceUnavailable,
        };
        let min = usage.iter().map(|(count, _)| *count).min().ok_or_else(no_service)?;
        let least: Vec<Address> = usage
            .into_iter()
            .filter(|(count, _)| *count == min)
            .map(|(_, a)| a)
            .collect();
        least
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(no_service)
    }

    /// Update the routing table for `database` if it is not fresh for
    /// `access_mode`, evict connections to members that fell out of the
    /// cluster view, and drop tables nobody asked about for TTL plus grace.
    ///
    /// Returns whether an update was performed.
    pub async fn ensure_routing_table_is_fresh(
        &self,
        access_mode: AccessMode,
        database: Option<&FastStr>,
        impersonated_user: Option<&FastStr>,
        bookmarks: &Bookmarks,
        deadline: Deadline,
        mut database_callback: DatabaseCallback<'_>,
    ) -> Result<bool> {
        let mut tables = self.lock_tables(deadline).await?;
        let table = self.get_or_create(&mut tables, database);
        if table.is_fresh(access_mode == AccessMode::Read) {
            return Ok(false);
        }

        self.update_locked(
            &mut tables,
            database,
            impersonated_user,
            bookmarks,
            deadline.merge_timeout(Some(self.pool.config().update_routing_table_timeout)),
            reborrow_database_callback(&mut database_callback),
        )
        .await?;
        self.update_connection_pool_locked(&tables, database).await;

        let purge_delay = self.pool.config().routing_table_purge_delay;
        tables.retain(|db, table| {
            if db == &self.default_database {
                return true;
            }
            let purge = table.should_be_purged(purge_delay);
            if purge {
                tracing::debug!("[BOLT] purging aged routing table for {:?}", db);
            }
            !purge
        });
        Ok(true)
    }

    /// Update the routing table for `database` from the first router able to
    /// provide valid routing information.
    pub async fn update_routing_table(
        &self,
        database: Option<&FastStr>,
        impersonated_user: Option<&FastStr>,
        bookmarks: &Bookmarks,
        deadline: Deadline,
        database_callback: DatabaseCallback<'_>,
    ) -> Result<()> {
        let deadline =
            deadline.merge_timeout(Some(self.pool.config().update_routing_table_timeout));
        let mut tables = self.lock_tables(deadline).await?;
        self.update_locked(
            &mut tables,
            database,
            impersonated_user,
            bookmarks,
            deadline,
            database_callback,
        )
        .await
    }

    async fn update_locked(
        &self,
        tables: &mut Tables,
        database: Option<&FastStr>,
        impersonated_user: Option<&FastStr>,
        bookmarks: &Bookmarks,
        deadline: Deadline,
        mut database_callback: DatabaseCallback<'_>,
    ) -> Result<()> {
        let table = self.get_or_create(tables, database);
        let existing = table.routers.clone();
        let prefer_initial = table.initialized_without_writers;
        let first_initial = self.first_initial_router().clone();

        if prefer_initial {
            // A view without writers is rebuilt from the first initial
            // router; only that one is consulted.
            if self
                .update_from_routers(
                    tables,
                    std::slice::from_ref(&first_initial),
                    database,
                    impersonated_user,
                    bookmarks,
                    deadline,
                    reborrow_database_callback(&mut database_callback),
                )
                .await?
            {
                return Ok(());
            }
        }

        let known: Vec<Address> = existing
            .into_iter()
            .filter(|router| router != &first_initial)
            .collect();
        if self
            .update_from_routers(
                tables,
                &known,
                database,
                impersonated_user,
                bookmarks,
                deadline,
                reborrow_database_callback(&mut database_callback),
            )
            .await?
        {
            return Ok(());
        }

        if !prefer_initial
            && self
                .update_from_routers(
                    tables,
                    std::slice::from_ref(&first_initial),
                    database,
                    impersonated_user,
                    bookmarks,
                    deadline,
                    database_callback,
                )
                .await?
        {
            return Ok(());
        }

        tracing::error!("[BOLT] unable to retrieve routing information");
        Err(Error::service_unavailable(
            "Unable to retrieve routing information",
        ))
    }

    /// Try each router in order; on the first success merge the fetched table
    /// and report the server-chosen database. Routers that yield nothing are
    /// deactivated.
    async fn update_from_routers(
        &self,
        tables: &mut Tables,
        routers: &[Address],
        database: Option<&FastStr>,
        impersonated_user: Option<&FastStr>,
        bookmarks: &Bookmarks,
        deadline: Deadline,
        mut database_callback: DatabaseCallback<'_>,
    ) -> Result<bool> {
        if !routers.is_empty() {
            tracing::debug!("[BOLT] attempting to update routing table from {:?}", routers);
        }
        for router in routers {
            let endpoints = match self.resolver.resolve(router).await {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    tracing::debug!("[BOLT] failed to resolve router {}: {}", router, e);
                    Vec::new()
                }
            };
            for endpoint in endpoints {
                if deadline.expired() {
                    return Ok(false);
                }
                if let Some(new_table) = self
                    .fetch_routing_table(&endpoint, database, impersonated_user, bookmarks, deadline)
                    .await?
                {
                    let reported_database = new_table.database.clone();
                    let entry = self.get_or_create_owned(tables, reported_database.clone());
                    entry.update(new_table);
                    tracing::debug!(
                        "[BOLT] updated routing table from {}: routers={:?} readers={:?} writers={:?}",
                        endpoint,
                        entry.routers,
                        entry.readers,
                        entry.writers
                    );
                    if let Some(cb) = database_callback.as_mut() {
                        cb(reported_database);
                    }
                    return Ok(true);
                }
            }
            self.deactivate_locked(tables, router).await;
        }
        Ok(false)
    }

    /// Fetch a routing table from one router endpoint.
    ///
    /// Returns `None` when the router is currently unable to provide usable
    /// routing information (unreachable, stale view, or a table missing
    /// routers or readers). A missing writer set is a legitimate transient
    /// cluster state and accepted. Server errors that condemn the routing
    /// request itself abort discovery.
    pub async fn fetch_routing_table(
        &self,
        address: &ResolvedAddress,
        database: Option<&FastStr>,
        impersonated_user: Option<&FastStr>,
        bookmarks: &Bookmarks,
        deadline: Deadline,
    ) -> Result<Option<RoutingTable>> {
        let response = match self
            .fetch_routing_info(address, database, impersonated_user, bookmarks, deadline)
            .await
        {
            Ok(response) => response,
            Err(Error::Server(e)) => {
                if e.is_fatal_during_discovery() {
                    return Err(Error::Server(e));
                }
                tracing::debug!("[BOLT] discovery failed on {}: [{}] {}", address, e.code, e.message);
                return Ok(None);
            }
            Err(e) if e.rotates_address() => {
                tracing::debug!("[BOLT] failed to fetch routing info from {}: {}", address, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let table = RoutingTable::parse_route_response(response, database.cloned());
        if table.routers.is_empty() {
            tracing::debug!("[BOLT] no routing servers returned from {}", address);
            return Ok(None);
        }
        if table.readers.is_empty() {
            tracing::debug!("[BOLT] no read servers returned from {}", address);
            return Ok(None);
        }
        Ok(Some(table))
    }

    async fn fetch_routing_info(
        &self,
        address: &ResolvedAddress,
        database: Option<&FastStr>,
        impersonated_user: Option<&FastStr>,
        bookmarks: &Bookmarks,
        deadline: Deadline,
    ) -> Result<crate::protocol::RouteResponse> {
        let mut conn = self.pool.acquire(address, deadline, None).await?;
        let prev = conn.set_io_deadline(Some(deadline));
        let res = conn
            .route(
                database.or(self.default_database.as_ref()),
                impersonated_user,
                bookmarks,
            )
            .await;
        conn.set_io_deadline(prev);
        self.pool.release(conn).await;
        res
    }

    /// Evict pool entries for members no longer part of `database`'s view.
    async fn update_connection_pool_locked(&self, tables: &Tables, database: Option<&FastStr>) {
        let Some(table) = tables.get(&database.cloned()) else {
            return;
        };
        let servers = table.servers();
        for address in self.pool.addresses() {
            if !servers.contains(&address.unresolved()) {
                self.pool.deactivate(&address).await;
            }
        }
    }

    /// Remove an address from every routing table and close its idle
    /// connections. Idempotent.
    pub async fn deactivate(&self, address: &Address) {
        tracing::debug!("[BOLT] deactivating address {}", address);
        let mut tables = self.tables.lock().await;
        self.deactivate_locked(&mut tables, address).await;
    }

    async fn deactivate_locked(&self, tables: &mut Tables, address: &Address) {
        for table in tables.values_mut() {
            table.deactivate(address);
        }
        self.pool.deactivate_host(address).await;
    }

    /// Remove a writer address from every routing table, if present. The next
    /// write acquisition will trigger rediscovery.
    pub async fn on_write_failure(&self, address: &Address) {
        tracing::debug!("[BOLT] removing writer {}", address);
        let mut tables = self.tables.lock().await;
        for table in tables.values_mut() {
            table.remove_writer(address);
        }
    }

    /// A snapshot of the routing table for `database`, if one exists.
    pub async fn routing_table(&self, database: Option<&FastStr>) -> Option<RoutingTable> {
        self.tables.lock().await.get(&database.cloned()).cloned()
    }

    /// Give a connection back; see [`Pool::release`].
    pub async fn release(&self, conn: PooledConnection<M>) {
        self.pool.release(conn).await;
    }

    pub fn mark_all_stale(&self) {
        self.pool.mark_all_stale();
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn lock_tables(&self, deadline: Deadline) -> Result<MutexGuard<'_, Tables>> {
        match deadline.to_timeout() {
            None => Ok(self.tables.lock().await),
            Some(timeout) => tokio::time::timeout(timeout, self.tables.lock())
                .await
                .map_err(|_| Error::RoutingRefreshTimeout(deadline.original_secs())),
        }
    }

    fn get_or_create<'t>(
        &self,
        tables: &'t mut Tables,
        database: Option<&FastStr>,
    ) -> &'t mut RoutingTable {
        self.get_or_create_owned(tables, database.cloned())
    }

    fn get_or_create_owned<'t>(
        &self,
        tables: &'t mut Tables,
        database: Option<FastStr>,
    ) -> &'t mut RoutingTable {
        let initial_routers = self.initial_routers.clone();
        tables
            .entry(database.clone())
            .or_insert_with(|| RoutingTable::new(database, initial_routers))
    }
}
