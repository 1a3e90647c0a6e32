//! Sessions: single-owner units of work on top of the routing pool.
//!
//! A session holds at most one connection, and on it at most one outstanding
//! auto-commit result or one explicit transaction. It collects the bookmark
//! of each successful transaction so later work can be causally chained.
//! Sessions are not to be shared across tasks.

mod result;
mod retry;
mod transaction;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use faststr::FastStr;

use crate::bookmarks::Bookmarks;
use crate::config::{AccessMode, SessionConfig};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::pool::routing::RoutingPool;
use crate::pool::PooledConnection;
use crate::protocol::{BeginExtra, Connection, MakeConnection, Record, RunExtra, ValueMap};

pub use result::SessionResult;
pub use transaction::{ManagedTransaction, Transaction};

/// A logical context for transactional units of work. Connections are drawn
/// from the routing pool as required and returned as soon as the unit of work
/// completes.
pub struct Session<M: MakeConnection> {
    pool: Arc<RoutingPool<M>>,
    config: SessionConfig,
    bookmarks: Bookmarks,
    /// Whether the database this session runs against has been pinned, either
    /// from config or through home-database discovery.
    cached_database: bool,
    connection: Option<PooledConnection<M>>,
    auto_result: Option<AutoResult>,
    tx_open: bool,
    state_failed: bool,
    closed: bool,
}

/// Client-side state of the session's open auto-commit result.
struct AutoResult {
    buffer: VecDeque<Record>,
    /// Whether the server still holds records for this result.
    attached: bool,
    bookmark: Option<FastStr>,
}

impl<M: MakeConnection> Session<M> {
    pub fn new(pool: Arc<RoutingPool<M>>, config: SessionConfig) -> Self {
        let bookmarks = config.bookmarks.clone();
        Session {
            pool,
            config,
            bookmarks,
            cached_database: false,
            connection: None,
            auto_result: None,
            tx_open: false,
            state_failed: false,
            closed: false,
        }
    }

    /// Run a query in an auto-commit transaction.
    ///
    /// The query is dispatched immediately; records are fetched lazily
    /// through the returned handle. Running a second query first buffers the
    /// previous result to completion.
    pub async fn run(
        &mut self,
        query: impl Into<FastStr>,
        parameters: ValueMap,
    ) -> Result<SessionResult<'_, M>> {
        self.ensure_open()?;
        let query = query.into();
        if query.is_empty() {
            return Err(Error::client("cannot run an empty query"));
        }
        if self.tx_open {
            return Err(Error::client(
                "explicit transaction already open; run the query through it instead",
            ));
        }
        self.consume_auto_result().await?;
        if self.connection.is_none() {
            self.connect(self.config.default_access_mode).await?;
        }

        let extra = RunExtra {
            database: self.config.database.as_ref(),
            impersonated_user: self.config.impersonated_user.as_ref(),
            bookmarks: &self.bookmarks,
            access_mode: self.config.default_access_mode,
        };
        let res = match self.connection.as_mut() {
            Some(conn) => conn.run(&query, &parameters, Some(extra)).await,
            None => Err(Error::service_unavailable("connection lost")),
        };
        if let Err(e) = res {
            self.handle_io_error(&e).await;
            return Err(e);
        }
        self.auto_result = Some(AutoResult {
            buffer: VecDeque::new(),
            attached: true,
            bookmark: None,
        });
        Ok(SessionResult::new(self))
    }

    /// Begin an unmanaged transaction. At most one transaction may exist in a
    /// session at any point in time.
    pub async fn begin_transaction(
        &mut self,
        metadata: Option<ValueMap>,
        tx_timeout: Option<Duration>,
    ) -> Result<Transaction<'_, M>> {
        self.ensure_open()?;
        self.consume_auto_result().await?;
        if self.tx_open {
            return Err(Error::client("explicit transaction already open"));
        }
        self.open_transaction(
            self.config.default_access_mode,
            metadata.as_ref(),
            tx_timeout,
        )
        .await?;
        Ok(Transaction::new(self))
    }

    /// The most recent bookmarks of this session: either the ones it was
    /// created with or the bookmark of the last successful transaction.
    ///
    /// Consumes any open auto-commit result.
    pub async fn last_bookmarks(&mut self) -> Result<Bookmarks> {
        self.consume_auto_result().await?;
        Ok(self.bookmarks.clone())
    }

    /// Close the session: consume any open result, roll back any open
    /// explicit transaction, release the connection. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.connection.is_some() {
            if self.auto_result.is_some() && !self.state_failed {
                if let Err(e) = self.consume_auto_result().await {
                    tracing::debug!("[BOLT] failed to consume open result on close: {}", e);
                    self.state_failed = true;
                }
            }
            self.auto_result = None;
            self.tx_close().await;
            self.disconnect().await;
        }
        self.auto_result = None;
        self.tx_open = false;
        self.state_failed = false;
        self.closed = true;
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::client("session is closed"));
        }
        Ok(())
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Acquire a connection for `access_mode`, releasing any currently held
    /// one first. On a session without a pinned database this also performs
    /// home-database discovery.
    async fn connect(&mut self, access_mode: AccessMode) -> Result<()> {
        let deadline = Deadline::from_timeout(self.config.session_connection_timeout);
        if let Some(conn) = self.connection.take() {
            self.pool.release(conn).await;
        }
        if !self.cached_database {
            if self.config.database.is_some() {
                self.cached_database = true;
            } else {
                // No explicit database: ask for a routing update so the
                // server can report the home database, then pin it for all
                // subsequent work in this session.
                let pool = self.pool.clone();
                let impersonated_user = self.config.impersonated_user.clone();
                let bookmarks = self.bookmarks.clone();
                let mut reported: Option<Option<FastStr>> = None;
                {
                    let mut cb = |database: Option<FastStr>| reported = Some(database);
                    pool.update_routing_table(
                        None,
                        impersonated_user.as_ref(),
                        &bookmarks,
                        deadline,
                        Some(&mut cb),
                    )
                    .await?;
                }
                if let Some(database) = reported {
                    self.config.database = database;
                    self.cached_database = true;
                }
            }
        }
        let conn = self
            .pool
            .acquire(
                access_mode,
                deadline,
                self.config.connection_acquisition_timeout,
                self.config.database.as_ref(),
                &self.bookmarks,
                self.config.liveness_check_timeout,
            )
            .await?;
        self.connection = Some(conn);
        Ok(())
    }

    pub(crate) async fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.pool.release(conn).await;
        }
    }

    fn collect_bookmark(&mut self, bookmark: Option<FastStr>) {
        if let Some(bookmark) = bookmark {
            self.bookmarks = Bookmarks::from_bookmark(bookmark);
        }
    }

    /// Tear down after an I/O or server error: a failed writer is removed
    /// from the routing view, and the connection goes back to the pool, which
    /// will evict it if it is broken.
    async fn handle_io_error(&mut self, error: &Error) {
        if let Error::Server(e) = error {
            if e.invalidates_writer() {
                if let Some(conn) = self.connection.as_ref() {
                    let address = conn.address().unresolved();
                    self.pool.on_write_failure(&address).await;
                }
            }
        }
        self.disconnect().await;
    }

    /// Consume the open auto-commit result, if any: discard outstanding
    /// records, collect the bookmark, give the connection back.
    async fn consume_auto_result(&mut self) -> Result<()> {
        let Some(mut state) = self.auto_result.take() else {
            return Ok(());
        };
        if state.attached {
            let res = match self.connection.as_mut() {
                Some(conn) => conn.discard().await,
                None => Ok(None),
            };
            match res {
                Ok(bookmark) => state.bookmark = bookmark,
                Err(e) => {
                    self.handle_io_error(&e).await;
                    return Err(e);
                }
            }
        }
        self.collect_bookmark(state.bookmark);
        self.disconnect().await;
        Ok(())
    }

    /// Pull the next batch of the auto-commit result into the buffer.
    async fn fetch_auto_batch(&mut self) -> Result<()> {
        let fetch_size = self.config.fetch_size;
        let res = match self.connection.as_mut() {
            Some(conn) => conn.pull(fetch_size).await,
            None => return Ok(()),
        };
        match res {
            Ok(batch) => {
                if let Some(state) = self.auto_result.as_mut() {
                    state.buffer.extend(batch.records);
                    if !batch.has_more {
                        state.attached = false;
                        state.bookmark = batch.bookmark;
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.auto_result = None;
                self.handle_io_error(&e).await;
                Err(e)
            }
        }
    }

    pub(crate) async fn next_auto_record(&mut self) -> Result<Option<Record>> {
        loop {
            let (buffered, attached) = match self.auto_result.as_ref() {
                Some(state) => (!state.buffer.is_empty(), state.attached),
                None => return Ok(None),
            };
            if buffered {
                return Ok(self
                    .auto_result
                    .as_mut()
                    .and_then(|state| state.buffer.pop_front()));
            }
            if !attached {
                if let Some(state) = self.auto_result.take() {
                    self.collect_bookmark(state.bookmark);
                }
                self.disconnect().await;
                return Ok(None);
            }
            self.fetch_auto_batch().await?;
        }
    }

    pub(crate) async fn finish_auto_result(&mut self) -> Result<()> {
        self.consume_auto_result().await
    }

    pub(crate) async fn open_transaction(
        &mut self,
        access_mode: AccessMode,
        metadata: Option<&ValueMap>,
        tx_timeout: Option<Duration>,
    ) -> Result<()> {
        self.connect(access_mode).await?;
        let extra = BeginExtra {
            database: self.config.database.as_ref(),
            impersonated_user: self.config.impersonated_user.as_ref(),
            bookmarks: &self.bookmarks,
            access_mode,
            metadata,
            tx_timeout,
        };
        let res = match self.connection.as_mut() {
            Some(conn) => conn.begin(extra).await,
            None => Err(Error::service_unavailable("connection lost")),
        };
        if let Err(e) = res {
            self.handle_io_error(&e).await;
            return Err(e);
        }
        self.tx_open = true;
        Ok(())
    }

    pub(crate) async fn tx_run(&mut self, query: FastStr, parameters: &ValueMap) -> Result<Vec<Record>> {
        if !self.tx_open {
            return Err(Error::client("transaction is closed"));
        }
        if query.is_empty() {
            return Err(Error::client("cannot run an empty query"));
        }
        let fetch_size = self.config.fetch_size;

        let res = match self.connection.as_mut() {
            Some(conn) => conn.run(&query, parameters, None).await,
            None => Err(Error::service_unavailable("connection lost")),
        };
        if let Err(e) = res {
            self.tx_open = false;
            self.handle_io_error(&e).await;
            return Err(e);
        }

        let mut records = Vec::new();
        loop {
            let res = match self.connection.as_mut() {
                Some(conn) => conn.pull(fetch_size).await,
                None => Err(Error::service_unavailable("connection lost")),
            };
            match res {
                Ok(batch) => {
                    records.extend(batch.records);
                    if !batch.has_more {
                        return Ok(records);
                    }
                }
                Err(e) => {
                    self.tx_open = false;
                    self.handle_io_error(&e).await;
                    return Err(e);
                }
            }
        }
    }

    pub(crate) async fn tx_commit(&mut self) -> Result<()> {
        if !self.tx_open {
            return Err(Error::client("transaction is closed"));
        }
        let res = match self.connection.as_mut() {
            Some(conn) => conn.commit().await,
            None => Err(Error::service_unavailable("connection lost")),
        };
        self.tx_open = false;
        match res {
            Ok(bookmark) => {
                self.collect_bookmark(bookmark);
                self.disconnect().await;
                Ok(())
            }
            Err(e) => {
                self.handle_io_error(&e).await;
                Err(e)
            }
        }
    }

    pub(crate) async fn tx_rollback(&mut self) -> Result<()> {
        if !self.tx_open {
            return Err(Error::client("transaction is closed"));
        }
        let res = match self.connection.as_mut() {
            Some(conn) => conn.rollback().await,
            None => Ok(()),
        };
        self.tx_open = false;
        match res {
            Ok(()) => {
                self.disconnect().await;
                Ok(())
            }
            Err(e) => {
                self.handle_io_error(&e).await;
                Err(e)
            }
        }
    }

    /// Roll back an open transaction on a cleanup path, swallowing failures.
    pub(crate) async fn tx_close(&mut self) {
        if self.tx_open {
            if let Err(e) = self.tx_rollback().await {
                tracing::debug!("[BOLT] failed to roll back transaction: {}", e);
            }
        }
    }
}

impl<M: MakeConnection> Drop for Session<M> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!("[BOLT] session dropped without being closed");
        }
    }
}
