//! An in-memory cluster double: a scriptable opener and connection pair that
//! answer the protocol-collaborator traits without any sockets.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use faststr::FastStr;
use parking_lot::Mutex;
use tokio::time::Instant;

use graphbolt::bookmarks::Bookmarks;
use graphbolt::deadline::Deadline;
use graphbolt::error::{Error, Result, ServerError};
use graphbolt::net::{Address, ResolvedAddress};
use graphbolt::protocol::{
    BeginExtra, Connection, MakeConnection, PullResult, Record, RouteResponse, RunExtra,
    ServerInfo, Value, ValueMap,
};

/// Wire up log output for a test run; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn addr(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}

pub fn resolved(port: u16) -> ResolvedAddress {
    ResolvedAddress::new(format!("127.0.0.1:{port}").parse().unwrap(), "127.0.0.1")
}

pub fn record_x(value: i64) -> Record {
    Record {
        fields: vec![FastStr::from("x")],
        values: vec![Value::Integer(value)],
    }
}

/// A planned failure for a scripted operation.
#[derive(Clone, Debug)]
pub enum Failure {
    Unavailable,
    Server(ServerError),
}

impl Failure {
    pub fn transient() -> Self {
        Failure::Server(ServerError::new(
            "Neo.TransientError.General.TransactionMemoryLimit",
            "try again",
        ))
    }

    fn into_error(self, conn: &mut FakeConnection) -> Error {
        match self {
            Failure::Unavailable => {
                conn.defunct = true;
                Error::service_unavailable("fake server hung up")
            }
            Failure::Server(e) => Error::Server(e),
        }
    }
}

#[derive(Default)]
pub struct ClusterState {
    pub routers: Vec<Address>,
    pub readers: Vec<Address>,
    pub writers: Vec<Address>,
    pub ttl: Duration,
    /// Database name the server reports in ROUTE replies.
    pub reported_database: Option<FastStr>,
    /// Records served for every RUN.
    pub records: Vec<Record>,
    /// Addresses the opener refuses with `ServiceUnavailable`.
    pub refuse_connect: Vec<Address>,
    /// Addresses whose RESET fails and marks the connection defunct.
    pub fail_reset: Vec<Address>,
    pub route_failures: VecDeque<Failure>,
    pub run_failures: VecDeque<Failure>,
    pub commit_failures: VecDeque<Failure>,

    // observation log
    pub opened: usize,
    pub resets: usize,
    pub rollbacks: usize,
    pub route_databases: Vec<Option<FastStr>>,
    pub run_databases: Vec<Option<FastStr>>,
    pub begin_bookmarks: Vec<Vec<FastStr>>,
    pub begin_times: Vec<Instant>,
    bookmark_counter: usize,
}

impl ClusterState {
    fn next_bookmark(&mut self) -> FastStr {
        self.bookmark_counter += 1;
        FastStr::new(format!("bm:{}", self.bookmark_counter))
    }
}

/// Shared handle onto the scripted cluster; clones observe the same state.
#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        FakeCluster {
            state: Arc::new(Mutex::new(ClusterState {
                ttl: Duration::from_secs(60),
                records: vec![record_x(1)],
                ..ClusterState::default()
            })),
        }
    }

    /// A cluster of one member filling every role.
    pub fn single(address: Address) -> Self {
        let cluster = Self::new();
        cluster.set_roles(
            vec![address.clone()],
            vec![address.clone()],
            vec![address],
        );
        cluster
    }

    pub fn opener(&self) -> FakeOpener {
        FakeOpener {
            state: self.state.clone(),
        }
    }

    pub fn set_roles(&self, routers: Vec<Address>, readers: Vec<Address>, writers: Vec<Address>) {
        let mut state = self.state.lock();
        state.routers = routers;
        state.readers = readers;
        state.writers = writers;
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        f(&mut self.state.lock())
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn begin_count(&self) -> usize {
        self.state.lock().begin_times.len()
    }

    pub fn begin_times(&self) -> Vec<Instant> {
        self.state.lock().begin_times.clone()
    }
}

pub struct FakeOpener {
    state: Arc<Mutex<ClusterState>>,
}

impl MakeConnection for FakeOpener {
    type Connection = FakeConnection;

    async fn make_connection(
        &self,
        address: &ResolvedAddress,
        _timeout: Option<Duration>,
    ) -> Result<FakeConnection> {
        {
            let mut state = self.state.lock();
            if state.refuse_connect.contains(&address.unresolved()) {
                return Err(Error::service_unavailable(format!(
                    "connection refused: {address}"
                )));
            }
            state.opened += 1;
        }
        let now = Instant::now();
        Ok(FakeConnection {
            address: address.clone(),
            state: self.state.clone(),
            server_info: ServerInfo {
                agent: FastStr::from("FakeGraph/5.0"),
                address: address.unresolved(),
                protocol_version: (5, 0),
            },
            closed: false,
            defunct: false,
            stale: false,
            is_reset: true,
            created: now,
            last_used: now,
            io_deadline: None,
            pending: VecDeque::new(),
            streaming: false,
            in_tx: false,
        })
    }
}

pub struct FakeConnection {
    address: ResolvedAddress,
    state: Arc<Mutex<ClusterState>>,
    server_info: ServerInfo,
    closed: bool,
    defunct: bool,
    stale: bool,
    is_reset: bool,
    created: Instant,
    last_used: Instant,
    io_deadline: Option<Deadline>,
    pending: VecDeque<Record>,
    streaming: bool,
    in_tx: bool,
}

impl FakeConnection {
    fn touch(&mut self) -> Result<()> {
        self.last_used = Instant::now();
        if let Some(deadline) = self.io_deadline {
            if deadline.expired() {
                self.defunct = true;
                return Err(Error::DeadlineExceeded);
            }
        }
        if self.closed || self.defunct {
            return Err(Error::service_unavailable("connection is broken"));
        }
        Ok(())
    }
}

impl Connection for FakeConnection {
    fn closed(&self) -> bool {
        self.closed
    }

    fn defunct(&self) -> bool {
        self.defunct
    }

    fn stale(&self) -> bool {
        self.stale
    }

    fn set_stale(&mut self) {
        self.stale = true;
    }

    fn is_reset(&self) -> bool {
        self.is_reset
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn age(&self) -> Duration {
        self.created.elapsed()
    }

    fn local_port(&self) -> u16 {
        self.address.socket_addr().port()
    }

    fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    fn set_io_deadline(&mut self, deadline: Option<Deadline>) -> Option<Deadline> {
        std::mem::replace(&mut self.io_deadline, deadline)
    }

    async fn reset(&mut self) -> Result<()> {
        self.touch()?;
        {
            let mut state = self.state.lock();
            state.resets += 1;
            if state.fail_reset.contains(&self.address.unresolved()) {
                self.defunct = true;
                return Err(Error::service_unavailable("reset failed"));
            }
        }
        self.pending.clear();
        self.streaming = false;
        self.in_tx = false;
        self.is_reset = true;
        Ok(())
    }

    async fn route(
        &mut self,
        database: Option<&FastStr>,
        _impersonated_user: Option<&FastStr>,
        _bookmarks: &Bookmarks,
    ) -> Result<RouteResponse> {
        self.touch()?;
        let mut state = self.state.lock();
        state.route_databases.push(database.cloned());
        if let Some(failure) = state.route_failures.pop_front() {
            drop(state);
            return Err(failure.into_error(self));
        }
        Ok(RouteResponse {
            routers: state.routers.clone(),
            readers: state.readers.clone(),
            writers: state.writers.clone(),
            ttl: state.ttl,
            database: state.reported_database.clone().or_else(|| database.cloned()),
        })
    }

    async fn run(
        &mut self,
        _query: &FastStr,
        _parameters: &ValueMap,
        extra: Option<RunExtra<'_>>,
    ) -> Result<()> {
        self.touch()?;
        self.is_reset = false;
        let (records, failure) = {
            let mut state = self.state.lock();
            if let Some(extra) = extra.as_ref() {
                state.run_databases.push(extra.database.cloned());
            }
            (state.records.clone(), state.run_failures.pop_front())
        };
        if let Some(failure) = failure {
            return Err(failure.into_error(self));
        }
        self.pending = records.into();
        self.streaming = true;
        Ok(())
    }

    async fn pull(&mut self, n: i64) -> Result<PullResult> {
        self.touch()?;
        if !self.streaming {
            return Err(Error::client("no result is streaming"));
        }
        let take = if n < 0 { self.pending.len() } else { n as usize };
        let records: Vec<Record> = self.pending.drain(..take.min(self.pending.len())).collect();
        let has_more = !self.pending.is_empty();
        let mut bookmark = None;
        if !has_more {
            self.streaming = false;
            if !self.in_tx {
                bookmark = Some(self.state.lock().next_bookmark());
            }
        }
        Ok(PullResult {
            records,
            has_more,
            bookmark,
        })
    }

    async fn discard(&mut self) -> Result<Option<FastStr>> {
        self.touch()?;
        self.pending.clear();
        self.streaming = false;
        if self.in_tx {
            Ok(None)
        } else {
            Ok(Some(self.state.lock().next_bookmark()))
        }
    }

    async fn begin(&mut self, extra: BeginExtra<'_>) -> Result<()> {
        self.touch()?;
        self.is_reset = false;
        self.in_tx = true;
        let mut state = self.state.lock();
        state
            .begin_bookmarks
            .push(extra.bookmarks.raw_values().cloned().collect());
        state.begin_times.push(Instant::now());
        Ok(())
    }

    async fn commit(&mut self) -> Result<Option<FastStr>> {
        self.touch()?;
        let failure = self.state.lock().commit_failures.pop_front();
        if let Some(failure) = failure {
            return Err(failure.into_error(self));
        }
        self.in_tx = false;
        Ok(Some(self.state.lock().next_bookmark()))
    }

    async fn rollback(&mut self) -> Result<()> {
        self.touch()?;
        self.in_tx = false;
        self.state.lock().rollbacks += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
