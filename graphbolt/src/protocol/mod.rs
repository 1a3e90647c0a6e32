//! The contract between the driver core and the wire-protocol collaborator.
//!
//! Everything byte-level lives behind these traits: PackStream
//! encoding/decoding, the magic preamble and version negotiation, TLS and
//! keepalive socket setup. The core only sees established connections that
//! can exchange the message vocabulary below (RESET, ROUTE, BEGIN, RUN, PULL,
//! DISCARD, COMMIT, ROLLBACK) in already-parsed form.

use std::future::Future;
use std::time::Duration;

use ahash::AHashMap;
use faststr::FastStr;

use crate::bookmarks::Bookmarks;
use crate::config::AccessMode;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::net::{Address, ResolvedAddress};

/// A protocol value, in the shape the codec collaborator hands over.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(FastStr),
    List(Vec<Value>),
    Map(AHashMap<FastStr, Value>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(FastStr::new(v))
    }
}

impl From<FastStr> for Value {
    fn from(v: FastStr) -> Self {
        Value::String(v)
    }
}

pub type ValueMap = AHashMap<FastStr, Value>;

/// One row of a result stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub fields: Vec<FastStr>,
    pub values: Vec<Value>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .position(|f| f == field)
            .map(|i| &self.values[i])
    }
}

/// The batch handed back by one PULL.
#[derive(Clone, Debug, Default)]
pub struct PullResult {
    pub records: Vec<Record>,
    /// Whether the server holds further records for this result.
    pub has_more: bool,
    /// The causal token, present on the final batch of an auto-commit result.
    pub bookmark: Option<FastStr>,
}

/// The parsed reply to a ROUTE request.
#[derive(Clone, Debug)]
pub struct RouteResponse {
    pub routers: Vec<Address>,
    pub readers: Vec<Address>,
    pub writers: Vec<Address>,
    pub ttl: Duration,
    /// The database this table applies to, as reported by the server. Differs
    /// from the requested one when the server fills in the home database.
    pub database: Option<FastStr>,
}

#[derive(Clone, Debug)]
pub struct ServerInfo {
    pub agent: FastStr,
    pub address: Address,
    pub protocol_version: (u8, u8),
}

/// Everything an auto-commit RUN carries besides the query itself.
#[derive(Clone, Copy, Debug)]
pub struct RunExtra<'a> {
    pub database: Option<&'a FastStr>,
    pub impersonated_user: Option<&'a FastStr>,
    pub bookmarks: &'a Bookmarks,
    pub access_mode: AccessMode,
}

/// Everything a BEGIN carries.
#[derive(Clone, Copy, Debug)]
pub struct BeginExtra<'a> {
    pub database: Option<&'a FastStr>,
    pub impersonated_user: Option<&'a FastStr>,
    pub bookmarks: &'a Bookmarks,
    pub access_mode: AccessMode,
    pub metadata: Option<&'a ValueMap>,
    pub tx_timeout: Option<Duration>,
}

/// An established, handshook connection to one cluster member.
///
/// A connection has exactly one user at a time; the pool guarantees this by
/// handing out ownership. All request methods are strictly ordered on the
/// underlying socket.
pub trait Connection: Send + 'static {
    /// Gracefully shut down by the client.
    fn closed(&self) -> bool;
    /// Given up on after an I/O or protocol error; possibly half-dead.
    fn defunct(&self) -> bool;
    /// Marked as not-to-be-reused; possibly still alive.
    fn stale(&self) -> bool;
    fn set_stale(&mut self);
    /// Whether the connection sits in the clean post-RESET state.
    fn is_reset(&self) -> bool;
    /// Time since the connection was last used.
    fn idle_for(&self) -> Duration;
    /// Time since the connection was established.
    fn age(&self) -> Duration;
    fn local_port(&self) -> u16;
    fn server_info(&self) -> &ServerInfo;

    /// Attach a deadline to all subsequent socket I/O on this connection,
    /// returning the previous one so callers can restore it on scope exit.
    /// I/O past the deadline fails with `Error::DeadlineExceeded`.
    fn set_io_deadline(&mut self, deadline: Option<Deadline>) -> Option<Deadline>;

    fn reset(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn route(
        &mut self,
        database: Option<&FastStr>,
        impersonated_user: Option<&FastStr>,
        bookmarks: &Bookmarks,
    ) -> impl Future<Output = Result<RouteResponse>> + Send;

    /// Dispatch RUN. `extra` is present for auto-commit queries and absent
    /// inside an explicit transaction.
    fn run(
        &mut self,
        query: &FastStr,
        parameters: &ValueMap,
        extra: Option<RunExtra<'_>>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Fetch up to `n` records of the current result; `n < 0` requests all of
    /// them.
    fn pull(&mut self, n: i64) -> impl Future<Output = Result<PullResult>> + Send;

    /// Throw away the rest of the current result, returning the bookmark if
    /// the result completed an auto-commit transaction.
    fn discard(&mut self) -> impl Future<Output = Result<Option<FastStr>>> + Send;

    fn begin(&mut self, extra: BeginExtra<'_>) -> impl Future<Output = Result<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<Option<FastStr>>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Close the socket. A no-op on already closed connections.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens connections: dial, handshake, authenticate. Injected into the pool.
pub trait MakeConnection: Send + Sync + 'static {
    type Connection: Connection;

    /// Establish a connection to `address` within `timeout`.
    ///
    /// Fails with `Error::ServiceUnavailable` on network or handshake
    /// failure, which additionally deactivates the address in a routing pool.
    fn make_connection(
        &self,
        address: &ResolvedAddress,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Self::Connection>> + Send;
}
