use std::fmt;
use std::time::Duration;

use faststr::FastStr;

use crate::bookmarks::Bookmarks;

/// Routes a unit of work to the readers or the writers of the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("READ"),
            AccessMode::Write => f.write_str("WRITE"),
        }
    }
}

/// Pool-level configuration, shared by every session of a driver.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Per-address upper bound on live plus reserved connections.
    /// `None` means unbounded.
    pub max_connection_pool_size: Option<usize>,
    /// Connections older than this are discarded at the next health check.
    pub max_connection_lifetime: Option<Duration>,
    /// TCP/handshake budget handed to the connection opener.
    pub connection_timeout: Option<Duration>,
    /// Upper bound for one routing refresh operation.
    pub update_routing_table_timeout: Duration,
    /// Added to a routing table's TTL before it is purged from memory.
    pub routing_table_purge_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connection_pool_size: Some(100),
            max_connection_lifetime: Some(Duration::from_secs(3600)),
            connection_timeout: Some(Duration::from_secs(30)),
            update_routing_table_timeout: Duration::from_secs(90),
            routing_table_purge_delay: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connection_pool_size(mut self, size: Option<usize>) -> Self {
        self.max_connection_pool_size = size;
        self
    }

    pub fn with_max_connection_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_connection_lifetime = lifetime;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_update_routing_table_timeout(mut self, timeout: Duration) -> Self {
        self.update_routing_table_timeout = timeout;
        self
    }

    pub fn with_routing_table_purge_delay(mut self, delay: Duration) -> Self {
        self.routing_table_purge_delay = delay;
        self
    }
}

/// Per-session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Database to run against. `None` requests the server-chosen home
    /// database, discovered on first connect.
    pub database: Option<FastStr>,
    /// User to impersonate for every unit of work of this session.
    pub impersonated_user: Option<FastStr>,
    /// Causal baseline the first transaction of this session builds on.
    pub bookmarks: Bookmarks,
    pub default_access_mode: AccessMode,
    /// Records requested per PULL.
    pub fetch_size: i64,
    /// Budget covering routing refresh plus connection acquisition.
    pub session_connection_timeout: Duration,
    /// Budget for connection acquisition alone.
    pub connection_acquisition_timeout: Duration,
    /// Idle threshold past which a pooled connection gets a reset probe
    /// before being handed out again.
    pub liveness_check_timeout: Option<Duration>,
    /// Cut-off for the managed transaction retry loop.
    pub max_transaction_retry_time: Duration,
    pub initial_retry_delay: f64,
    pub retry_delay_multiplier: f64,
    pub retry_delay_jitter_factor: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            database: None,
            impersonated_user: None,
            bookmarks: Bookmarks::default(),
            default_access_mode: AccessMode::Write,
            fetch_size: 1000,
            session_connection_timeout: Duration::from_secs(120),
            connection_acquisition_timeout: Duration::from_secs(60),
            liveness_check_timeout: None,
            max_transaction_retry_time: Duration::from_secs(30),
            initial_retry_delay: 1.0,
            retry_delay_multiplier: 2.0,
            retry_delay_jitter_factor: 0.2,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(mut self, database: impl Into<FastStr>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_impersonated_user(mut self, user: impl Into<FastStr>) -> Self {
        self.impersonated_user = Some(user.into());
        self
    }

    pub fn with_bookmarks(mut self, bookmarks: Bookmarks) -> Self {
        self.bookmarks = bookmarks;
        self
    }

    pub fn with_default_access_mode(mut self, mode: AccessMode) -> Self {
        self.default_access_mode = mode;
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: i64) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    pub fn with_session_connection_timeout(mut self, timeout: Duration) -> Self {
        self.session_connection_timeout = timeout;
        self
    }

    pub fn with_connection_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.connection_acquisition_timeout = timeout;
        self
    }

    pub fn with_liveness_check_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.liveness_check_timeout = timeout;
        self
    }

    pub fn with_max_transaction_retry_time(mut self, time: Duration) -> Self {
        self.max_transaction_retry_time = time;
        self
    }

    pub fn with_retry_delays(mut self, initial: f64, multiplier: f64, jitter_factor: f64) -> Self {
        self.initial_retry_delay = initial;
        self.retry_delay_multiplier = multiplier;
        self.retry_delay_jitter_factor = jitter_factor;
        self
    }
}
