use std::time::Duration;

use ahash::AHashSet;
use faststr::FastStr;
use tokio::time::Instant;

use crate::config::AccessMode;
use crate::net::Address;
use crate::protocol::RouteResponse;

/// One database's view of the cluster: which members route, read and write,
/// and for how long that knowledge may be trusted.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    pub(crate) database: Option<FastStr>,
    pub(crate) routers: Vec<Address>,
    pub(crate) readers: Vec<Address>,
    pub(crate) writers: Vec<Address>,
    /// The routers this pool was seeded with; rediscovery falls back to the
    /// first of them.
    pub(crate) initial_routers: Vec<Address>,
    pub(crate) last_updated: Instant,
    pub(crate) ttl: Duration,
    /// The last update carried no writers, e.g. during a leader switch.
    /// The next rediscovery then prefers the initial router.
    pub(crate) initialized_without_writers: bool,
}

impl RoutingTable {
    /// A fresh table knowing nothing but its seed routers. TTL zero, so the
    /// first use triggers discovery.
    pub fn new(database: Option<FastStr>, initial_routers: Vec<Address>) -> Self {
        RoutingTable {
            database,
            routers: initial_routers.clone(),
            readers: Vec::new(),
            writers: Vec::new(),
            initial_routers,
            last_updated: Instant::now(),
            ttl: Duration::ZERO,
            initialized_without_writers: true,
        }
    }

    /// Build a table from a parsed ROUTE reply. `database` falls back to the
    /// requested name when the server did not report one.
    pub fn parse_route_response(response: RouteResponse, requested_database: Option<FastStr>) -> Self {
        let database = response.database.or(requested_database);
        let initialized_without_writers = response.writers.is_empty();
        RoutingTable {
            database,
            routers: response.routers,
            readers: response.readers,
            writers: response.writers,
            initial_routers: Vec::new(),
            last_updated: Instant::now(),
            ttl: response.ttl,
            initialized_without_writers,
        }
    }

    pub fn database(&self) -> Option<&FastStr> {
        self.database.as_ref()
    }

    pub fn initialized_without_writers(&self) -> bool {
        self.initialized_without_writers
    }

    /// Fresh means the TTL has not lapsed and the side relevant to the access
    /// mode is non-empty.
    pub fn is_fresh(&self, readonly: bool) -> bool {
        let expired = self.last_updated.elapsed() >= self.ttl;
        let has_server_for_mode = if readonly {
            !self.readers.is_empty()
        } else {
            !self.writers.is_empty()
        };
        !expired && has_server_for_mode
    }

    /// Tables are held for TTL plus a grace delay after their last update,
    /// then dropped (the default database's table never is).
    pub fn should_be_purged(&self, purge_delay: Duration) -> bool {
        self.last_updated.elapsed() > self.ttl + purge_delay
    }

    /// Replace this table's view with a newly fetched one.
    pub fn update(&mut self, new: RoutingTable) {
        self.routers = new.routers;
        self.readers = new.readers;
        self.writers = new.writers;
        self.database = new.database;
        self.ttl = new.ttl;
        self.last_updated = Instant::now();
        self.initialized_without_writers = self.writers.is_empty();
    }

    pub fn servers_for_mode(&self, mode: AccessMode) -> &[Address] {
        match mode {
            AccessMode::Read => &self.readers,
            AccessMode::Write => &self.writers,
        }
    }

    /// Every address the table references in any role.
    pub fn servers(&self) -> AHashSet<Address> {
        self.routers
            .iter()
            .chain(self.readers.iter())
            .chain(self.writers.iter())
            .cloned()
            .collect()
    }

    /// Forget an address entirely. Discarding a member that is not in the
    /// table is a no-op.
    pub fn deactivate(&mut self, address: &Address) {
        self.routers.retain(|a| a != address);
        self.readers.retain(|a| a != address);
        self.writers.retain(|a| a != address);
    }

    /// Forget an address as a writer only.
    pub fn remove_writer(&mut self, address: &Address) {
        self.writers.retain(|a| a != address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &'static str) -> Address {
        Address::new(host, 7687)
    }

    fn response(ttl: Duration) -> RouteResponse {
        RouteResponse {
            routers: vec![addr("r1"), addr("r2")],
            readers: vec![addr("a"), addr("b")],
            writers: vec![addr("a")],
            ttl,
            database: Some("neo4j".into()),
        }
    }

    #[test]
    fn seed_table_is_never_fresh() {
        let table = RoutingTable::new(None, vec![addr("seed")]);
        assert!(!table.is_fresh(true));
        assert!(!table.is_fresh(false));
        assert!(table.initialized_without_writers);
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_follows_ttl_and_role() {
        let mut table = RoutingTable::new(None, vec![addr("seed")]);
        table.update(RoutingTable::parse_route_response(
            response(Duration::from_secs(60)),
            None,
        ));
        assert!(table.is_fresh(true));
        assert!(table.is_fresh(false));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!table.is_fresh(true));
    }

    #[test]
    fn zero_ttl_is_immediately_stale() {
        let mut table = RoutingTable::new(None, vec![addr("seed")]);
        table.update(RoutingTable::parse_route_response(response(Duration::ZERO), None));
        assert!(!table.is_fresh(true));
    }

    #[test]
    fn empty_writers_flags_the_table() {
        let mut table = RoutingTable::new(None, vec![addr("seed")]);
        let mut resp = response(Duration::from_secs(60));
        resp.writers.clear();
        table.update(RoutingTable::parse_route_response(resp, None));
        assert!(table.initialized_without_writers);
        assert!(table.is_fresh(true));
        assert!(!table.is_fresh(false));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_waits_for_ttl_plus_delay() {
        let mut table = RoutingTable::new(None, vec![addr("seed")]);
        table.update(RoutingTable::parse_route_response(
            response(Duration::from_secs(60)),
            None,
        ));
        let delay = Duration::from_secs(30);
        assert!(!table.should_be_purged(delay));
        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(!table.should_be_purged(delay));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(table.should_be_purged(delay));
    }

    #[test]
    fn deactivate_discards_from_every_role() {
        let mut table = RoutingTable::new(None, vec![addr("seed")]);
        table.update(RoutingTable::parse_route_response(
            response(Duration::from_secs(60)),
            None,
        ));
        table.deactivate(&addr("a"));
        assert!(!table.servers().contains(&addr("a")));
        // idempotent
        table.deactivate(&addr("a"));
        assert!(table.readers.contains(&addr("b")));
    }

    #[test]
    fn server_reported_database_wins() {
        let table = RoutingTable::parse_route_response(response(Duration::ZERO), Some("other".into()));
        assert_eq!(table.database, Some(FastStr::from("neo4j")));
        let mut resp = response(Duration::ZERO);
        resp.database = None;
        let table = RoutingTable::parse_route_response(resp, Some("other".into()));
        assert_eq!(table.database, Some(FastStr::from("other")));
    }
}
