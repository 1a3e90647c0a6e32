#![cfg_attr(not(doctest), doc = include_str!("../README.md"))]

pub mod bookmarks;
pub mod config;
pub mod deadline;
pub mod error;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod routing;
pub mod session;

pub use bookmarks::Bookmarks;
pub use config::{AccessMode, PoolConfig, SessionConfig};
pub use deadline::Deadline;
pub use error::{Error, Result, Retryable, ServerError};
pub use faststr::FastStr;
pub use net::resolve::{DnsResolver, Resolve, StaticResolver};
pub use net::{Address, ResolvedAddress};
pub use pool::routing::RoutingPool;
pub use pool::{Pool, PooledConnection};
pub use protocol::{Connection, MakeConnection, Record, Value, ValueMap};
pub use routing::RoutingTable;
pub use session::{ManagedTransaction, Session, SessionResult, Transaction};
