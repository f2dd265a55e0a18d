//! PostgreSQL connection pooling for the maildepot store.
//!
//! The pool owns a set of backend connections and a single FIFO queue of
//! submitted work. Standalone queries run in autocommit mode on whichever
//! handle frees up first; callers that depend on ordering or atomicity
//! acquire a [`Transaction`], which dedicates one handle until commit or
//! rollback.
//!
//! Everything above the wire protocol is written against the [`Backend`]
//! seam so that pool policy, transaction semantics and the savepoint retry
//! loops built on top of them can be exercised without a server.

pub mod backend;
pub mod config;
mod copy;
mod error;
mod handle;
mod pool;
mod query;
pub mod testing;
mod transaction;
mod value;

pub use backend::{Backend, Connector, PgConnector};
pub use config::DbConfig;
pub use error::DbError;
pub use pool::Pool;
pub use query::{Query, QueryHandle};
pub use transaction::{Transaction, TxStatus};
pub use value::{NullKind, Row, Value};
