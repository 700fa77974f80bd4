//! SQLite-backed storage for ingested items.
//!
//! One [`ItemStore`] owns one database file: the `items` table, the
//! `download_metadata` key/value table and the `batch_status` ledger that
//! records which id ranges have been fully fetched. Writers are serialized by
//! SQLite; the store opens the database in WAL mode so ad-hoc read queries
//! keep working while a batch upsert is committing.

mod error;
mod migrations;
mod model;
mod store;

pub use error::StateError;
pub use model::BatchEntry;
pub use store::ItemStore;
pub use store::QueryResult;

pub type Result<T> = std::result::Result<T, StateError>;
