// SQLite-backed persistence for seen referrals, session tokens and counters

pub mod error;
pub mod models;
pub mod store;

pub use error::{Result, StoreError};
pub use models::{AggregateMetadata, ServiceRequestRecord, TokenPair};
pub use store::{RecordStore, SqliteStore, TokenRepository};
