//! The relational backend, seen from the device.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use meter_client::db::ReadingFilter;
use meter_client::domain::{Customer, CustomerId, DiscountRow, NewDiscount, NewReading, RemoteId, RemoteReading};
use thiserror::Error;

pub use memory::MemoryRemote;
pub use postgres::PgRemote;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("remote backend unreachable: {0}")]
    Unreachable(String),
    #[error("remote backend rejected the request: {0}")]
    Rejected(String),
    #[error("remote backend returned an undecodable row: {0}")]
    Decode(String),
}

/// Operations the engine needs from the backend. It inserts readings and
/// discounts and reads all three tables; it never deletes.
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    /// Cheap reachability check used by the connectivity probe.
    async fn ping(&self) -> Result<(), RemoteError>;

    /// Insert under the device's `client_id`. Repeating an insert that the
    /// backend already committed returns the id of that first row.
    async fn insert_reading(&self, client_id: &str, reading: &NewReading) -> Result<RemoteId, RemoteError>;

    async fn insert_discount(&self, client_id: &str, discount: &NewDiscount) -> Result<RemoteId, RemoteError>;

    async fn fetch_customers(&self) -> Result<Vec<Customer>, RemoteError>;

    async fn fetch_readings(&self, filter: &ReadingFilter) -> Result<Vec<RemoteReading>, RemoteError>;

    async fn fetch_discounts(&self, customer_id: Option<&CustomerId>) -> Result<Vec<DiscountRow>, RemoteError>;
}
