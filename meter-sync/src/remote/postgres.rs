use std::time::Duration;

use async_trait::async_trait;
use meter_client::db::{self, ReadingFilter};
use meter_client::domain::{Customer, CustomerId, DiscountRow, NewDiscount, NewReading, RemoteId, RemoteReading};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::remote::{RemoteBackend, RemoteError};

/// PostgreSQL backend via the `meter-client` query functions.
#[derive(Clone)]
pub struct PgRemote {
    pool: PgPool,
}

impl PgRemote {
    /// Builds a lazily connecting pool so the device can start offline.
    pub fn connect_lazy(uri: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self, RemoteError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(uri)
            .map_err(|e| RemoteError::Unreachable(format!("invalid remote uri: {e}")))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Database-level refusals are rejections; everything else is treated as a
/// connectivity problem.
fn classify(err: anyhow::Error) -> RemoteError {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => RemoteError::Rejected(db_err.to_string()),
        Some(sqlx::Error::RowNotFound) => RemoteError::Rejected("no row returned".to_string()),
        Some(
            e @ (sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. }),
        ) => RemoteError::Decode(e.to_string()),
        _ => RemoteError::Unreachable(err.to_string()),
    }
}

#[async_trait]
impl RemoteBackend for PgRemote {
    async fn ping(&self) -> Result<(), RemoteError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| classify(e.into()))
    }

    async fn insert_reading(&self, client_id: &str, reading: &NewReading) -> Result<RemoteId, RemoteError> {
        db::insert_reading(&self.pool, client_id, reading).await.map_err(classify)
    }

    async fn insert_discount(&self, client_id: &str, discount: &NewDiscount) -> Result<RemoteId, RemoteError> {
        db::insert_discount(&self.pool, client_id, discount).await.map_err(classify)
    }

    async fn fetch_customers(&self) -> Result<Vec<Customer>, RemoteError> {
        db::list_customers(&self.pool).await.map_err(classify)
    }

    async fn fetch_readings(&self, filter: &ReadingFilter) -> Result<Vec<RemoteReading>, RemoteError> {
        db::list_readings(&self.pool, filter).await.map_err(classify)
    }

    async fn fetch_discounts(&self, customer_id: Option<&CustomerId>) -> Result<Vec<DiscountRow>, RemoteError> {
        db::list_discounts(&self.pool, customer_id).await.map_err(classify)
    }
}
