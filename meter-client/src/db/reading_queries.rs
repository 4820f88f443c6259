use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::Date;

use crate::domain::{CustomerId, NewReading, RemoteId, RemoteReading};

/// Optional restrictions applied when listing readings.
///
/// `until` is exclusive so a month range can be expressed with two
/// `BillingMonth::first_day` values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub customer_id: Option<CustomerId>,
    pub from: Option<Date>,
    pub until: Option<Date>,
}

/// Insert a single reading and return the backend id.
///
/// `client_id` is the device's id for the reading. Inserting the same
/// `client_id` twice returns the existing row's id instead of a new row.
pub async fn insert_reading(pool: &PgPool, client_id: &str, reading: &NewReading) -> Result<RemoteId> {
    let id = sqlx::query_scalar::<_, RemoteId>(
        r#"
        INSERT INTO readings (client_id, customer_id, value, reading_date)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (client_id) DO UPDATE SET client_id = EXCLUDED.client_id
        RETURNING id
        "#,
    )
    .bind(client_id)
    .bind(&reading.customer_id)
    .bind(reading.value)
    .bind(reading.reading_date)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// List readings ordered by customer then date.
pub async fn list_readings(pool: &PgPool, filter: &ReadingFilter) -> Result<Vec<RemoteReading>> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT id, customer_id, value, reading_date, client_id FROM readings WHERE TRUE",
    );

    if let Some(customer_id) = &filter.customer_id {
        builder.push(" AND customer_id = ").push_bind(customer_id.clone());
    }
    if let Some(from) = filter.from {
        builder.push(" AND reading_date >= ").push_bind(from);
    }
    if let Some(until) = filter.until {
        builder.push(" AND reading_date < ").push_bind(until);
    }
    builder.push(" ORDER BY customer_id, reading_date");

    let rows = builder
        .build_query_as::<RemoteReading>()
        .fetch_all(pool)
        .await?;

    Ok(rows)
}
