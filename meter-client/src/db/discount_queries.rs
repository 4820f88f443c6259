use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::domain::{CustomerId, DiscountRow, NewDiscount, RemoteId};

/// Insert a discount and return the backend id.
///
/// The validated value is split back into the two exclusive columns. A
/// repeated `client_id` resolves to the row it first created.
pub async fn insert_discount(pool: &PgPool, client_id: &str, discount: &NewDiscount) -> Result<RemoteId> {
    let id = sqlx::query_scalar::<_, RemoteId>(
        r#"
        INSERT INTO discounts
            (client_id, customer_id, percentage, fixed_amount, reason, month, active, created_by, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (client_id) DO UPDATE SET client_id = EXCLUDED.client_id
        RETURNING id
        "#,
    )
    .bind(client_id)
    .bind(&discount.customer_id)
    .bind(discount.value.percentage())
    .bind(discount.value.fixed_amount())
    .bind(&discount.reason)
    .bind(discount.month.first_day())
    .bind(discount.active)
    .bind(&discount.created_by)
    .bind(discount.created_at)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// List discounts, optionally for a single customer, oldest first.
pub async fn list_discounts(
    pool: &PgPool,
    customer_id: Option<&CustomerId>,
) -> Result<Vec<DiscountRow>> {
    let mut builder = QueryBuilder::<Postgres>::new(
        r#"
        SELECT id, customer_id, percentage, fixed_amount, reason, month, active, created_by, created_at, client_id
        FROM discounts
        WHERE TRUE
        "#,
    );

    if let Some(customer_id) = customer_id {
        builder.push(" AND customer_id = ").push_bind(customer_id.clone());
    }
    builder.push(" ORDER BY created_at");

    let rows = builder
        .build_query_as::<DiscountRow>()
        .fetch_all(pool)
        .await?;

    Ok(rows)
}
