use anyhow::Result;
use sqlx::PgPool;

use crate::domain::Customer;

/// Fetch every customer, grouped by RT for stable report ordering.
pub async fn list_customers(pool: &PgPool) -> Result<Vec<Customer>> {
    let rows = sqlx::query_as::<_, Customer>(
        r#"
        SELECT id, name, rt, phone
        FROM customers
        ORDER BY rt, name
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
