use time::{Date, OffsetDateTime};

use super::{BillingMonth, CustomerId, RemoteId};

/// A validated discount value. The backend stores this as two columns of
/// which exactly one is non-zero.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(tag = "kind", content = "value", rename_all = "snake_case")
)]
pub enum DiscountValue {
    Percentage(f64),
    FixedAmount(f64),
}

impl DiscountValue {
    /// Value of the `percentage` column.
    pub fn percentage(&self) -> f64 {
        match self {
            Self::Percentage(p) => *p,
            Self::FixedAmount(_) => 0.0,
        }
    }

    /// Value of the `fixed_amount` column.
    pub fn fixed_amount(&self) -> f64 {
        match self {
            Self::Percentage(_) => 0.0,
            Self::FixedAmount(a) => *a,
        }
    }
}

/// A discount row from the backend `discounts` table. Column values are not
/// trusted; they are validated before use.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscountRow {
    pub id: RemoteId,
    pub customer_id: CustomerId,
    pub percentage: f64,
    pub fixed_amount: f64,
    pub reason: String,
    /// First day of the billing month the discount applies to.
    pub month: Date,
    pub active: bool,
    pub created_by: String,
    pub created_at: OffsetDateTime,
    pub client_id: Option<String>,
}

impl DiscountRow {
    pub fn billing_month(&self) -> BillingMonth {
        BillingMonth::from_date(self.month)
    }
}

/// Insert payload for the `discounts` table.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewDiscount {
    pub customer_id: CustomerId,
    pub value: DiscountValue,
    pub reason: String,
    pub month: BillingMonth,
    pub active: bool,
    pub created_by: String,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_accessors_zero_the_other_column() {
        let pct = DiscountValue::Percentage(25.0);
        assert_eq!(pct.percentage(), 25.0);
        assert_eq!(pct.fixed_amount(), 0.0);

        let fixed = DiscountValue::FixedAmount(1_000.0);
        assert_eq!(fixed.percentage(), 0.0);
        assert_eq!(fixed.fixed_amount(), 1_000.0);
    }
}
