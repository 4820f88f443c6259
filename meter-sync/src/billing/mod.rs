//! Tiered billing.
//!
//! [`calculate_billing`] is the only place a bill amount is computed. The
//! live preview, the commit path and the monthly report all call it with the
//! same inputs, so they always agree.

use meter_client::domain::DiscountValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TariffError {
    #[error("tariff {field} must be a non-negative number, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("upper tier rate {upper} must exceed base rate {base}")]
    TierOrder { base: f64, upper: f64 },
}

/// Two-tier volumetric tariff plus a flat service fee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tariff {
    /// Units billed at `base_rate`; everything above is billed at `upper_rate`.
    pub tier_threshold: f64,
    pub base_rate: f64,
    pub upper_rate: f64,
    /// Charged once per bill, regardless of usage.
    pub service_fee: f64,
}

impl Default for Tariff {
    fn default() -> Self {
        Self {
            tier_threshold: 10.0,
            base_rate: 150.0,
            upper_rate: 200.0,
            service_fee: 500.0,
        }
    }
}

impl Tariff {
    pub fn validate(&self) -> Result<(), TariffError> {
        for (field, value) in [
            ("tier_threshold", self.tier_threshold),
            ("base_rate", self.base_rate),
            ("upper_rate", self.upper_rate),
            ("service_fee", self.service_fee),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TariffError::Negative { field, value });
            }
        }
        if self.upper_rate <= self.base_rate {
            return Err(TariffError::TierOrder {
                base: self.base_rate,
                upper: self.upper_rate,
            });
        }
        Ok(())
    }
}

/// Bill breakdown. Amounts are in currency units; only `total` is rounded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingResult {
    pub usage: f64,
    pub base_units: f64,
    pub upper_units: f64,
    pub base_charge: f64,
    pub upper_charge: f64,
    pub service_fee: f64,
    pub subtotal: f64,
    /// Discount actually deducted, never more than the subtotal.
    pub discount: f64,
    pub total: i64,
}

/// Usage between two gauge values. Decreases are rejected upstream; this
/// clamps to zero rather than producing a negative bill.
pub fn calculate_usage(current: f64, previous: f64) -> f64 {
    let usage = current - previous;
    if usage.is_finite() {
        usage.max(0.0)
    } else {
        0.0
    }
}

pub fn calculate_billing(usage: f64, tariff: &Tariff, discount: Option<&DiscountValue>) -> BillingResult {
    let usage = if usage.is_finite() { usage.max(0.0) } else { 0.0 };

    let base_units = usage.min(tariff.tier_threshold);
    let upper_units = (usage - tariff.tier_threshold).max(0.0);
    let base_charge = base_units * tariff.base_rate;
    let upper_charge = upper_units * tariff.upper_rate;
    let subtotal = base_charge + upper_charge + tariff.service_fee;

    let requested = match discount {
        Some(DiscountValue::Percentage(p)) => subtotal * p / 100.0,
        Some(DiscountValue::FixedAmount(a)) => *a,
        None => 0.0,
    };
    let discount = requested.clamp(0.0, subtotal);
    let total = (subtotal - discount).max(0.0).round() as i64;

    BillingResult {
        usage,
        base_units,
        upper_units,
        base_charge,
        upper_charge,
        service_fee: tariff.service_fee,
        subtotal,
        discount,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifteen_units_without_discount() {
        let bill = calculate_billing(calculate_usage(115.0, 100.0), &Tariff::default(), None);

        assert_eq!(bill.usage, 15.0);
        assert_eq!(bill.base_charge, 1_500.0);
        assert_eq!(bill.upper_charge, 1_000.0);
        assert_eq!(bill.total, 3_500);
    }

    #[test]
    fn tier_boundary_is_inclusive_of_the_threshold() {
        let tariff = Tariff::default();

        let at = calculate_billing(10.0, &tariff, None);
        assert_eq!(at.upper_units, 0.0);
        assert_eq!(at.total, 2_000);

        let above = calculate_billing(11.0, &tariff, None);
        assert_eq!(above.upper_units, 1.0);
        assert_eq!(above.total, 2_200);
    }

    #[test]
    fn zero_usage_still_pays_the_service_fee() {
        let bill = calculate_billing(0.0, &Tariff::default(), None);
        assert_eq!(bill.total, 500);
    }

    #[test]
    fn percentage_discount_applies_to_fee_and_volume() {
        let bill = calculate_billing(15.0, &Tariff::default(), Some(&DiscountValue::Percentage(10.0)));
        assert_eq!(bill.discount, 350.0);
        assert_eq!(bill.total, 3_150);
    }

    #[test]
    fn fixed_discount_never_makes_the_bill_negative() {
        let bill = calculate_billing(2.0, &Tariff::default(), Some(&DiscountValue::FixedAmount(5_000.0)));
        assert_eq!(bill.subtotal, 800.0);
        assert_eq!(bill.discount, 800.0);
        assert_eq!(bill.total, 0);
    }

    #[test]
    fn rounds_to_the_nearest_currency_unit() {
        let bill = calculate_billing(0.5, &Tariff::default(), Some(&DiscountValue::Percentage(33.0)));
        // (75 + 500) * 0.67 = 385.25
        assert_eq!(bill.total, 385);
    }

    #[test]
    fn preview_and_commit_agree() {
        let discount = DiscountValue::Percentage(12.5);
        let preview = calculate_billing(37.3, &Tariff::default(), Some(&discount));
        let commit = calculate_billing(37.3, &Tariff::default(), Some(&discount));
        assert_eq!(preview, commit);
    }

    #[test]
    fn negative_or_nan_usage_is_clamped() {
        assert_eq!(calculate_usage(90.0, 100.0), 0.0);
        assert_eq!(calculate_billing(f64::NAN, &Tariff::default(), None).usage, 0.0);
    }

    #[test]
    fn tariff_validation() {
        assert!(Tariff::default().validate().is_ok());

        let inverted = Tariff {
            upper_rate: 100.0,
            ..Tariff::default()
        };
        assert_eq!(
            inverted.validate(),
            Err(TariffError::TierOrder {
                base: 150.0,
                upper: 100.0
            })
        );

        let negative_fee = Tariff {
            service_fee: -1.0,
            ..Tariff::default()
        };
        assert!(matches!(negative_fee.validate(), Err(TariffError::Negative { field: "service_fee", .. })));
    }
}
