//! Business rules for readings and discounts.
//!
//! Everything here is pure: callers gather the customer's history first and
//! the rules never touch the store or the network.

use std::fmt;

use meter_client::domain::{BillingMonth, CustomerId, DiscountValue, RemoteId, RemoteReading};
use serde::{Deserialize, Serialize};
use time::Date;

use crate::store::{LocalId, StoredReading};

/// Where a historical reading lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "store", content = "id", rename_all = "snake_case")]
pub enum ReadingRef {
    Local(LocalId),
    Remote(RemoteId),
}

impl fmt::Display for ReadingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local reading {id}"),
            Self::Remote(id) => write!(f, "remote reading {id}"),
        }
    }
}

/// One known reading of a customer, from either store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalReading {
    pub reference: ReadingRef,
    pub value: f64,
    pub date: Date,
}

impl From<&StoredReading> for HistoricalReading {
    fn from(r: &StoredReading) -> Self {
        Self {
            reference: r
                .remote_id
                .map(ReadingRef::Remote)
                .unwrap_or(ReadingRef::Local(r.id)),
            value: r.value,
            date: r.reading_date,
        }
    }
}

impl From<&RemoteReading> for HistoricalReading {
    fn from(r: &RemoteReading) -> Self {
        Self {
            reference: ReadingRef::Remote(r.id),
            value: r.value,
            date: r.reading_date,
        }
    }
}

/// Union of local and remote readings for validation, oldest first.
///
/// A local reading that `remote` already holds, matched by remote id or by
/// the device id it was uploaded under, is the same observation and is kept
/// once.
pub fn merge_history(local: &[StoredReading], remote: &[RemoteReading]) -> Vec<HistoricalReading> {
    let mut merged: Vec<HistoricalReading> = remote.iter().map(HistoricalReading::from).collect();

    for reading in local {
        let client_id = reading.id.to_string();
        let duplicate = remote.iter().any(|r| {
            Some(r.id) == reading.remote_id || r.client_id.as_deref() == Some(client_id.as_str())
        });
        if !duplicate {
            merged.push(HistoricalReading::from(reading));
        }
    }

    merged.sort_by_key(|r| r.date);
    merged
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("reading value is not a number: {raw:?}")]
    NotNumeric { raw: String },
    #[error("reading value cannot be negative: {value}")]
    Negative { value: f64 },
    #[error("reading date {date} is in the future (today is {today})")]
    FutureDate { date: Date, today: Date },
    #[error("reading cannot decrease: {value} is below {reference} ({previous} on {date})")]
    Decrease {
        value: f64,
        previous: f64,
        reference: ReadingRef,
        date: Date,
    },
    #[error("reading dated {date} precedes {reference} dated {latest}")]
    OutOfOrder {
        date: Date,
        latest: Date,
        reference: ReadingRef,
    },
    #[error("a reading already exists for {month}: {reference} on {date}")]
    DuplicateMonth {
        month: BillingMonth,
        reference: ReadingRef,
        date: Date,
    },
    #[error("usage {usage} exceeds {factor}x the average of {average:.2} over the last {intervals} interval(s)")]
    Anomaly {
        usage: f64,
        average: f64,
        factor: f64,
        intervals: usize,
    },
    #[error("discount must set exactly one of percentage ({percentage}) or fixed amount ({fixed_amount})")]
    DiscountExclusivity { percentage: f64, fixed_amount: f64 },
    #[error("discount percentage {percentage} is outside [0, 100]")]
    PercentageOutOfRange { percentage: f64 },
    #[error("discount amount {amount} must be a positive number")]
    InvalidAmount { amount: f64 },
}

/// Blocking errors and non-blocking warnings from one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    fn error(issue: ValidationIssue) -> Self {
        Self {
            errors: vec![issue],
            warnings: Vec::new(),
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let issues = if self.errors.is_empty() {
            &self.warnings
        } else {
            &self.errors
        };
        for (i, issue) in issues.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// Thresholds for the usage anomaly warning.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnomalyPolicy {
    /// Usage above `factor` times the rolling average is flagged.
    pub factor: f64,
    /// Number of preceding intervals in the rolling average.
    pub window: usize,
}

impl Default for AnomalyPolicy {
    fn default() -> Self {
        Self {
            factor: 2.0,
            window: 5,
        }
    }
}

/// Inputs for [`validate_reading`].
#[derive(Debug, Clone)]
pub struct ReadingContext<'a> {
    pub customer_id: &'a CustomerId,
    pub date: Date,
    pub today: Date,
    /// Known readings of the customer, any order.
    pub history: &'a [HistoricalReading],
    /// Pre-fetched previous reading; derived from `history` when `None`.
    pub previous: Option<&'a HistoricalReading>,
    pub anomaly: AnomalyPolicy,
}

/// Parse a gauge value typed by an agent or read from an import file.
pub fn parse_reading_value(raw: &str) -> Result<f64, ValidationIssue> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ValidationIssue::NotNumeric {
            raw: raw.to_string(),
        }),
    }
}

/// Most recent reading strictly before `date`.
pub fn previous_in_history(history: &[HistoricalReading], date: Date) -> Option<&HistoricalReading> {
    history
        .iter()
        .filter(|r| r.date < date)
        .max_by_key(|r| r.date)
}

/// Validate a new gauge value for a customer.
///
/// Rules:
/// - the value must be a finite, non-negative number;
/// - the date must not be after today;
/// - the value must not be below the previous reading;
/// - the date must not precede the customer's latest reading;
/// - at most one reading per customer per calendar month;
/// - usage above `factor` times the rolling average usage is a warning.
pub fn validate_reading(value: f64, ctx: &ReadingContext<'_>) -> ValidationReport {
    if !value.is_finite() {
        return ValidationReport::error(ValidationIssue::NotNumeric {
            raw: value.to_string(),
        });
    }
    if value < 0.0 {
        return ValidationReport::error(ValidationIssue::Negative { value });
    }

    let mut report = ValidationReport::default();

    if ctx.date > ctx.today {
        report.errors.push(ValidationIssue::FutureDate {
            date: ctx.date,
            today: ctx.today,
        });
    }

    let previous = ctx
        .previous
        .or_else(|| previous_in_history(ctx.history, ctx.date));

    if let Some(prev) = previous {
        if value < prev.value {
            report.errors.push(ValidationIssue::Decrease {
                value,
                previous: prev.value,
                reference: prev.reference,
                date: prev.date,
            });
        }
    }

    let month = BillingMonth::from_date(ctx.date);

    if let Some(latest) = ctx.history.iter().max_by_key(|r| r.date) {
        if latest.date > ctx.date && !month.contains(latest.date) {
            report.errors.push(ValidationIssue::OutOfOrder {
                date: ctx.date,
                latest: latest.date,
                reference: latest.reference,
            });
        }
    }

    if let Some(existing) = ctx.history.iter().find(|r| month.contains(r.date)) {
        report.errors.push(ValidationIssue::DuplicateMonth {
            month,
            reference: existing.reference,
            date: existing.date,
        });
    }

    if let Some(prev) = previous {
        if value >= prev.value {
            if let Some(warning) = anomaly_warning(value - prev.value, ctx) {
                report.warnings.push(warning);
            }
        }
    }

    report
}

/// Rolling average over the last `window` intervals before the reading
/// date; fewer are used when fewer exist. No warning without a baseline.
fn anomaly_warning(usage: f64, ctx: &ReadingContext<'_>) -> Option<ValidationIssue> {
    let mut prior: Vec<&HistoricalReading> = ctx.history.iter().filter(|r| r.date < ctx.date).collect();
    prior.sort_by_key(|r| r.date);

    let intervals: Vec<f64> = prior.windows(2).map(|w| w[1].value - w[0].value).collect();
    let recent = &intervals[intervals.len().saturating_sub(ctx.anomaly.window)..];
    if recent.is_empty() {
        return None;
    }

    let average = recent.iter().sum::<f64>() / recent.len() as f64;
    if average <= 0.0 || usage <= ctx.anomaly.factor * average {
        return None;
    }

    Some(ValidationIssue::Anomaly {
        usage,
        average,
        factor: ctx.anomaly.factor,
        intervals: recent.len(),
    })
}

/// Raw discount columns as entered by an administrator.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscountDraft {
    pub customer_id: CustomerId,
    pub percentage: f64,
    pub fixed_amount: f64,
    pub reason: String,
    pub month: BillingMonth,
    pub active: bool,
}

/// Check the percentage-xor-amount invariant and produce the typed value.
pub fn validate_discount(draft: &DiscountDraft) -> Result<DiscountValue, ValidationReport> {
    discount_value_from_columns(draft.percentage, draft.fixed_amount)
}

/// Shared by form drafts and backend rows.
pub fn discount_value_from_columns(percentage: f64, fixed_amount: f64) -> Result<DiscountValue, ValidationReport> {
    let mut report = ValidationReport::default();

    if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
        report
            .errors
            .push(ValidationIssue::PercentageOutOfRange { percentage });
    }
    if !fixed_amount.is_finite() || fixed_amount < 0.0 {
        report
            .errors
            .push(ValidationIssue::InvalidAmount { amount: fixed_amount });
    }
    if !report.is_ok() {
        return Err(report);
    }

    match (percentage != 0.0, fixed_amount != 0.0) {
        (true, false) => Ok(DiscountValue::Percentage(percentage)),
        (false, true) => Ok(DiscountValue::FixedAmount(fixed_amount)),
        _ => Err(ValidationReport::error(ValidationIssue::DiscountExclusivity {
            percentage,
            fixed_amount,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn remote(id: i64, value: f64, date: Date) -> HistoricalReading {
        HistoricalReading {
            reference: ReadingRef::Remote(RemoteId(id)),
            value,
            date,
        }
    }

    fn ctx<'a>(customer: &'a CustomerId, date: Date, history: &'a [HistoricalReading]) -> ReadingContext<'a> {
        ReadingContext {
            customer_id: customer,
            date,
            today: date!(2024 - 12 - 31),
            history,
            previous: None,
            anomaly: AnomalyPolicy::default(),
        }
    }

    #[test]
    fn accepts_increase_over_previous_month() {
        let customer = CustomerId::from("c-1");
        let history = [remote(1, 100.0, date!(2024 - 11 - 01))];

        let report = validate_reading(115.0, &ctx(&customer, date!(2024 - 12 - 01), &history));
        assert!(report.is_ok());
        assert!(!report.has_warnings());
    }

    #[test]
    fn rejects_decrease_and_names_previous_reading() {
        let customer = CustomerId::from("c-1");
        let history = [remote(1, 100.0, date!(2024 - 11 - 01))];

        let report = validate_reading(90.0, &ctx(&customer, date!(2024 - 12 - 01), &history));
        assert_eq!(
            report.errors,
            vec![ValidationIssue::Decrease {
                value: 90.0,
                previous: 100.0,
                reference: ReadingRef::Remote(RemoteId(1)),
                date: date!(2024 - 11 - 01),
            }]
        );
    }

    #[test]
    fn prefetched_previous_takes_precedence() {
        let customer = CustomerId::from("c-1");
        let prefetched = remote(9, 120.0, date!(2024 - 11 - 20));
        let mut c = ctx(&customer, date!(2024 - 12 - 01), &[]);
        c.previous = Some(&prefetched);

        let report = validate_reading(110.0, &c);
        assert!(matches!(&report.errors[..], [ValidationIssue::Decrease { previous, .. }] if *previous == 120.0));
    }

    #[test]
    fn rejects_second_reading_in_same_month() {
        let customer = CustomerId::from("c-1");
        let history = [
            remote(1, 100.0, date!(2024 - 11 - 01)),
            remote(2, 110.0, date!(2024 - 12 - 02)),
        ];

        let report = validate_reading(120.0, &ctx(&customer, date!(2024 - 12 - 20), &history));
        assert_eq!(
            report.errors,
            vec![ValidationIssue::DuplicateMonth {
                month: BillingMonth::new(2024, 12).unwrap(),
                reference: ReadingRef::Remote(RemoteId(2)),
                date: date!(2024 - 12 - 02),
            }]
        );
    }

    #[test]
    fn smaller_value_on_earlier_date_is_rejected() {
        let customer = CustomerId::from("c-1");
        let history = [remote(1, 100.0, date!(2024 - 11 - 01))];

        let report = validate_reading(90.0, &ctx(&customer, date!(2024 - 10 - 01), &history));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationIssue::OutOfOrder { .. })));
    }

    #[test]
    fn rejects_negative_non_numeric_and_future_input() {
        let customer = CustomerId::from("c-1");

        let report = validate_reading(-1.0, &ctx(&customer, date!(2024 - 12 - 01), &[]));
        assert_eq!(report.errors, vec![ValidationIssue::Negative { value: -1.0 }]);

        let report = validate_reading(f64::NAN, &ctx(&customer, date!(2024 - 12 - 01), &[]));
        assert!(matches!(report.errors[..], [ValidationIssue::NotNumeric { .. }]));

        let report = validate_reading(5.0, &ctx(&customer, date!(2025 - 01 - 05), &[]));
        assert!(matches!(report.errors[..], [ValidationIssue::FutureDate { .. }]));

        assert!(parse_reading_value("12a").is_err());
        assert!(parse_reading_value("inf").is_err());
        assert_eq!(parse_reading_value(" 12.5 ").unwrap(), 12.5);
    }

    #[test]
    fn warns_when_usage_exceeds_twice_the_five_interval_average() {
        let customer = CustomerId::from("c-1");
        let history = [
            remote(1, 100.0, date!(2024 - 06 - 01)),
            remote(2, 110.0, date!(2024 - 07 - 01)),
            remote(3, 120.0, date!(2024 - 08 - 01)),
            remote(4, 130.0, date!(2024 - 09 - 01)),
            remote(5, 140.0, date!(2024 - 10 - 01)),
            remote(6, 150.0, date!(2024 - 11 - 01)),
        ];

        // previous reading is 150 on 2024-11-01; usage 25 against an average of 10
        let report = validate_reading(175.0, &ctx(&customer, date!(2024 - 12 - 01), &history));
        assert!(report.is_ok());
        assert_eq!(
            report.warnings,
            vec![ValidationIssue::Anomaly {
                usage: 25.0,
                average: 10.0,
                factor: 2.0,
                intervals: 5,
            }]
        );
    }

    #[test]
    fn anomaly_uses_available_intervals_when_fewer_than_window() {
        let customer = CustomerId::from("c-1");
        let history = [
            remote(1, 100.0, date!(2024 - 10 - 01)),
            remote(2, 104.0, date!(2024 - 11 - 01)),
        ];

        let report = validate_reading(113.0, &ctx(&customer, date!(2024 - 12 - 01), &history));
        assert!(matches!(report.warnings[..], [ValidationIssue::Anomaly { intervals: 1, .. }]));

        let single = [remote(1, 100.0, date!(2024 - 11 - 01))];
        let report = validate_reading(500.0, &ctx(&customer, date!(2024 - 12 - 01), &single));
        assert!(!report.has_warnings());
    }

    #[test]
    fn merge_history_drops_local_copies_of_remote_rows() {
        use time::macros::datetime;

        let mut remote_rows = vec![RemoteReading {
            id: RemoteId(5),
            customer_id: CustomerId::from("c-1"),
            value: 100.0,
            reading_date: date!(2024 - 11 - 01),
            client_id: None,
        }];
        let synced = StoredReading {
            id: LocalId::generate(),
            customer_id: CustomerId::from("c-1"),
            value: 100.0,
            reading_date: date!(2024 - 11 - 01),
            created_at: datetime!(2024-11-01 08:00 UTC),
            synced: true,
            remote_id: Some(RemoteId(5)),
        };
        let pending = StoredReading {
            id: LocalId::generate(),
            remote_id: None,
            synced: false,
            value: 115.0,
            reading_date: date!(2024 - 12 - 01),
            ..synced.clone()
        };

        // Committed by the backend, never acknowledged locally.
        let unacked = StoredReading {
            id: LocalId::generate(),
            remote_id: None,
            synced: false,
            value: 90.0,
            reading_date: date!(2024 - 10 - 01),
            ..synced.clone()
        };
        remote_rows.push(RemoteReading {
            id: RemoteId(6),
            customer_id: CustomerId::from("c-1"),
            value: 90.0,
            reading_date: date!(2024 - 10 - 01),
            client_id: Some(unacked.id.to_string()),
        });

        let merged = merge_history(&[synced, pending.clone(), unacked], &remote_rows);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].reference, ReadingRef::Remote(RemoteId(6)));
        assert_eq!(merged[2].reference, ReadingRef::Local(pending.id));
    }

    #[test]
    fn discount_requires_exactly_one_column() {
        let draft = |percentage, fixed_amount| DiscountDraft {
            customer_id: CustomerId::from("c-1"),
            percentage,
            fixed_amount,
            reason: "promo".to_string(),
            month: BillingMonth::new(2024, 12).unwrap(),
            active: true,
        };

        assert_eq!(validate_discount(&draft(10.0, 0.0)), Ok(DiscountValue::Percentage(10.0)));
        assert_eq!(validate_discount(&draft(0.0, 500.0)), Ok(DiscountValue::FixedAmount(500.0)));

        let both = validate_discount(&draft(10.0, 500.0)).unwrap_err();
        assert!(matches!(both.errors[..], [ValidationIssue::DiscountExclusivity { .. }]));
        let neither = validate_discount(&draft(0.0, 0.0)).unwrap_err();
        assert!(matches!(neither.errors[..], [ValidationIssue::DiscountExclusivity { .. }]));

        let too_big = validate_discount(&draft(120.0, 0.0)).unwrap_err();
        assert_eq!(too_big.errors, vec![ValidationIssue::PercentageOutOfRange { percentage: 120.0 }]);
        let negative = validate_discount(&draft(0.0, -5.0)).unwrap_err();
        assert_eq!(negative.errors, vec![ValidationIssue::InvalidAmount { amount: -5.0 }]);
    }
}
