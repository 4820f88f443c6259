//! Batch billing over a range of months.
//!
//! [`BatchPipeline::transform`] re-validates every reading in scope against
//! the customer's other readings (audit mode), computes usage and the bill,
//! and collects per-record failures instead of aborting.

pub mod report;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use futures::Stream;
use meter_client::db::ReadingFilter;
use meter_client::domain::{BillingMonth, Customer, CustomerId, DiscountValue};
use serde::{Serialize, Serializer};
use time::OffsetDateTime;

use crate::billing::{calculate_billing, calculate_usage, BillingResult, Tariff};
use crate::context::ExecutionContext;
use crate::remote::{RemoteBackend, RemoteError};
use crate::store::{KvBackend, LocalStore, StoreError};
use crate::sync::Connectivity;
use crate::validation::{
    discount_value_from_columns, merge_history, previous_in_history, validate_reading, AnomalyPolicy,
    HistoricalReading, ReadingContext, ReadingRef, ValidationReport,
};

pub use report::{GroupSummary, MonthlyReport};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("unknown customer {0}")]
    UnknownCustomer(CustomerId),
    #[error("reading fails validation: {0}")]
    Validation(ValidationReport),
    #[error("invalid discount for {customer_id} in {month}: {report}")]
    InvalidDiscount {
        customer_id: CustomerId,
        month: BillingMonth,
        report: ValidationReport,
    },
    #[error("invalid billing month {year}-{month}")]
    InvalidMonth { year: i32, month: u8 },
    #[error("line {line}: {reason}")]
    InvalidRow { line: u64, reason: String },
    #[error("source error: {0}")]
    Source(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;
}

/// Which store a batch was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Backend rows merged with readings not yet synced from this device.
    Remote,
    Local,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformFilter {
    /// First billing month in scope, inclusive.
    pub from: Option<BillingMonth>,
    /// Last billing month in scope, inclusive.
    pub until: Option<BillingMonth>,
    pub rt: Option<String>,
    pub customer_id: Option<CustomerId>,
}

impl TransformFilter {
    pub fn month(month: BillingMonth) -> Self {
        Self {
            from: Some(month),
            until: Some(month),
            ..Self::default()
        }
    }

    fn includes_month(&self, month: BillingMonth) -> bool {
        self.from.map_or(true, |from| month >= from) && self.until.map_or(true, |until| month <= until)
    }

    fn includes_customer(&self, customer: &Customer) -> bool {
        self.customer_id.as_ref().map_or(true, |id| &customer.id == id)
            && self.rt.as_ref().map_or(true, |rt| &customer.rt == rt)
    }
}

/// A reading with its computed bill.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BilledRecord {
    pub customer_id: CustomerId,
    pub rt: String,
    pub month: BillingMonth,
    pub reading: HistoricalReading,
    pub previous: Option<HistoricalReading>,
    pub warnings: Vec<crate::validation::ValidationIssue>,
    pub bill: BillingResult,
}

fn serialize_display<S: Serializer, T: Display>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[derive(Debug, Serialize)]
pub struct RecordError {
    pub customer_id: CustomerId,
    pub reading: Option<ReadingRef>,
    #[serde(serialize_with = "serialize_display")]
    pub error: PipelineError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformMetrics {
    pub source: DataSource,
    pub customers: usize,
    pub readings_in_scope: usize,
    pub billed: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct TransformOutput {
    pub records: Vec<BilledRecord>,
    pub errors: Vec<RecordError>,
    /// Customers matching the filter, billed or not.
    pub customers: Vec<Customer>,
    pub metrics: TransformMetrics,
}

struct DiscountFact {
    customer_id: CustomerId,
    month: BillingMonth,
    active: bool,
    created_at: OffsetDateTime,
    value: Result<DiscountValue, ValidationReport>,
}

struct Dataset {
    source: DataSource,
    customers: Vec<Customer>,
    readings: BTreeMap<CustomerId, Vec<HistoricalReading>>,
    discounts: Vec<DiscountFact>,
}

pub struct BatchPipeline<B, R> {
    store: LocalStore<B>,
    remote: Arc<R>,
    connectivity: Connectivity,
    tariff: Tariff,
    anomaly: AnomalyPolicy,
}

impl<B: KvBackend, R: RemoteBackend> BatchPipeline<B, R> {
    pub fn new(
        store: LocalStore<B>,
        remote: Arc<R>,
        connectivity: Connectivity,
        tariff: Tariff,
        anomaly: AnomalyPolicy,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            tariff,
            anomaly,
        }
    }

    pub async fn transform(
        &self,
        ctx: &ExecutionContext,
        filter: &TransformFilter,
    ) -> Result<TransformOutput, PipelineError> {
        let started = Instant::now();
        let data = self.load(filter).await?;

        let customers: Vec<Customer> = data
            .customers
            .iter()
            .filter(|c| filter.includes_customer(c))
            .cloned()
            .collect();

        let mut records = Vec::new();
        let mut errors = Vec::new();
        let mut readings_in_scope = 0;

        for (customer_id, history) in &data.readings {
            if filter.customer_id.as_ref().is_some_and(|id| id != customer_id) {
                continue;
            }
            let in_scope = history
                .iter()
                .filter(|r| filter.includes_month(BillingMonth::from_date(r.date)));

            let Some(customer) = data.customers.iter().find(|c| &c.id == customer_id) else {
                for reading in in_scope {
                    readings_in_scope += 1;
                    errors.push(RecordError {
                        customer_id: customer_id.clone(),
                        reading: Some(reading.reference),
                        error: PipelineError::UnknownCustomer(customer_id.clone()),
                    });
                }
                continue;
            };
            if !filter.includes_customer(customer) {
                continue;
            }

            for reading in in_scope {
                readings_in_scope += 1;
                match self.bill_record(ctx, customer, reading, history, &data.discounts) {
                    Ok(record) => records.push(record),
                    Err(error) => errors.push(RecordError {
                        customer_id: customer_id.clone(),
                        reading: Some(reading.reference),
                        error,
                    }),
                }
            }
        }

        let elapsed = started.elapsed();
        metrics::counter!("pipeline_records_billed_total").increment(records.len() as u64);
        metrics::counter!("pipeline_record_errors_total").increment(errors.len() as u64);
        metrics::histogram!("pipeline_transform_duration_seconds").record(elapsed.as_secs_f64());

        let metrics = TransformMetrics {
            source: data.source,
            customers: customers.len(),
            readings_in_scope,
            billed: records.len(),
            failed: errors.len(),
            elapsed_ms: elapsed.as_millis(),
        };
        tracing::info!(
            source = ?metrics.source,
            readings = metrics.readings_in_scope,
            billed = metrics.billed,
            failed = metrics.failed,
            "batch transform finished"
        );

        Ok(TransformOutput {
            records,
            errors,
            customers,
            metrics,
        })
    }

    /// Per-RT totals for one billing month.
    pub async fn generate_monthly_report(
        &self,
        ctx: &ExecutionContext,
        year: i32,
        month: u8,
    ) -> Result<MonthlyReport, PipelineError> {
        let billing_month = BillingMonth::new(year, month).ok_or(PipelineError::InvalidMonth { year, month })?;
        let output = self.transform(ctx, &TransformFilter::month(billing_month)).await?;
        Ok(report::summarize(billing_month, output))
    }

    fn bill_record(
        &self,
        ctx: &ExecutionContext,
        customer: &Customer,
        reading: &HistoricalReading,
        history: &[HistoricalReading],
        discounts: &[DiscountFact],
    ) -> Result<BilledRecord, PipelineError> {
        let month = BillingMonth::from_date(reading.date);

        // Audit mode: only what was known when the reading was taken, plus
        // anything else in the same month.
        let audit_history: Vec<HistoricalReading> = history
            .iter()
            .filter(|r| r.reference != reading.reference)
            .filter(|r| r.date < reading.date || month.contains(r.date))
            .cloned()
            .collect();

        let report = validate_reading(
            reading.value,
            &ReadingContext {
                customer_id: &customer.id,
                date: reading.date,
                today: ctx.today(),
                history: &audit_history,
                previous: None,
                anomaly: self.anomaly,
            },
        );
        if !report.is_ok() {
            return Err(PipelineError::Validation(report));
        }

        let previous = previous_in_history(&audit_history, reading.date).cloned();
        let usage = previous
            .as_ref()
            .map_or(0.0, |prev| calculate_usage(reading.value, prev.value));

        let discount = discounts
            .iter()
            .filter(|d| d.active && d.month == month && d.customer_id == customer.id)
            .max_by_key(|d| d.created_at);
        let discount = match discount.map(|d| &d.value) {
            None => None,
            Some(Ok(value)) => Some(*value),
            Some(Err(report)) => {
                return Err(PipelineError::InvalidDiscount {
                    customer_id: customer.id.clone(),
                    month,
                    report: report.clone(),
                })
            }
        };

        Ok(BilledRecord {
            customer_id: customer.id.clone(),
            rt: customer.rt.clone(),
            month,
            reading: reading.clone(),
            previous,
            warnings: report.warnings,
            bill: calculate_billing(usage, &self.tariff, discount.as_ref()),
        })
    }

    async fn load(&self, filter: &TransformFilter) -> Result<Dataset, PipelineError> {
        if self.connectivity.is_online() {
            match self.load_remote(filter).await {
                Ok(data) => return Ok(data),
                Err(PipelineError::Remote(e)) => {
                    tracing::warn!(error = %e, "remote load failed, billing from local store");
                }
                Err(e) => return Err(e),
            }
        }
        self.load_local().await
    }

    async fn load_remote(&self, filter: &TransformFilter) -> Result<Dataset, PipelineError> {
        let customers = self.remote.fetch_customers().await?;
        let remote_readings = self
            .remote
            .fetch_readings(&ReadingFilter {
                customer_id: filter.customer_id.clone(),
                from: None,
                until: filter.until.map(|m| m.next().first_day()),
            })
            .await?;
        let remote_discounts = self.remote.fetch_discounts(filter.customer_id.as_ref()).await?;

        let local_readings = self.store.list_readings().await?;
        let mut by_customer: BTreeMap<CustomerId, (Vec<_>, Vec<_>)> = BTreeMap::new();
        for r in local_readings {
            by_customer.entry(r.customer_id.clone()).or_default().0.push(r);
        }
        for r in remote_readings {
            by_customer.entry(r.customer_id.clone()).or_default().1.push(r);
        }
        let readings = by_customer
            .into_iter()
            .map(|(id, (local, remote))| (id, merge_history(&local, &remote)))
            .collect();

        let uploaded: Vec<String> = remote_discounts.iter().filter_map(|d| d.client_id.clone()).collect();
        let mut discounts: Vec<DiscountFact> = remote_discounts
            .into_iter()
            .map(|row| DiscountFact {
                month: row.billing_month(),
                active: row.active,
                created_at: row.created_at,
                value: discount_value_from_columns(row.percentage, row.fixed_amount),
                customer_id: row.customer_id,
            })
            .collect();
        discounts.extend(
            self.store
                .list_discounts()
                .await?
                .into_iter()
                .filter(|d| !d.synced && !uploaded.contains(&d.id.to_string()))
                .map(|d| DiscountFact {
                    customer_id: d.customer_id,
                    month: d.month,
                    active: d.active,
                    created_at: d.created_at,
                    value: Ok(d.value),
                }),
        );

        Ok(Dataset {
            source: DataSource::Remote,
            customers,
            readings,
            discounts,
        })
    }

    async fn load_local(&self) -> Result<Dataset, PipelineError> {
        let customers = self.store.list_customers().await?;

        let mut grouped: BTreeMap<CustomerId, Vec<_>> = BTreeMap::new();
        for r in self.store.list_readings().await? {
            grouped.entry(r.customer_id.clone()).or_default().push(r);
        }
        let readings = grouped
            .into_iter()
            .map(|(id, local)| (id, merge_history(&local, &[])))
            .collect();

        let discounts = self
            .store
            .list_discounts()
            .await?
            .into_iter()
            .map(|d| DiscountFact {
                customer_id: d.customer_id,
                month: d.month,
                active: d.active,
                created_at: d.created_at,
                value: Ok(d.value),
            })
            .collect();

        Ok(Dataset {
            source: DataSource::Local,
            customers,
            readings,
            discounts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::store::MemoryBackend;
    use meter_client::domain::{DiscountRow, NewReading, RemoteId};
    use time::macros::{date, datetime};

    fn customer(id: &str, rt: &str) -> Customer {
        Customer {
            id: CustomerId::from(id),
            name: format!("customer {id}"),
            rt: rt.to_string(),
            phone: None,
        }
    }

    fn seed(remote: &MemoryRemote, id: &str, value: f64, date: time::Date) {
        remote.seed_reading(NewReading {
            customer_id: CustomerId::from(id),
            value,
            reading_date: date,
        });
    }

    fn pipeline(remote: &Arc<MemoryRemote>, online: bool) -> BatchPipeline<MemoryBackend, MemoryRemote> {
        BatchPipeline::new(
            LocalStore::new(MemoryBackend::default()),
            remote.clone(),
            Connectivity::new(online),
            Tariff::default(),
            AnomalyPolicy::default(),
        )
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("auditor", datetime!(2025-01-05 09:00 UTC))
    }

    #[tokio::test]
    async fn bills_december_with_discount_from_remote() {
        let remote = Arc::new(MemoryRemote::default());
        remote.add_customer(customer("c-1", "RT-01"));
        seed(&remote, "c-1", 100.0, date!(2024 - 11 - 01));
        seed(&remote, "c-1", 115.0, date!(2024 - 12 - 01));
        remote.add_discount_row(DiscountRow {
            id: RemoteId(50),
            customer_id: CustomerId::from("c-1"),
            percentage: 10.0,
            fixed_amount: 0.0,
            reason: "senior".to_string(),
            month: date!(2024 - 12 - 01),
            active: true,
            created_by: "admin".to_string(),
            created_at: datetime!(2024-11-30 10:00 UTC),
            client_id: None,
        });

        let output = pipeline(&remote, true)
            .transform(&ctx(), &TransformFilter::month(BillingMonth::new(2024, 12).unwrap()))
            .await
            .unwrap();

        assert_eq!(output.metrics.source, DataSource::Remote);
        assert!(output.errors.is_empty());
        assert_eq!(output.records.len(), 1);
        let record = &output.records[0];
        assert_eq!(record.bill.usage, 15.0);
        assert_eq!(record.bill.total, 3_150);
        assert_eq!(record.previous.as_ref().map(|p| p.value), Some(100.0));
    }

    #[tokio::test]
    async fn invalid_records_are_collected_not_fatal() {
        let remote = Arc::new(MemoryRemote::default());
        remote.add_customer(customer("c-1", "RT-01"));
        remote.add_customer(customer("c-2", "RT-01"));
        seed(&remote, "c-1", 100.0, date!(2024 - 11 - 01));
        seed(&remote, "c-1", 90.0, date!(2024 - 12 - 01));
        seed(&remote, "c-2", 50.0, date!(2024 - 12 - 02));
        seed(&remote, "ghost", 10.0, date!(2024 - 12 - 02));

        let output = pipeline(&remote, true)
            .transform(&ctx(), &TransformFilter::month(BillingMonth::new(2024, 12).unwrap()))
            .await
            .unwrap();

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].customer_id, CustomerId::from("c-2"));
        // first reading: fee only
        assert_eq!(output.records[0].bill.total, 500);

        assert_eq!(output.errors.len(), 2);
        assert!(output
            .errors
            .iter()
            .any(|e| matches!(&e.error, PipelineError::Validation(r) if !r.is_ok())));
        assert!(output
            .errors
            .iter()
            .any(|e| matches!(&e.error, PipelineError::UnknownCustomer(id) if id.as_str() == "ghost")));
        assert_eq!(output.metrics.readings_in_scope, 3);
    }

    #[tokio::test]
    async fn offline_transform_reads_the_local_store() {
        let remote = Arc::new(MemoryRemote::default());
        let pipeline = pipeline(&remote, false);
        pipeline.store.put_customer(&customer("c-1", "RT-02")).await.unwrap();
        for (value, date) in [(100.0, date!(2024 - 11 - 01)), (112.0, date!(2024 - 12 - 01))] {
            pipeline
                .store
                .add_reading(
                    NewReading {
                        customer_id: CustomerId::from("c-1"),
                        value,
                        reading_date: date,
                    },
                    datetime!(2024-12-01 08:00 UTC),
                )
                .await
                .unwrap();
        }

        let output = pipeline
            .transform(&ctx(), &TransformFilter::default())
            .await
            .unwrap();
        assert_eq!(output.metrics.source, DataSource::Local);
        assert_eq!(output.records.len(), 2);
        assert_eq!(output.records[1].bill.total, 2_400);
    }

    #[tokio::test]
    async fn invalid_month_is_rejected() {
        let remote = Arc::new(MemoryRemote::default());
        let err = pipeline(&remote, true)
            .generate_monthly_report(&ctx(), 2024, 13)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMonth { year: 2024, month: 13 }));
    }
}
