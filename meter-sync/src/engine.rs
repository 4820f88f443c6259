//! Entry point for agents and administrators.
//!
//! Every reading goes through [`MeterEngine::submit_reading`]: customer
//! lookup, validation against local and (when reachable) remote history, a
//! bill preview, then an atomic write of the record and its queue entry.
//! Bulk import uses the same path row by row.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use meter_client::db::ReadingFilter;
use meter_client::domain::{BillingMonth, CustomerId, DiscountValue, NewDiscount, NewReading};
use serde::Serialize;
use thiserror::Error;
use time::Date;

use crate::billing::{calculate_billing, calculate_usage, BillingResult, Tariff};
use crate::context::ExecutionContext;
use crate::pipeline::{BatchPipeline, Envelope, PipelineError};
use crate::remote::RemoteBackend;
use crate::sources::ImportRow;
use crate::store::{KvBackend, LocalId, LocalStore, StoreError};
use crate::sync::{SyncCoordinator, SyncError, SyncOutcome, SyncStatus};
use crate::validation::{
    merge_history, parse_reading_value, previous_in_history, validate_discount, validate_reading, AnomalyPolicy,
    DiscountDraft, HistoricalReading, ReadingContext, ValidationReport,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown customer {0}")]
    UnknownCustomer(CustomerId),
    #[error("rejected: {0}")]
    Rejected(ValidationReport),
    #[error("needs confirmation: {0}")]
    Unconfirmed(ValidationReport),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Import(#[from] PipelineError),
}

/// Outcome of validating a reading without persisting it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingCheck {
    /// Parsed gauge value; `None` when the input is not a number.
    pub value: Option<f64>,
    pub report: ValidationReport,
    /// Present only when the reading has no blocking errors.
    pub bill: Option<BillingResult>,
}

/// A reading accepted into the local store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub id: LocalId,
    /// Warnings the caller acknowledged, if any.
    pub report: ValidationReport,
    pub bill: BillingResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub customer_id: Option<CustomerId>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub accepted: Vec<LocalId>,
    /// Accepted rows that carried acknowledged warnings.
    pub accepted_with_warnings: usize,
    pub rejected: Vec<RejectedRow>,
}

pub struct MeterEngine<B, R> {
    sync: Arc<SyncCoordinator<B, R>>,
    tariff: Tariff,
    anomaly: AnomalyPolicy,
}

impl<B: KvBackend, R: RemoteBackend> MeterEngine<B, R> {
    pub fn new(sync: Arc<SyncCoordinator<B, R>>) -> Self {
        Self {
            sync,
            tariff: Tariff::default(),
            anomaly: AnomalyPolicy::default(),
        }
    }

    pub fn with_tariff(mut self, tariff: Tariff) -> Self {
        self.tariff = tariff;
        self
    }

    pub fn with_anomaly_policy(mut self, anomaly: AnomalyPolicy) -> Self {
        self.anomaly = anomaly;
        self
    }

    pub fn store(&self) -> &LocalStore<B> {
        self.sync.store()
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator<B, R>> {
        &self.sync
    }

    pub fn tariff(&self) -> &Tariff {
        &self.tariff
    }

    pub fn pipeline(&self) -> BatchPipeline<B, R> {
        BatchPipeline::new(
            self.sync.store().clone(),
            Arc::clone(self.sync.remote()),
            self.sync.connectivity().clone(),
            self.tariff.clone(),
            self.anomaly,
        )
    }

    pub async fn sync(&self, ctx: &ExecutionContext) -> Result<SyncOutcome, SyncError> {
        self.sync.sync(ctx).await
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        self.sync.status().await
    }

    async fn require_customer(&self, customer_id: &CustomerId) -> Result<(), EngineError> {
        match self.store().get_customer(customer_id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownCustomer(customer_id.clone())),
        }
    }

    /// Local readings, plus backend readings when the backend answers.
    async fn history(&self, customer_id: &CustomerId) -> Result<Vec<HistoricalReading>, EngineError> {
        let local = self.store().readings_for_customer(customer_id).await?;

        let remote = if self.sync.connectivity().is_online() {
            let filter = ReadingFilter {
                customer_id: Some(customer_id.clone()),
                ..ReadingFilter::default()
            };
            match self.sync.remote().fetch_readings(&filter).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(%customer_id, error = %e, "remote history unavailable, validating against local data");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(merge_history(&local, &remote))
    }

    async fn discount_for(&self, customer_id: &CustomerId, date: Date) -> Result<Option<DiscountValue>, EngineError> {
        Ok(self
            .store()
            .active_discount(customer_id, BillingMonth::from_date(date))
            .await?
            .map(|d| d.value))
    }

    /// Bill for `usage` in the month of `date`, with that month's active
    /// discount applied.
    pub async fn preview_bill(
        &self,
        customer_id: &CustomerId,
        usage: f64,
        date: Date,
    ) -> Result<BillingResult, EngineError> {
        let discount = self.discount_for(customer_id, date).await?;
        Ok(calculate_billing(usage, &self.tariff, discount.as_ref()))
    }

    /// Validate a reading and preview its bill. Nothing is written.
    pub async fn check_reading(
        &self,
        ctx: &ExecutionContext,
        customer_id: &CustomerId,
        raw_value: &str,
        date: Date,
    ) -> Result<ReadingCheck, EngineError> {
        self.require_customer(customer_id).await?;

        let value = match parse_reading_value(raw_value) {
            Ok(v) => v,
            Err(issue) => {
                return Ok(ReadingCheck {
                    value: None,
                    report: ValidationReport {
                        errors: vec![issue],
                        warnings: Vec::new(),
                    },
                    bill: None,
                })
            }
        };

        let history = self.history(customer_id).await?;
        let previous = previous_in_history(&history, date);
        let report = validate_reading(
            value,
            &ReadingContext {
                customer_id,
                date,
                today: ctx.today(),
                history: &history,
                previous,
                anomaly: self.anomaly,
            },
        );

        let bill = if report.is_ok() {
            let usage = previous.map_or(0.0, |p| calculate_usage(value, p.value));
            Some(self.preview_bill(customer_id, usage, date).await?)
        } else {
            None
        };

        Ok(ReadingCheck {
            value: Some(value),
            report,
            bill,
        })
    }

    /// Validate and persist a reading. Warnings block the write unless
    /// `acknowledge_warnings` is set.
    pub async fn submit_reading(
        &self,
        ctx: &ExecutionContext,
        customer_id: &CustomerId,
        raw_value: &str,
        date: Date,
        acknowledge_warnings: bool,
    ) -> Result<Submission, EngineError> {
        let check = self.check_reading(ctx, customer_id, raw_value, date).await?;

        if !check.report.is_ok() {
            metrics::counter!("validation_reading_rejected_total").increment(1);
            tracing::info!(%customer_id, %date, issues = %check.report, "reading rejected");
            return Err(EngineError::Rejected(check.report));
        }
        if check.report.has_warnings() {
            metrics::counter!("validation_anomaly_warnings_total").increment(1);
            if !acknowledge_warnings {
                return Err(EngineError::Unconfirmed(check.report));
            }
            tracing::info!(%customer_id, %date, actor = %ctx.actor, warnings = %check.report, "warnings acknowledged");
        }

        let (Some(value), Some(bill)) = (check.value, check.bill) else {
            return Err(EngineError::Rejected(check.report));
        };

        let id = self
            .store()
            .add_reading(
                NewReading {
                    customer_id: customer_id.clone(),
                    value,
                    reading_date: date,
                },
                ctx.now,
            )
            .await?;

        metrics::counter!("readings_submitted_total").increment(1);
        tracing::info!(reading_id = %id, %customer_id, %date, total = bill.total, actor = %ctx.actor, "reading accepted");

        Ok(Submission {
            id,
            report: check.report,
            bill,
        })
    }

    /// Validate and persist a discount created by `ctx.actor`.
    pub async fn submit_discount(&self, ctx: &ExecutionContext, draft: DiscountDraft) -> Result<LocalId, EngineError> {
        self.require_customer(&draft.customer_id).await?;
        let value = validate_discount(&draft).map_err(EngineError::Rejected)?;

        let id = self
            .store()
            .add_discount(NewDiscount {
                customer_id: draft.customer_id,
                value,
                reason: draft.reason,
                month: draft.month,
                active: draft.active,
                created_by: ctx.actor.clone(),
                created_at: ctx.now,
            })
            .await?;

        tracing::info!(discount_id = %id, actor = %ctx.actor, "discount stored");
        Ok(id)
    }

    /// Submit every row of an import stream. Row failures are collected;
    /// only store and I/O failures abort.
    pub async fn import_readings<S>(
        &self,
        ctx: &ExecutionContext,
        mut rows: S,
        acknowledge_warnings: bool,
    ) -> Result<ImportSummary, EngineError>
    where
        S: Stream<Item = Result<Envelope<ImportRow>, PipelineError>> + Unpin,
    {
        let mut summary = ImportSummary::default();

        while let Some(item) = rows.next().await {
            let row = match item {
                Ok(env) => env.payload,
                Err(PipelineError::InvalidRow { line, reason }) => {
                    summary.rejected.push(RejectedRow {
                        line,
                        customer_id: None,
                        reason,
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self
                .submit_reading(ctx, &row.customer_id, &row.raw_value, row.reading_date, acknowledge_warnings)
                .await
            {
                Ok(submission) => {
                    if submission.report.has_warnings() {
                        summary.accepted_with_warnings += 1;
                    }
                    summary.accepted.push(submission.id);
                }
                Err(e @ (EngineError::UnknownCustomer(_) | EngineError::Rejected(_) | EngineError::Unconfirmed(_))) => {
                    summary.rejected.push(RejectedRow {
                        line: row.line,
                        customer_id: Some(row.customer_id),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            accepted = summary.accepted.len(),
            rejected = summary.rejected.len(),
            "import finished"
        );
        Ok(summary)
    }
}
