//! Outbox drain.
//!
//! Every locally created reading or discount has a queue entry. A sync cycle
//! walks the queue in insertion order and, for each entry:
//!
//! 1. re-reads the record before every attempt; if it is already `synced`
//!    the entry is dropped without transmitting;
//! 2. transmits it under its local id, retrying with [`RetryPolicy`] backoff;
//! 3. on success marks the record synced and stores the remote id, then
//!    deletes the entry;
//! 4. on failure records the attempt and leaves the entry for the next cycle.
//!
//! Step 3 writes the record before deleting the entry, so a crash in between
//! is resolved by step 1 on the next cycle. A crash or lost response between
//! the backend commit and step 3 is resolved by the backend: the local id is
//! unique there, and a repeated insert returns the row it already holds.

pub mod connectivity;
pub mod retry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meter_client::db::ReadingFilter;
use meter_client::domain::{NewDiscount, NewReading, RemoteId};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::remote::{RemoteBackend, RemoteError};
use crate::store::{
    KvBackend, LocalId, LocalStore, QueuedMutation, StoreError, StoredDiscount, SyncPatch, SyncQueueEntry,
};
use crate::validation::discount_value_from_columns;

pub use connectivity::{spawn_probe, Connectivity};
pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("remote backend is offline")]
    Offline,
}

/// A queue entry that is still pending after this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedEntry {
    pub entry_id: LocalId,
    pub mutation: QueuedMutation,
    pub attempts: u32,
    pub error: RemoteErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Unreachable,
    Rejected,
    Decode,
}

impl From<&RemoteError> for RemoteErrorKind {
    fn from(e: &RemoteError) -> Self {
        match e {
            RemoteError::Unreachable(_) => Self::Unreachable,
            RemoteError::Rejected(_) => Self::Rejected,
            RemoteError::Decode(_) => Self::Decode,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Entries transmitted and acknowledged in this cycle.
    pub transmitted: usize,
    /// Entries whose record was already synced; dropped without a transmit.
    pub skipped: usize,
    pub failed: Vec<FailedEntry>,
    /// Queue length when the cycle ended, including entries enqueued while it ran.
    pub remaining: usize,
    pub elapsed_ms: u128,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle holds the single-flight flag; nothing was done.
    AlreadyRunning,
    /// Connectivity reports offline; nothing was attempted.
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub pending: usize,
    pub in_progress: bool,
    pub last_sync: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotReport {
    pub customers: usize,
    pub readings_imported: usize,
    pub discounts_imported: usize,
    /// Backend discount rows that violate the one-column rule.
    pub discounts_skipped: usize,
}

enum Outbound {
    Reading(NewReading),
    Discount(NewDiscount),
}

enum EntryResult {
    Transmitted,
    AlreadySynced,
    Failed(FailedEntry),
}

/// Clears the single-flight flag when a cycle ends, including on error.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncCoordinator<B, R> {
    store: LocalStore<B>,
    remote: Arc<R>,
    policy: RetryPolicy,
    connectivity: Connectivity,
    in_progress: AtomicBool,
}

impl<B: KvBackend, R: RemoteBackend> SyncCoordinator<B, R> {
    pub fn new(store: LocalStore<B>, remote: Arc<R>, policy: RetryPolicy, connectivity: Connectivity) -> Self {
        Self {
            store,
            remote,
            policy,
            connectivity,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn store(&self) -> &LocalStore<B> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Run one sync cycle.
    pub async fn sync(&self, ctx: &ExecutionContext) -> Result<SyncOutcome, SyncError> {
        if !self.connectivity.is_online() {
            tracing::debug!("sync skipped, offline");
            return Ok(SyncOutcome::Offline);
        }
        let Some(_guard) = InFlight::acquire(&self.in_progress) else {
            tracing::debug!("sync already running");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let started = Instant::now();
        let entries = self.store.pending_queue().await?;
        tracing::info!(pending = entries.len(), actor = %ctx.actor, "sync cycle started");

        let mut report = SyncReport::default();
        for entry in entries {
            match self.process_entry(ctx, &entry).await? {
                EntryResult::Transmitted => report.transmitted += 1,
                EntryResult::AlreadySynced => report.skipped += 1,
                EntryResult::Failed(failed) => report.failed.push(failed),
            }
        }

        if report.is_clean() {
            self.store.set_last_sync(ctx.now).await?;
        }

        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis();
        metrics::histogram!("sync_cycle_duration_seconds").record(elapsed.as_secs_f64());
        report.remaining = self.store.pending_queue().await?.len();
        metrics::gauge!("sync_queue_pending").set(report.remaining as f64);

        tracing::info!(
            transmitted = report.transmitted,
            skipped = report.skipped,
            failed = report.failed.len(),
            remaining = report.remaining,
            elapsed_ms = report.elapsed_ms as u64,
            "sync cycle finished"
        );
        Ok(SyncOutcome::Completed(report))
    }

    async fn process_entry(&self, ctx: &ExecutionContext, entry: &SyncQueueEntry) -> Result<EntryResult, SyncError> {
        let mut attempts = entry.attempts;
        let mut last_error = None;

        for attempt in 1..=self.policy.attempts() {
            if attempt > 1 {
                metrics::counter!("sync_retry_total").increment(1);
                tokio::time::sleep(self.policy.delay_for(attempt - 1)).await;
            }

            let Some(outbound) = self.outbound_for(entry).await? else {
                self.store.remove_queue_entry(&entry.id).await?;
                metrics::counter!("sync_skipped_total").increment(1);
                tracing::debug!(entry_id = %entry.id, mutation = %entry.mutation, "already synced, dropping queue entry");
                return Ok(EntryResult::AlreadySynced);
            };

            match self.transmit(entry.mutation, &outbound).await {
                Ok(remote_id) => {
                    self.acknowledge(entry.mutation, remote_id).await?;
                    self.store.remove_queue_entry(&entry.id).await?;
                    metrics::counter!("sync_transmitted_total").increment(1);
                    tracing::debug!(entry_id = %entry.id, mutation = %entry.mutation, %remote_id, "mutation acknowledged");
                    return Ok(EntryResult::Transmitted);
                }
                Err(e) => {
                    attempts += 1;
                    self.store
                        .record_attempt(&entry.id, ctx.now, Some(e.to_string()))
                        .await?;
                    tracing::warn!(
                        entry_id = %entry.id,
                        mutation = %entry.mutation,
                        attempt,
                        error = %e,
                        "transmission failed"
                    );
                    let rejected = matches!(e, RemoteError::Rejected(_));
                    last_error = Some(e);
                    // The backend will refuse the same payload again this cycle.
                    if rejected {
                        break;
                    }
                }
            }
        }

        metrics::counter!("sync_failed_total").increment(1);
        let error = last_error.unwrap_or_else(|| RemoteError::Unreachable("no attempt made".to_string()));
        tracing::error!(entry_id = %entry.id, mutation = %entry.mutation, attempts, error = %error, "giving up until next cycle");

        Ok(EntryResult::Failed(FailedEntry {
            entry_id: entry.id,
            mutation: entry.mutation,
            attempts,
            error: RemoteErrorKind::from(&error),
            message: error.to_string(),
        }))
    }

    /// `None` when the record is already synced. A queue entry pointing at
    /// a missing record means the store is damaged.
    async fn outbound_for(&self, entry: &SyncQueueEntry) -> Result<Option<Outbound>, StoreError> {
        let missing = |id: &LocalId| StoreError::Corrupt {
            collection: "sync_queue",
            key: entry.id.to_string(),
            reason: format!("queued {} refers to missing record {id}", entry.mutation),
        };

        match entry.mutation {
            QueuedMutation::Reading(id) => {
                let reading = self.store.get_reading(&id).await?.ok_or_else(|| missing(&id))?;
                Ok((!reading.synced).then(|| Outbound::Reading(reading.to_new_reading())))
            }
            QueuedMutation::Discount(id) => {
                let discount = self.store.get_discount(&id).await?.ok_or_else(|| missing(&id))?;
                Ok((!discount.synced).then(|| Outbound::Discount(discount.to_new_discount())))
            }
        }
    }

    async fn transmit(&self, mutation: QueuedMutation, outbound: &Outbound) -> Result<RemoteId, RemoteError> {
        let client_id = mutation.local_id().to_string();
        match outbound {
            Outbound::Reading(r) => self.remote.insert_reading(&client_id, r).await,
            Outbound::Discount(d) => self.remote.insert_discount(&client_id, d).await,
        }
    }

    async fn acknowledge(&self, mutation: QueuedMutation, remote_id: RemoteId) -> Result<(), StoreError> {
        let patch = SyncPatch::acknowledged(remote_id);
        match mutation {
            QueuedMutation::Reading(id) => self.store.update_reading(&id, patch).await.map(|_| ()),
            QueuedMutation::Discount(id) => self.store.update_discount(&id, patch).await.map(|_| ()),
        }
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            online: self.connectivity.is_online(),
            pending: self.store.pending_queue().await?.len(),
            in_progress: self.in_progress.load(Ordering::Acquire),
            last_sync: self.store.last_sync().await?,
        })
    }

    /// Pull customers, readings and discounts from the backend into the
    /// local store so validation and billing keep working offline.
    pub async fn refresh_snapshots(&self, ctx: &ExecutionContext) -> Result<SnapshotReport, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }

        let mut report = SnapshotReport::default();

        for customer in self.remote.fetch_customers().await? {
            self.store.put_customer(&customer).await?;
            report.customers += 1;
        }

        for reading in self.remote.fetch_readings(&ReadingFilter::default()).await? {
            if self.store.import_remote_reading(&reading, ctx.now).await? {
                report.readings_imported += 1;
            }
        }

        for row in self.remote.fetch_discounts(None).await? {
            let value = match discount_value_from_columns(row.percentage, row.fixed_amount) {
                Ok(value) => value,
                Err(issues) => {
                    tracing::warn!(remote_id = %row.id, customer_id = %row.customer_id, %issues, "skipping invalid backend discount");
                    report.discounts_skipped += 1;
                    continue;
                }
            };
            let stored = StoredDiscount {
                id: LocalId::from_client_id(row.client_id.as_deref()),
                customer_id: row.customer_id.clone(),
                value,
                reason: row.reason.clone(),
                month: row.billing_month(),
                active: row.active,
                created_by: row.created_by.clone(),
                created_at: row.created_at,
                synced: true,
                remote_id: Some(row.id),
            };
            if self.store.import_remote_discount(stored).await? {
                report.discounts_imported += 1;
            }
        }

        tracing::info!(
            customers = report.customers,
            readings = report.readings_imported,
            discounts = report.discounts_imported,
            skipped = report.discounts_skipped,
            "snapshots refreshed"
        );
        Ok(report)
    }

    async fn run_cycle(&self, reason: &'static str) {
        let ctx = ExecutionContext::system();
        match self.sync(&ctx).await {
            Ok(SyncOutcome::Completed(report)) if !report.is_clean() => {
                tracing::warn!(reason, failed = report.failed.len(), "sync cycle left entries pending");
            }
            Ok(outcome) => tracing::debug!(reason, ?outcome, "sync cycle done"),
            Err(e) => tracing::error!(reason, error = %e, "sync cycle aborted"),
        }
    }

    /// Sync every `every` and immediately whenever connectivity comes back.
    /// Cancellation is observed between cycles only.
    pub fn start_auto_sync(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut online = self.connectivity.subscribe();
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let reason = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => "interval",
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online.borrow_and_update() {
                            continue;
                        }
                        "reconnected"
                    }
                };
                self.run_cycle(reason).await;
            }
            tracing::info!("auto sync stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::store::MemoryBackend;
    use meter_client::domain::CustomerId;
    use time::macros::{date, datetime};

    fn coordinator(remote: &Arc<MemoryRemote>) -> SyncCoordinator<MemoryBackend, MemoryRemote> {
        SyncCoordinator::new(
            LocalStore::new(MemoryBackend::default()),
            remote.clone(),
            RetryPolicy::immediate(2),
            Connectivity::new(true),
        )
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("agent-7", datetime!(2024-12-02 09:00 UTC))
    }

    async fn queue_reading(
        coordinator: &SyncCoordinator<MemoryBackend, MemoryRemote>,
        customer: &str,
        value: f64,
        date: time::Date,
    ) -> LocalId {
        coordinator
            .store()
            .add_reading(
                NewReading {
                    customer_id: CustomerId::from(customer),
                    value,
                    reading_date: date,
                },
                datetime!(2024-12-01 08:00 UTC),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn offline_sync_does_nothing() {
        let remote = Arc::new(MemoryRemote::default());
        let coordinator = coordinator(&remote);
        queue_reading(&coordinator, "c-1", 10.0, date!(2024 - 12 - 01)).await;
        coordinator.connectivity().set_online(false);

        let outcome = coordinator.sync(&ctx()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Offline);
        assert_eq!(remote.insert_attempts(), 0);
        assert_eq!(coordinator.status().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn rejected_entries_are_not_retried_within_a_cycle() {
        let remote = Arc::new(MemoryRemote::default());
        remote.seed_reading(NewReading {
            customer_id: CustomerId::from("c-1"),
            value: 5.0,
            reading_date: date!(2024 - 12 - 01),
        });
        let coordinator = coordinator(&remote);
        queue_reading(&coordinator, "c-1", 10.0, date!(2024 - 12 - 15)).await;

        let SyncOutcome::Completed(report) = coordinator.sync(&ctx()).await.unwrap() else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].error, RemoteErrorKind::Rejected);
        assert_eq!(report.failed[0].attempts, 1);
        assert_eq!(remote.insert_attempts(), 1);

        let status = coordinator.status().await.unwrap();
        assert_eq!(status.pending, 1);
        assert_eq!(status.last_sync, None);
    }

    #[tokio::test]
    async fn queue_entry_without_record_is_fatal() {
        let remote = Arc::new(MemoryRemote::default());
        let coordinator = coordinator(&remote);
        let id = queue_reading(&coordinator, "c-1", 10.0, date!(2024 - 12 - 01)).await;
        coordinator
            .store()
            .backend()
            .delete(crate::store::Collection::Readings, &id.to_string())
            .await
            .unwrap();

        let err = coordinator.sync(&ctx()).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Corrupt { .. })));
        assert!(!coordinator.status().await.unwrap().in_progress);
    }

    #[tokio::test]
    async fn refresh_imports_valid_rows_and_skips_bad_discounts() {
        use meter_client::domain::{Customer, DiscountRow};

        let remote = Arc::new(MemoryRemote::default());
        remote.add_customer(Customer {
            id: CustomerId::from("c-1"),
            name: "Sari".to_string(),
            rt: "RT-01".to_string(),
            phone: None,
        });
        remote.seed_reading(NewReading {
            customer_id: CustomerId::from("c-1"),
            value: 100.0,
            reading_date: date!(2024 - 11 - 01),
        });
        let row = DiscountRow {
            id: RemoteId(90),
            customer_id: CustomerId::from("c-1"),
            percentage: 10.0,
            fixed_amount: 0.0,
            reason: "senior".to_string(),
            month: date!(2024 - 12 - 01),
            active: true,
            created_by: "admin".to_string(),
            created_at: datetime!(2024-11-28 10:00 UTC),
            client_id: None,
        };
        remote.add_discount_row(row.clone());
        remote.add_discount_row(DiscountRow {
            id: RemoteId(91),
            fixed_amount: 250.0,
            ..row
        });

        let coordinator = coordinator(&remote);
        let report = coordinator.refresh_snapshots(&ctx()).await.unwrap();
        assert_eq!(
            report,
            SnapshotReport {
                customers: 1,
                readings_imported: 1,
                discounts_imported: 1,
                discounts_skipped: 1,
            }
        );

        let again = coordinator.refresh_snapshots(&ctx()).await.unwrap();
        assert_eq!(again.readings_imported, 0);
        assert_eq!(again.discounts_imported, 0);
        assert!(coordinator.store().pending_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_sync_runs_on_reconnect() {
        let remote = Arc::new(MemoryRemote::default());
        let coordinator = Arc::new(coordinator(&remote));
        coordinator.connectivity().set_online(false);
        queue_reading(&coordinator, "c-1", 10.0, date!(2024 - 12 - 01)).await;

        let cancel = CancellationToken::new();
        let handle = coordinator
            .clone()
            .start_auto_sync(Duration::from_secs(3600), cancel.clone());

        coordinator.connectivity().set_online(true);
        for _ in 0..200 {
            if remote.readings().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(remote.readings().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
