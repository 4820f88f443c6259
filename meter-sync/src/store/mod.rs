//! Local durable store.
//!
//! Everything the device knows lives in five logical collections of JSON
//! documents behind the [`KvBackend`] trait. [`LocalStore`] layers the typed
//! reading/discount/queue operations on top. Writes that must happen
//! together (a record plus its queue entry) go through a single atomic
//! [`KvBackend::apply`].

pub mod memory;
pub mod models;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use meter_client::domain::{BillingMonth, Customer, CustomerId, NewDiscount, NewReading, RemoteReading};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use time::{Date, OffsetDateTime};

pub use memory::MemoryBackend;
pub use models::{
    LocalId, QueuedMutation, StoredDiscount, StoredReading, SyncPatch, SyncQueueEntry,
};
pub use sqlite::SqliteBackend;

const LAST_SYNC_KEY: &str = "last_sync";

/// Logical collections of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Customers,
    Readings,
    Discounts,
    SyncQueue,
    Meta,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Readings => "readings",
            Self::Discounts => "discounts",
            Self::SyncQueue => "sync_queue",
            Self::Meta => "meta",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KvWrite {
    Put {
        collection: Collection,
        key: String,
        value: String,
    },
    Delete {
        collection: Collection,
        key: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt document {collection}/{key}: {reason}")]
    Corrupt {
        collection: &'static str,
        key: String,
        reason: String,
    },
    #[error("{collection}/{key} not found")]
    NotFound {
        collection: &'static str,
        key: String,
    },
    #[error("internal store error: {0}")]
    Internal(String),
}

/// Raw key-value persistence.
///
/// Implementations must make every write durable before returning and must
/// list a collection in first-insertion order (overwriting a key keeps its
/// position).
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<String>, StoreError>;

    async fn list(&self, collection: Collection) -> Result<Vec<(String, String)>, StoreError>;

    /// Apply all writes or none of them.
    async fn apply(&self, writes: Vec<KvWrite>) -> Result<(), StoreError>;

    async fn put(&self, collection: Collection, key: &str, value: String) -> Result<(), StoreError> {
        self.apply(vec![KvWrite::Put {
            collection,
            key: key.to_string(),
            value,
        }])
        .await
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<(), StoreError> {
        self.apply(vec![KvWrite::Delete {
            collection,
            key: key.to_string(),
        }])
        .await
    }
}

/// On-disk wrapper: the serialized body plus its BLAKE3 digest.
#[derive(Serialize, Deserialize)]
struct Document {
    checksum: String,
    body: String,
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    let body = serde_json::to_string(value)?;
    let checksum = blake3::hash(body.as_bytes()).to_hex().to_string();
    Ok(serde_json::to_string(&Document { checksum, body })?)
}

fn decode<T: DeserializeOwned>(collection: Collection, key: &str, raw: &str) -> Result<T, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        collection: collection.as_str(),
        key: key.to_string(),
        reason,
    };

    let doc: Document = serde_json::from_str(raw).map_err(|e| corrupt(format!("bad envelope: {e}")))?;
    let actual = blake3::hash(doc.body.as_bytes()).to_hex();
    if actual.as_str() != doc.checksum {
        return Err(corrupt("checksum mismatch".to_string()));
    }

    serde_json::from_str(&doc.body).map_err(|e| corrupt(format!("bad body: {e}")))
}

fn put_write<T: Serialize>(collection: Collection, key: String, value: &T) -> Result<KvWrite, StoreError> {
    Ok(KvWrite::Put {
        collection,
        key,
        value: encode(value)?,
    })
}

/// Typed operations over a [`KvBackend`].
pub struct LocalStore<B> {
    backend: Arc<B>,
}

impl<B> Clone for LocalStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: KvBackend> LocalStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn load<T: DeserializeOwned>(&self, collection: Collection, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.get(collection, key).await? {
            Some(raw) => decode(collection, key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn load_all<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>, StoreError> {
        self.backend
            .list(collection)
            .await?
            .iter()
            .map(|(key, raw)| decode(collection, key, raw))
            .collect()
    }

    async fn save<T: Serialize>(&self, collection: Collection, key: &str, value: &T) -> Result<(), StoreError> {
        self.backend.put(collection, key, encode(value)?).await
    }

    // customers

    pub async fn put_customer(&self, customer: &Customer) -> Result<(), StoreError> {
        self.save(Collection::Customers, customer.id.as_str(), customer).await
    }

    pub async fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>, StoreError> {
        self.load(Collection::Customers, id.as_str()).await
    }

    pub async fn list_customers(&self) -> Result<Vec<Customer>, StoreError> {
        self.load_all(Collection::Customers).await
    }

    // readings

    /// Persist a new unsynced reading and its queue entry in one write.
    /// Returns the locally assigned id.
    pub async fn add_reading(&self, reading: NewReading, created_at: OffsetDateTime) -> Result<LocalId, StoreError> {
        let stored = StoredReading {
            id: LocalId::generate(),
            customer_id: reading.customer_id,
            value: reading.value,
            reading_date: reading.reading_date,
            created_at,
            synced: false,
            remote_id: None,
        };
        let entry = SyncQueueEntry {
            id: LocalId::generate(),
            mutation: QueuedMutation::Reading(stored.id),
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            enqueued_at: created_at,
        };

        self.backend
            .apply(vec![
                put_write(Collection::Readings, stored.id.to_string(), &stored)?,
                put_write(Collection::SyncQueue, entry.id.to_string(), &entry)?,
            ])
            .await?;

        tracing::debug!(reading_id = %stored.id, customer_id = %stored.customer_id, "reading stored and queued");
        Ok(stored.id)
    }

    pub async fn get_reading(&self, id: &LocalId) -> Result<Option<StoredReading>, StoreError> {
        self.load(Collection::Readings, &id.to_string()).await
    }

    pub async fn list_readings(&self) -> Result<Vec<StoredReading>, StoreError> {
        self.load_all(Collection::Readings).await
    }

    /// All readings of one customer, oldest first.
    pub async fn readings_for_customer(&self, customer_id: &CustomerId) -> Result<Vec<StoredReading>, StoreError> {
        let mut readings: Vec<StoredReading> = self
            .list_readings()
            .await?
            .into_iter()
            .filter(|r| &r.customer_id == customer_id)
            .collect();
        readings.sort_by_key(|r| r.reading_date);
        Ok(readings)
    }

    /// Most recent reading strictly before `before`, from local data only.
    pub async fn previous_reading(
        &self,
        customer_id: &CustomerId,
        before: Date,
    ) -> Result<Option<StoredReading>, StoreError> {
        Ok(self
            .readings_for_customer(customer_id)
            .await?
            .into_iter()
            .filter(|r| r.reading_date < before)
            .last())
    }

    pub async fn update_reading(&self, id: &LocalId, patch: SyncPatch) -> Result<StoredReading, StoreError> {
        let mut reading = self.get_reading(id).await?.ok_or_else(|| StoreError::NotFound {
            collection: Collection::Readings.as_str(),
            key: id.to_string(),
        })?;
        reading.synced = patch.synced;
        if patch.remote_id.is_some() {
            reading.remote_id = patch.remote_id;
        }
        self.save(Collection::Readings, &id.to_string(), &reading).await?;
        Ok(reading)
    }

    /// Merge a backend reading into the local snapshot. Returns `false` when
    /// a local record already carries that remote id.
    pub async fn import_remote_reading(
        &self,
        remote: &RemoteReading,
        imported_at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let known = self
            .list_readings()
            .await?
            .iter()
            .any(|r| r.remote_id == Some(remote.id));
        if known {
            return Ok(false);
        }

        let id = LocalId::from_client_id(remote.client_id.as_deref());
        if let Some(local) = self.get_reading(&id).await? {
            // The backend committed our own upload before we recorded it.
            if !local.synced {
                self.update_reading(&id, SyncPatch::acknowledged(remote.id)).await?;
            }
            return Ok(false);
        }

        let stored = StoredReading {
            id,
            customer_id: remote.customer_id.clone(),
            value: remote.value,
            reading_date: remote.reading_date,
            created_at: imported_at,
            synced: true,
            remote_id: Some(remote.id),
        };
        self.save(Collection::Readings, &stored.id.to_string(), &stored).await?;
        Ok(true)
    }

    // discounts

    pub async fn add_discount(&self, discount: NewDiscount) -> Result<LocalId, StoreError> {
        let stored = StoredDiscount {
            id: LocalId::generate(),
            customer_id: discount.customer_id,
            value: discount.value,
            reason: discount.reason,
            month: discount.month,
            active: discount.active,
            created_by: discount.created_by,
            created_at: discount.created_at,
            synced: false,
            remote_id: None,
        };
        let entry = SyncQueueEntry {
            id: LocalId::generate(),
            mutation: QueuedMutation::Discount(stored.id),
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            enqueued_at: stored.created_at,
        };

        self.backend
            .apply(vec![
                put_write(Collection::Discounts, stored.id.to_string(), &stored)?,
                put_write(Collection::SyncQueue, entry.id.to_string(), &entry)?,
            ])
            .await?;

        Ok(stored.id)
    }

    pub async fn get_discount(&self, id: &LocalId) -> Result<Option<StoredDiscount>, StoreError> {
        self.load(Collection::Discounts, &id.to_string()).await
    }

    pub async fn list_discounts(&self) -> Result<Vec<StoredDiscount>, StoreError> {
        self.load_all(Collection::Discounts).await
    }

    pub async fn update_discount(&self, id: &LocalId, patch: SyncPatch) -> Result<StoredDiscount, StoreError> {
        let mut discount = self.get_discount(id).await?.ok_or_else(|| StoreError::NotFound {
            collection: Collection::Discounts.as_str(),
            key: id.to_string(),
        })?;
        discount.synced = patch.synced;
        if patch.remote_id.is_some() {
            discount.remote_id = patch.remote_id;
        }
        self.save(Collection::Discounts, &id.to_string(), &discount).await?;
        Ok(discount)
    }

    /// Merge an already-validated backend discount into the local snapshot.
    pub async fn import_remote_discount(&self, discount: StoredDiscount) -> Result<bool, StoreError> {
        let Some(remote_id) = discount.remote_id else {
            return Err(StoreError::Internal(format!(
                "discount {} has no remote id",
                discount.id
            )));
        };
        let known = self
            .list_discounts()
            .await?
            .iter()
            .any(|d| d.remote_id == Some(remote_id));
        if known {
            return Ok(false);
        }
        if let Some(local) = self.get_discount(&discount.id).await? {
            if !local.synced {
                self.update_discount(&discount.id, SyncPatch::acknowledged(remote_id)).await?;
            }
            return Ok(false);
        }

        self.save(Collection::Discounts, &discount.id.to_string(), &discount).await?;
        Ok(true)
    }

    /// The active discount for a customer-month. When several are active the
    /// most recently created one wins.
    pub async fn active_discount(
        &self,
        customer_id: &CustomerId,
        month: BillingMonth,
    ) -> Result<Option<StoredDiscount>, StoreError> {
        Ok(self
            .list_discounts()
            .await?
            .into_iter()
            .filter(|d| d.active && d.month == month && &d.customer_id == customer_id)
            .max_by_key(|d| d.created_at))
    }

    // sync queue

    /// Queue entries in the order they were enqueued.
    pub async fn pending_queue(&self) -> Result<Vec<SyncQueueEntry>, StoreError> {
        self.load_all(Collection::SyncQueue).await
    }

    pub async fn record_attempt(
        &self,
        entry_id: &LocalId,
        at: OffsetDateTime,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let key = entry_id.to_string();
        let Some(mut entry) = self.load::<SyncQueueEntry>(Collection::SyncQueue, &key).await? else {
            return Ok(());
        };
        entry.attempts += 1;
        entry.last_attempt_at = Some(at);
        entry.last_error = error;
        self.save(Collection::SyncQueue, &key, &entry).await
    }

    pub async fn remove_queue_entry(&self, entry_id: &LocalId) -> Result<(), StoreError> {
        self.backend.delete(Collection::SyncQueue, &entry_id.to_string()).await
    }

    // meta

    pub async fn last_sync(&self) -> Result<Option<OffsetDateTime>, StoreError> {
        self.load(Collection::Meta, LAST_SYNC_KEY).await
    }

    pub async fn set_last_sync(&self, at: OffsetDateTime) -> Result<(), StoreError> {
        self.save(Collection::Meta, LAST_SYNC_KEY, &at).await
    }
}
