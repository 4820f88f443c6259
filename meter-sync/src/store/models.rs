use std::{fmt, str::FromStr};

use meter_client::domain::{
    BillingMonth, CustomerId, DiscountValue, NewDiscount, NewReading, RemoteId,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

/// Device-local identifier, assigned when a record is created offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub Ulid);

impl LocalId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Backend rows written by a device carry that device's id; others get
    /// a fresh one.
    pub fn from_client_id(client_id: Option<&str>) -> Self {
        client_id
            .and_then(|c| c.parse().ok())
            .unwrap_or_else(Self::generate)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// A reading held on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReading {
    pub id: LocalId,
    pub customer_id: CustomerId,
    pub value: f64,
    pub reading_date: Date,
    pub created_at: OffsetDateTime,
    pub synced: bool,
    pub remote_id: Option<RemoteId>,
}

impl StoredReading {
    pub fn to_new_reading(&self) -> NewReading {
        NewReading {
            customer_id: self.customer_id.clone(),
            value: self.value,
            reading_date: self.reading_date,
        }
    }
}

/// A discount held on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDiscount {
    pub id: LocalId,
    pub customer_id: CustomerId,
    pub value: DiscountValue,
    pub reason: String,
    pub month: BillingMonth,
    pub active: bool,
    pub created_by: String,
    pub created_at: OffsetDateTime,
    pub synced: bool,
    pub remote_id: Option<RemoteId>,
}

impl StoredDiscount {
    pub fn to_new_discount(&self) -> NewDiscount {
        NewDiscount {
            customer_id: self.customer_id.clone(),
            value: self.value,
            reason: self.reason.clone(),
            month: self.month,
            active: self.active,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
        }
    }
}

/// The local record a queue entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum QueuedMutation {
    Reading(LocalId),
    Discount(LocalId),
}

impl QueuedMutation {
    pub fn local_id(&self) -> LocalId {
        match self {
            Self::Reading(id) | Self::Discount(id) => *id,
        }
    }
}

impl fmt::Display for QueuedMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reading(id) => write!(f, "reading {id}"),
            Self::Discount(id) => write!(f, "discount {id}"),
        }
    }
}

/// A pending upload. Removed once the backend acknowledges the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub id: LocalId,
    pub mutation: QueuedMutation,
    pub attempts: u32,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub enqueued_at: OffsetDateTime,
}

/// The only mutation the sync coordinator applies to a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPatch {
    pub synced: bool,
    pub remote_id: Option<RemoteId>,
}

impl SyncPatch {
    pub fn acknowledged(remote_id: RemoteId) -> Self {
        Self {
            synced: true,
            remote_id: Some(remote_id),
        }
    }
}
