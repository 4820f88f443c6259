use std::fmt;

use time::Date;

use super::CustomerId;

/// Backend-assigned row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[sqlx(transparent)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct RemoteId(pub i64);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A reading row from the backend `readings` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RemoteReading {
    pub id: RemoteId,
    pub customer_id: CustomerId,
    pub value: f64,
    pub reading_date: Date,
    /// Device-side id the row was inserted under, if it came from a device.
    pub client_id: Option<String>,
}

/// Insert payload for the `readings` table.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewReading {
    pub customer_id: CustomerId,
    pub value: f64,
    pub reading_date: Date,
}
