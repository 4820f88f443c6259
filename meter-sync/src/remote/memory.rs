use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meter_client::db::ReadingFilter;
use meter_client::domain::{
    BillingMonth, Customer, CustomerId, DiscountRow, NewDiscount, NewReading, RemoteId, RemoteReading,
};

use crate::remote::{RemoteBackend, RemoteError};

struct RemoteState {
    next_id: i64,
    reachable: bool,
    latency: Option<Duration>,
    fail_next_inserts: u32,
    failing_customers: Vec<CustomerId>,
    insert_attempts: u64,
    customers: Vec<Customer>,
    readings: Vec<RemoteReading>,
    discounts: Vec<DiscountRow>,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            next_id: 1,
            reachable: true,
            latency: None,
            fail_next_inserts: 0,
            failing_customers: Vec::new(),
            insert_attempts: 0,
            customers: Vec::new(),
            readings: Vec::new(),
            discounts: Vec::new(),
        }
    }
}

/// In memory backend with the same per-month and `client_id` uniqueness as
/// the SQL schema, plus knobs to simulate outages.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RemoteState>, RemoteError> {
        self.state
            .lock()
            .map_err(|_| RemoteError::Unreachable("memory remote mutex poisoned".into()))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RemoteState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn add_customer(&self, customer: Customer) {
        self.with_state(|s| s.customers.push(customer));
    }

    pub fn add_discount_row(&self, row: DiscountRow) {
        self.with_state(|s| s.discounts.push(row));
    }

    /// Seed a reading directly, bypassing failure injection.
    pub fn seed_reading(&self, reading: NewReading) -> RemoteId {
        self.with_state(|s| {
            let id = RemoteId(s.next_id);
            s.next_id += 1;
            s.readings.push(RemoteReading {
                id,
                customer_id: reading.customer_id,
                value: reading.value,
                reading_date: reading.reading_date,
                client_id: None,
            });
            id
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.with_state(|s| s.reachable = reachable);
    }

    /// Delay every call, so tests can overlap two sync runs.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.with_state(|s| s.latency = latency);
    }

    /// The next `n` insert calls fail as if the network dropped.
    pub fn fail_next_inserts(&self, n: u32) {
        self.with_state(|s| s.fail_next_inserts = n);
    }

    /// Every insert for this customer times out until cleared.
    pub fn fail_customer(&self, customer_id: CustomerId) {
        self.with_state(|s| s.failing_customers.push(customer_id));
    }

    pub fn clear_failures(&self) {
        self.with_state(|s| {
            s.fail_next_inserts = 0;
            s.failing_customers.clear();
        });
    }

    pub fn readings(&self) -> Vec<RemoteReading> {
        self.with_state(|s| s.readings.clone())
    }

    pub fn discounts(&self) -> Vec<DiscountRow> {
        self.with_state(|s| s.discounts.clone())
    }

    /// Number of insert calls received, successful or not.
    pub fn insert_attempts(&self) -> u64 {
        self.with_state(|s| s.insert_attempts)
    }

    async fn simulate_network(&self) -> Result<(), RemoteError> {
        let (reachable, latency) = {
            let state = self.lock()?;
            (state.reachable, state.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if reachable {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("connection refused".into()))
        }
    }

    fn check_insert(state: &mut RemoteState, customer_id: &CustomerId) -> Result<(), RemoteError> {
        state.insert_attempts += 1;
        if state.fail_next_inserts > 0 {
            state.fail_next_inserts -= 1;
            return Err(RemoteError::Unreachable("connection reset by peer".into()));
        }
        if state.failing_customers.contains(customer_id) {
            return Err(RemoteError::Unreachable(format!("timeout inserting for {customer_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn ping(&self) -> Result<(), RemoteError> {
        self.simulate_network().await
    }

    async fn insert_reading(&self, client_id: &str, reading: &NewReading) -> Result<RemoteId, RemoteError> {
        self.simulate_network().await?;
        let mut state = self.lock()?;
        Self::check_insert(&mut state, &reading.customer_id)?;

        if let Some(existing) = state
            .readings
            .iter()
            .find(|r| r.client_id.as_deref() == Some(client_id))
        {
            return Ok(existing.id);
        }

        let month = BillingMonth::from_date(reading.reading_date);
        let duplicate = state
            .readings
            .iter()
            .any(|r| r.customer_id == reading.customer_id && month.contains(r.reading_date));
        if duplicate {
            return Err(RemoteError::Rejected(format!(
                "duplicate key value violates unique constraint readings_customer_month_uq ({}, {month})",
                reading.customer_id
            )));
        }

        let id = RemoteId(state.next_id);
        state.next_id += 1;
        state.readings.push(RemoteReading {
            id,
            customer_id: reading.customer_id.clone(),
            value: reading.value,
            reading_date: reading.reading_date,
            client_id: Some(client_id.to_string()),
        });
        Ok(id)
    }

    async fn insert_discount(&self, client_id: &str, discount: &NewDiscount) -> Result<RemoteId, RemoteError> {
        self.simulate_network().await?;
        let mut state = self.lock()?;
        Self::check_insert(&mut state, &discount.customer_id)?;

        if let Some(existing) = state
            .discounts
            .iter()
            .find(|d| d.client_id.as_deref() == Some(client_id))
        {
            return Ok(existing.id);
        }

        let id = RemoteId(state.next_id);
        state.next_id += 1;
        state.discounts.push(DiscountRow {
            id,
            customer_id: discount.customer_id.clone(),
            percentage: discount.value.percentage(),
            fixed_amount: discount.value.fixed_amount(),
            reason: discount.reason.clone(),
            month: discount.month.first_day(),
            active: discount.active,
            created_by: discount.created_by.clone(),
            created_at: discount.created_at,
            client_id: Some(client_id.to_string()),
        });
        Ok(id)
    }

    async fn fetch_customers(&self) -> Result<Vec<Customer>, RemoteError> {
        self.simulate_network().await?;
        Ok(self.lock()?.customers.clone())
    }

    async fn fetch_readings(&self, filter: &ReadingFilter) -> Result<Vec<RemoteReading>, RemoteError> {
        self.simulate_network().await?;
        let state = self.lock()?;
        let mut rows: Vec<RemoteReading> = state
            .readings
            .iter()
            .filter(|r| filter.customer_id.as_ref().map_or(true, |c| &r.customer_id == c))
            .filter(|r| filter.from.map_or(true, |from| r.reading_date >= from))
            .filter(|r| filter.until.map_or(true, |until| r.reading_date < until))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.customer_id
                .cmp(&b.customer_id)
                .then(a.reading_date.cmp(&b.reading_date))
        });
        Ok(rows)
    }

    async fn fetch_discounts(&self, customer_id: Option<&CustomerId>) -> Result<Vec<DiscountRow>, RemoteError> {
        self.simulate_network().await?;
        let state = self.lock()?;
        Ok(state
            .discounts
            .iter()
            .filter(|d| customer_id.map_or(true, |c| &d.customer_id == c))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn new_reading(customer: &str, value: f64, reading_date: time::Date) -> NewReading {
        NewReading {
            customer_id: CustomerId::from(customer),
            value,
            reading_date,
        }
    }

    #[tokio::test]
    async fn enforces_one_reading_per_customer_month() {
        let remote = MemoryRemote::default();
        remote
            .insert_reading("01J0000000000000000000000A", &new_reading("c-1", 100.0, date!(2024 - 11 - 01)))
            .await
            .unwrap();

        let err = remote
            .insert_reading("01J0000000000000000000000B", &new_reading("c-1", 105.0, date!(2024 - 11 - 20)))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
        assert_eq!(remote.readings().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let remote = MemoryRemote::default();
        remote.fail_next_inserts(1);

        let first = remote
            .insert_reading("01J0000000000000000000000A", &new_reading("c-1", 100.0, date!(2024 - 11 - 01)))
            .await;
        assert!(matches!(first, Err(RemoteError::Unreachable(_))));

        let second = remote
            .insert_reading("01J0000000000000000000000A", &new_reading("c-1", 100.0, date!(2024 - 11 - 01)))
            .await;
        assert!(second.is_ok());
        assert_eq!(remote.insert_attempts(), 2);
    }

    #[tokio::test]
    async fn repeated_client_id_returns_the_first_row() {
        let remote = MemoryRemote::default();
        let reading = new_reading("c-1", 100.0, date!(2024 - 11 - 01));

        let first = remote.insert_reading("01J0000000000000000000000A", &reading).await.unwrap();
        let again = remote.insert_reading("01J0000000000000000000000A", &reading).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(remote.readings().len(), 1);

        let discount = NewDiscount {
            customer_id: CustomerId::from("c-1"),
            value: meter_client::domain::DiscountValue::Percentage(10.0),
            reason: "senior".to_string(),
            month: BillingMonth::from_date(date!(2024 - 11 - 01)),
            active: true,
            created_by: "admin".to_string(),
            created_at: time::macros::datetime!(2024-11-01 08:00 UTC),
        };
        let first = remote.insert_discount("01J0000000000000000000000C", &discount).await.unwrap();
        let again = remote.insert_discount("01J0000000000000000000000C", &discount).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(remote.discounts().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_remote_fails_every_call() {
        let remote = MemoryRemote::default();
        remote.set_reachable(false);

        assert!(remote.ping().await.is_err());
        assert!(remote.fetch_customers().await.is_err());
        assert_eq!(remote.insert_attempts(), 0);
    }
}
