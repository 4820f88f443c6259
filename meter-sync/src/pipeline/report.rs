use std::collections::BTreeMap;

use meter_client::domain::BillingMonth;
use serde::Serialize;

use super::{RecordError, TransformMetrics, TransformOutput};

/// Totals for one RT group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub rt: String,
    pub customer_count: usize,
    pub reading_count: usize,
    pub total_usage: f64,
    pub total_billed: i64,
    /// Fewer billed readings than customers in the group.
    pub incomplete: bool,
}

#[derive(Debug, Serialize)]
pub struct MonthlyReport {
    pub month: BillingMonth,
    pub groups: Vec<GroupSummary>,
    pub errors: Vec<RecordError>,
    pub metrics: TransformMetrics,
}

impl MonthlyReport {
    pub fn total_billed(&self) -> i64 {
        self.groups.iter().map(|g| g.total_billed).sum()
    }
}

fn group_for<'a>(groups: &'a mut BTreeMap<String, GroupSummary>, rt: &str) -> &'a mut GroupSummary {
    groups.entry(rt.to_string()).or_insert_with(|| GroupSummary {
        rt: rt.to_string(),
        customer_count: 0,
        reading_count: 0,
        total_usage: 0.0,
        total_billed: 0,
        incomplete: false,
    })
}

pub(crate) fn summarize(month: BillingMonth, output: TransformOutput) -> MonthlyReport {
    let mut groups: BTreeMap<String, GroupSummary> = BTreeMap::new();

    for customer in &output.customers {
        group_for(&mut groups, &customer.rt).customer_count += 1;
    }

    for record in &output.records {
        let g = group_for(&mut groups, &record.rt);
        g.reading_count += 1;
        g.total_usage += record.bill.usage;
        g.total_billed += record.bill.total;
    }

    let groups = groups
        .into_values()
        .map(|mut g| {
            g.incomplete = g.reading_count < g.customer_count;
            g
        })
        .collect();

    MonthlyReport {
        month,
        groups,
        errors: output.errors,
        metrics: output.metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{calculate_billing, Tariff};
    use crate::pipeline::{BilledRecord, DataSource};
    use crate::validation::{HistoricalReading, ReadingRef};
    use meter_client::domain::{Customer, CustomerId, RemoteId};
    use time::macros::date;

    fn customer(id: &str, rt: &str) -> Customer {
        Customer {
            id: CustomerId::from(id),
            name: id.to_string(),
            rt: rt.to_string(),
            phone: None,
        }
    }

    fn record(id: &str, rt: &str, usage: f64) -> BilledRecord {
        BilledRecord {
            customer_id: CustomerId::from(id),
            rt: rt.to_string(),
            month: BillingMonth::new(2024, 12).unwrap(),
            reading: HistoricalReading {
                reference: ReadingRef::Remote(RemoteId(1)),
                value: usage,
                date: date!(2024 - 12 - 01),
            },
            previous: None,
            warnings: Vec::new(),
            bill: calculate_billing(usage, &Tariff::default(), None),
        }
    }

    #[test]
    fn groups_by_rt_and_flags_missing_readings() {
        let output = TransformOutput {
            records: vec![record("a", "RT-01", 15.0), record("b", "RT-01", 5.0)],
            errors: Vec::new(),
            customers: vec![
                customer("a", "RT-01"),
                customer("b", "RT-01"),
                customer("c", "RT-02"),
            ],
            metrics: TransformMetrics {
                source: DataSource::Local,
                customers: 3,
                readings_in_scope: 2,
                billed: 2,
                failed: 0,
                elapsed_ms: 1,
            },
        };

        let report = summarize(BillingMonth::new(2024, 12).unwrap(), output);
        assert_eq!(
            report.groups,
            vec![
                GroupSummary {
                    rt: "RT-01".to_string(),
                    customer_count: 2,
                    reading_count: 2,
                    total_usage: 20.0,
                    total_billed: 3_500 + 1_250,
                    incomplete: false,
                },
                GroupSummary {
                    rt: "RT-02".to_string(),
                    customer_count: 1,
                    reading_count: 0,
                    total_usage: 0.0,
                    total_billed: 0,
                    incomplete: true,
                },
            ]
        );
        assert_eq!(report.total_billed(), 4_750);
    }
}
