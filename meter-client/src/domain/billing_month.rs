use std::{cmp::Ordering, fmt};

use time::{Date, Month};

/// One billing cycle: a calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BillingMonth {
    year: i32,
    month: Month,
}

impl BillingMonth {
    /// Returns `None` when `month` is not in `1..=12`.
    pub fn new(year: i32, month: u8) -> Option<Self> {
        let month = Month::try_from(month).ok()?;
        Some(Self { year, month })
    }

    pub fn from_date(date: Date) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> Month {
        self.month
    }

    /// First calendar day of the month, used as the `month` column value.
    pub fn first_day(&self) -> Date {
        // Day 1 exists in every month of every representable year.
        Date::from_calendar_date(self.year, self.month, 1).unwrap_or(Date::MIN)
    }

    pub fn contains(&self, date: Date) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn next(&self) -> Self {
        match self.month {
            Month::December => Self {
                year: self.year + 1,
                month: Month::January,
            },
            m => Self {
                year: self.year,
                month: m.next(),
            },
        }
    }
}

impl PartialOrd for BillingMonth {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BillingMonth {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.month as u8).cmp(&(other.year, other.month as u8))
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn rejects_invalid_month_numbers() {
        assert!(BillingMonth::new(2024, 0).is_none());
        assert!(BillingMonth::new(2024, 13).is_none());
        assert!(BillingMonth::new(2024, 12).is_some());
    }

    #[test]
    fn next_wraps_the_year_boundary() {
        let dec = BillingMonth::new(2024, 12).unwrap();
        assert_eq!(dec.next(), BillingMonth::new(2025, 1).unwrap());
        assert_eq!(BillingMonth::new(2024, 3).unwrap().next(), BillingMonth::new(2024, 4).unwrap());
    }

    #[test]
    fn orders_chronologically_and_formats_as_year_month() {
        let nov = BillingMonth::from_date(date!(2024 - 11 - 30));
        let jan = BillingMonth::from_date(date!(2025 - 01 - 02));
        assert!(nov < jan);
        assert_eq!(nov.to_string(), "2024-11");
        assert_eq!(jan.first_day(), date!(2025 - 01 - 01));
        assert!(jan.contains(date!(2025 - 01 - 31)));
        assert!(!jan.contains(date!(2024 - 01 - 31)));
    }
}
