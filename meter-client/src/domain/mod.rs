pub mod billing_month;
pub mod customer;
pub mod discount;
pub mod reading;

pub use billing_month::BillingMonth;
pub use customer::{Customer, CustomerId};
pub use discount::{DiscountRow, DiscountValue, NewDiscount};
pub use reading::{NewReading, RemoteId, RemoteReading};
