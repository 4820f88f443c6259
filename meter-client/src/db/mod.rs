pub mod customer_queries;
pub mod discount_queries;
pub mod reading_queries;

pub use customer_queries::list_customers;
pub use discount_queries::{insert_discount, list_discounts};
pub use reading_queries::{insert_reading, list_readings, ReadingFilter};
