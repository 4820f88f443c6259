//! Domain types and backend queries for metered billing.
//!
//! The backend is the source of truth for customers, readings and
//! discounts. Schema lives in `sql/schema/` at the workspace root and is
//! applied out-of-band.

pub mod db;
pub mod domain;
