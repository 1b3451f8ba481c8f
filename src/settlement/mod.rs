//! Settlement
//!
//! Grading a stored card against a final outcome, and the resolver job that
//! moves PENDING records to SETTLED.

pub mod pnl;
pub mod resolver;

pub use pnl::pnl_units;
pub use resolver::{classify, grade_card, Grade, Grading, SettlementResolver};
