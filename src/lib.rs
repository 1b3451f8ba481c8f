//! BetterPicks Backend Library
//!
//! Turns per-subject driver signals into tiered recommendation cards,
//! settles them against final outcomes and keeps performance stats current.
//! Every job runs under the idempotency-keyed run ledger.

pub mod arbiter;
pub mod config;
pub mod drivers;
pub mod error;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod resettle;
pub mod settlement;
pub mod stats;
pub mod store;
pub mod writer;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult, SubjectError};
pub use pipeline::{JobOutcome, Pipeline};
pub use store::{Repository, SqliteRepository};
