//! In-memory aggregation: stage parsing and execution over materialized
//! documents.

pub mod exec;
pub mod pipeline;

pub use exec::execute_pipeline;
pub use pipeline::{Accumulator, Stage, parse_pipeline};
