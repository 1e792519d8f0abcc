//! Renderers for recovery summaries.
//!
//! - [`terminal`]: colored per-project tables with a totals line; respects `--quiet`.
//! - [`json`]: the summaries as pretty JSON, for auditing.

pub mod json;
pub mod terminal;
