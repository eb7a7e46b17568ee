//! Trial search workflows and the paginated loader behind them.

pub mod loader;
pub mod trial;
