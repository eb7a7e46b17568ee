//! Pure adapters from upstream study shapes into trials and chart aggregates.

pub mod aggregate;
pub mod trial;
