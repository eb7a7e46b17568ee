//! Internal helpers.

pub(crate) mod date;
