use serde::Serialize;

use crate::error::TrialScopeError;

pub fn to_pretty<T: Serialize>(value: &T) -> Result<String, TrialScopeError> {
    Ok(serde_json::to_string_pretty(value)?)
}
