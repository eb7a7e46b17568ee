//! Raw study record → [`Trial`] projection.
//!
//! Accepts both the nested ClinicalTrials.gov shape and the backend's flat
//! records. Total over any JSON value: missing or mistyped fields become defaults.

use serde_json::Value;

use crate::entities::trial::{STATUS_UNKNOWN, Trial};

const ID_PATHS: &[&str] = &["/protocolSection/identificationModule/nctId", "/nctId", "/id"];
const TITLE_PATHS: &[&str] = &[
    "/protocolSection/identificationModule/briefTitle",
    "/briefTitle",
    "/title",
];
const STATUS_PATHS: &[&str] = &[
    "/protocolSection/statusModule/overallStatus",
    "/overallStatus",
    "/status",
];
const CONDITION_PATHS: &[&str] = &[
    "/protocolSection/conditionsModule/conditions/0",
    "/condition",
    "/conditions/0",
];
const LAST_UPDATE_PATHS: &[&str] = &[
    "/protocolSection/statusModule/lastUpdatePostDateStruct/date",
    "/lastUpdateDate",
    "/lastUpdatePostDate",
];

/// First path that resolves to a string, trimmed. Blank strings count as absent.
fn first_string(study: &Value, paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .filter_map(|p| study.pointer(p))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        })
}

/// Condition is the first list element; a blank first element means "no condition".
fn first_condition(study: &Value) -> Option<String> {
    let value = CONDITION_PATHS.iter().find_map(|p| study.pointer(p))?;
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

pub fn from_raw_study(study: &Value) -> Trial {
    if !study.is_object() {
        return Trial::default();
    }

    Trial {
        id: first_string(study, ID_PATHS).unwrap_or_default(),
        title: first_string(study, TITLE_PATHS).unwrap_or_default(),
        status: first_string(study, STATUS_PATHS).unwrap_or_else(|| STATUS_UNKNOWN.to_string()),
        condition: first_condition(study),
        has_results: is_truthy(study.get("hasResults")),
        last_update_date: first_string(study, LAST_UPDATE_PATHS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projects_nested_ctgov_study() {
        let trial = from_raw_study(&json!({
            "protocolSection": {
                "identificationModule": {"nctId": "NCT04280705", "briefTitle": " Adaptive COVID-19 Treatment Trial "},
                "statusModule": {
                    "overallStatus": "COMPLETED",
                    "lastUpdatePostDateStruct": {"date": "2023-03-14", "type": "ACTUAL"}
                },
                "conditionsModule": {"conditions": [" COVID-19 ", "Pneumonia"]}
            },
            "hasResults": true
        }));

        assert_eq!(trial.id, "NCT04280705");
        assert_eq!(trial.title, "Adaptive COVID-19 Treatment Trial");
        assert_eq!(trial.status, "COMPLETED");
        assert_eq!(trial.condition.as_deref(), Some("COVID-19"));
        assert!(trial.has_results);
        assert_eq!(trial.last_update_date.as_deref(), Some("2023-03-14"));
    }

    #[test]
    fn projects_flat_backend_record() {
        let trial = from_raw_study(&json!({
            "nctId": "NCT01",
            "briefTitle": "Flat record",
            "overallStatus": "RECRUITING",
            "conditions": ["Asthma"],
            "hasResults": false
        }));
        assert_eq!(trial.id, "NCT01");
        assert_eq!(trial.status, "RECRUITING");
        assert_eq!(trial.condition.as_deref(), Some("Asthma"));
        assert!(!trial.has_results);
    }

    #[test]
    fn missing_status_becomes_unknown() {
        let trial = from_raw_study(&json!({
            "protocolSection": {"identificationModule": {"nctId": "NCT02"}}
        }));
        assert_eq!(trial.status, "UNKNOWN");
        assert_eq!(trial.title, "");
        assert!(trial.condition.is_none());
        assert!(trial.last_update_date.is_none());
    }

    #[test]
    fn blank_or_non_string_status_becomes_unknown() {
        let blank = from_raw_study(&json!({"overallStatus": "   "}));
        assert_eq!(blank.status, "UNKNOWN");
        let numeric = from_raw_study(&json!({"overallStatus": 3}));
        assert_eq!(numeric.status, "UNKNOWN");
    }

    #[test]
    fn unfamiliar_status_is_kept() {
        let trial = from_raw_study(&json!({"overallStatus": "AVAILABLE"}));
        assert_eq!(trial.status, "AVAILABLE");
    }

    #[test]
    fn blank_first_condition_is_unset_not_sentinel() {
        let trial = from_raw_study(&json!({
            "protocolSection": {"conditionsModule": {"conditions": ["  ", "Asthma"]}}
        }));
        assert!(trial.condition.is_none());

        let empty = from_raw_study(&json!({
            "protocolSection": {"conditionsModule": {"conditions": []}}
        }));
        assert!(empty.condition.is_none());
    }

    #[test]
    fn has_results_follows_json_truthiness() {
        for (raw, expected) in [
            (json!(true), true),
            (json!(false), false),
            (json!(null), false),
            (json!(0), false),
            (json!(1), true),
            (json!(""), false),
            (json!("yes"), true),
            (json!([]), true),
        ] {
            let trial = from_raw_study(&json!({"hasResults": raw}));
            assert_eq!(trial.has_results, expected, "{raw}");
        }
        assert!(!from_raw_study(&json!({})).has_results);
    }

    #[test]
    fn non_object_input_yields_defaults() {
        for raw in [json!(null), json!("NCT01"), json!([1, 2])] {
            let trial = from_raw_study(&raw);
            assert_eq!(trial, Trial::default());
            assert_eq!(trial.status, "UNKNOWN");
            assert!(trial.id.is_empty());
        }
    }
}
