//! Rule condition matching against event payloads.

use serde_json::Value;

use crate::model::JsonMap;
use crate::model::automation::{Condition, Conditions};

/// Look up a dotted path (`a.b.c`) in a payload.
pub fn lookup<'a>(payload: &'a JsonMap, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// A clause with neither `equals` nor `in` never matches.
pub fn matches_condition(condition: &Condition, payload: &JsonMap) -> bool {
    let value = lookup(payload, &condition.field);
    if let Some(ref expected) = condition.equals {
        return value == Some(expected);
    }
    if let Some(ref options) = condition.one_of {
        return value.is_some_and(|v| options.contains(v));
    }
    false
}

/// `None` matches everything.
pub fn matches(conditions: Option<&Conditions>, payload: &JsonMap) -> bool {
    match conditions {
        None => true,
        Some(Conditions::Grouped(group)) => {
            let all = group.all.iter().all(|c| matches_condition(c, payload));
            let any =
                group.any.is_empty() || group.any.iter().any(|c| matches_condition(c, payload));
            all && any
        }
        Some(Conditions::Fields(fields)) => fields
            .iter()
            .all(|(field, expected)| lookup(payload, field) == Some(expected)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> JsonMap {
        v.as_object().cloned().unwrap()
    }

    fn conditions(v: Value) -> Conditions {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn grouped_all_and_any() {
        let p = payload(json!({"assetType": "sprite", "status": "ready"}));
        let c = conditions(json!({
            "all": [{"field": "status", "equals": "ready"}],
            "any": [
                {"field": "assetType", "in": ["ui_icon", "sprite"]},
                {"field": "assetType", "equals": "tile"}
            ]
        }));
        assert!(matches(Some(&c), &p));

        let c = conditions(json!({"any": [{"field": "assetType", "equals": "tile"}]}));
        assert!(!matches(Some(&c), &p));
    }

    #[test]
    fn empty_group_is_true() {
        let c = conditions(json!({"all": [], "any": []}));
        assert!(matches(Some(&c), &JsonMap::new()));
    }

    #[test]
    fn clause_without_operator_is_false() {
        let c = Condition {
            field: "status".into(),
            equals: None,
            one_of: None,
        };
        assert!(!matches_condition(&c, &payload(json!({"status": "ready"}))));
    }

    #[test]
    fn flat_map_and_dotted_paths() {
        let p = payload(json!({"spec": {"assetType": "sprite"}, "frames": [{"name": "idle"}]}));
        assert!(matches(
            Some(&conditions(json!({"spec.assetType": "sprite"}))),
            &p
        ));
        assert_eq!(lookup(&p, "frames.0.name"), Some(&json!("idle")));
        assert!(!matches(
            Some(&conditions(json!({"spec.assetType": "tile"}))),
            &p
        ));
    }
}
