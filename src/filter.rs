//! Subscriber filter evaluation
//!
//! Conditions resolve a dot-path against the event's JSON form
//! (`type`, `source`, `data.document.kind`, `metadata.tenant`, ...) and
//! compare case-insensitively. Evaluation never fails: a missing field or
//! a malformed regex simply makes that condition false. Compiled regexes
//! are cached by pattern, malformed ones included.

use crate::types::{Event, FilterCondition, FilterLogic, FilterOperator, FilterSpec};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Patterns kept before the cache is reset
const REGEX_CACHE_CAPACITY: usize = 512;

type RegexCache = Mutex<HashMap<String, Option<Regex>>>;

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Case-insensitive regex for `pattern`, `None` if it does not compile
fn cached_regex(pattern: &str) -> Option<Regex> {
    let mut cache = regex_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(compiled) = cache.get(pattern) {
        return compiled.clone();
    }

    let compiled = match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::debug!(pattern, error = %e, "Invalid filter regex");
            None
        }
    };
    if cache.len() >= REGEX_CACHE_CAPACITY {
        cache.clear();
    }
    cache.insert(pattern.to_string(), compiled.clone());
    compiled
}

/// Check whether an event passes a subscription's filter
///
/// An absent filter, or one without conditions, matches every event.
pub fn matches(event: &Event, filter: Option<&FilterSpec>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if filter.conditions.is_empty() {
        return true;
    }

    let document = match serde_json::to_value(event) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::debug!(
                event_id = %event.id,
                error = %e,
                "Event not serializable for filtering"
            );
            return false;
        }
    };

    let mut results = filter
        .conditions
        .iter()
        .map(|condition| evaluate(&document, condition));

    match filter.logic {
        FilterLogic::And => results.all(|r| r),
        FilterLogic::Or => results.any(|r| r),
    }
}

/// Evaluate a single condition against an event document
pub fn evaluate(document: &Value, condition: &FilterCondition) -> bool {
    let Some(actual) = resolve_path(document, &condition.field).and_then(string_form) else {
        return false;
    };
    let actual = actual.to_lowercase();
    let expected = condition.value.to_lowercase();

    match condition.operator {
        FilterOperator::Equals => actual == expected,
        FilterOperator::Contains => actual.contains(&expected),
        FilterOperator::StartsWith => actual.starts_with(&expected),
        FilterOperator::EndsWith => actual.ends_with(&expected),
        FilterOperator::Regex => {
            cached_regex(&condition.value).is_some_and(|re| re.is_match(&actual))
        }
    }
}

/// Walk a dot-separated path through nested objects (and array indices)
pub fn resolve_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(document, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn string_form(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
