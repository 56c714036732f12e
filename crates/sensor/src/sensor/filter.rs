//! Per-dependency event filters: time-of-day window, context fields, payload predicates
//! and payload expressions.

use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use serde_json::Value;

use super::value_expr::{Val, ValueExpr};
use crate::crd::{
    Comparator, DataFilter, Event, EventContext, EventContextFilter, EventDependencyFilter,
    ExprFilter, JsonType, LogicalOperator, TimeFilter,
};
use crate::jsonpath;
use crate::{Error, Result};

/// Decide whether `event` passes `filter`. No filter accepts everything.
///
/// A filter error (undecodable payload, bad predicate) is returned as `Err` and the
/// caller rejects the event.
pub fn accept(filter: Option<&EventDependencyFilter>, event: &Event) -> Result<bool> {
    let Some(filter) = filter else {
        return Ok(true);
    };

    if let Some(time) = &filter.time {
        if !filter_time(time, event.context.time)? {
            return Ok(false);
        }
    }
    if let Some(context) = &filter.context {
        if !filter_context(context, &event.context) {
            return Ok(false);
        }
    }
    if !filter_data(&filter.data, event)? {
        return Ok(false);
    }
    filter_exprs(&filter.exprs, filter.expr_logical_operator, event)
}

/// Parse a wall-clock time of day, `HH:MM:SS` or `HH:MM`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|e| Error::Validation(format!("invalid time of day '{}': {}", value, e)))
}

/// `start <= t < stop` on the UTC time of day of the event. Unset bounds are open.
pub fn filter_time(filter: &TimeFilter, event_time: DateTime<Utc>) -> Result<bool> {
    let t = event_time.time();

    if let Some(start) = filter.start.as_deref().filter(|s| !s.is_empty()) {
        if t < parse_time_of_day(start)? {
            return Ok(false);
        }
    }
    if let Some(stop) = filter.stop.as_deref().filter(|s| !s.is_empty()) {
        if t >= parse_time_of_day(stop)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Empty expected fields are ignored; extensions must be a subset of the event's.
pub fn filter_context(expected: &EventContextFilter, actual: &EventContext) -> bool {
    let fields = [
        (&expected.event_type, &actual.event_type),
        (&expected.type_version, &actual.type_version),
        (&expected.spec_version, &actual.spec_version),
        (&expected.data_content_type, &actual.data_content_type),
        (&expected.source, &actual.source),
        (&expected.subject, &actual.subject),
    ];
    if fields
        .iter()
        .any(|(want, got)| !want.is_empty() && want != got)
    {
        return false;
    }

    expected
        .extensions
        .iter()
        .all(|(k, v)| actual.extensions.get(k) == Some(v))
}

/// All predicates must hold. An empty payload cannot be evaluated and is accepted.
pub fn filter_data(filters: &[DataFilter], event: &Event) -> Result<bool> {
    if filters.is_empty() || event.data.is_empty() {
        return Ok(true);
    }

    let payload = event.data_as_json()?;
    for filter in filters {
        let Some(actual) = jsonpath::get(&payload, &filter.path) else {
            return Ok(false);
        };
        if !matches_predicate(filter, actual)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Expressions combine with `operator`. A missing field makes its expression false.
/// An empty payload is accepted, as for data filters.
pub fn filter_exprs(
    filters: &[ExprFilter],
    operator: LogicalOperator,
    event: &Event,
) -> Result<bool> {
    if filters.is_empty() || event.data.is_empty() {
        return Ok(true);
    }

    let payload = event.data_as_json()?;
    for filter in filters {
        let matched = match bind_fields(filter, &payload) {
            Some(bindings) => ValueExpr::parse(&filter.expr)?.eval_bool(&bindings)?,
            None => false,
        };
        match (operator, matched) {
            (LogicalOperator::And, false) => return Ok(false),
            (LogicalOperator::Or, true) => return Ok(true),
            _ => {}
        }
    }
    Ok(operator == LogicalOperator::And)
}

fn bind_fields(filter: &ExprFilter, payload: &Value) -> Option<HashMap<String, Val>> {
    filter
        .fields
        .iter()
        .map(|field| {
            jsonpath::get(payload, &field.path).map(|value| (field.name.clone(), Val::from(value)))
        })
        .collect()
}

fn matches_predicate(filter: &DataFilter, actual: &Value) -> Result<bool> {
    let comparator = filter.comparator.unwrap_or_default();

    match filter.value_type {
        JsonType::Bool => {
            let actual = match actual {
                Value::Bool(b) => Some(*b),
                Value::String(s) => parse_bool(s).ok(),
                _ => None,
            };
            let mut matched = false;
            for expected in &filter.value {
                let expected = parse_bool(expected)?;
                matched |= actual == Some(expected);
            }
            Ok(matched)
        }
        JsonType::Number => {
            let actual = match actual {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            let Some(actual) = actual else {
                return Ok(false);
            };
            let expected = filter
                .value
                .iter()
                .map(|v| {
                    v.trim().parse::<f64>().map_err(|e| {
                        Error::Filter(format!("filter value '{}' is not a number: {}", v, e))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            Ok(compare_any(comparator, &expected, |e| compare_numbers(comparator, actual, *e)))
        }
        JsonType::String => {
            let actual = jsonpath::value_to_string(actual);
            match comparator {
                Comparator::Equal | Comparator::NotEqual => Ok(compare_any(
                    comparator,
                    &filter.value,
                    |e| match comparator {
                        Comparator::NotEqual => actual != *e,
                        _ => actual == *e,
                    },
                )),
                other => Err(Error::Filter(format!(
                    "comparator {:?} is not supported for string filters",
                    other
                ))),
            }
        }
        JsonType::Unsupported => Err(Error::Filter(format!(
            "unsupported JSON type for filter on path '{}'",
            filter.path
        ))),
    }
}

/// `!=` must hold against every listed value; every other comparator against any.
fn compare_any<T>(comparator: Comparator, expected: &[T], f: impl Fn(&T) -> bool) -> bool {
    match comparator {
        Comparator::NotEqual => expected.iter().all(f),
        _ => expected.iter().any(f),
    }
}

fn compare_numbers(comparator: Comparator, actual: f64, expected: f64) -> bool {
    match comparator {
        Comparator::Equal => actual == expected,
        Comparator::NotEqual => actual != expected,
        Comparator::GreaterThan => actual > expected,
        Comparator::GreaterThanOrEqual => actual >= expected,
        Comparator::LessThan => actual < expected,
        Comparator::LessThanOrEqual => actual <= expected,
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "True" | "TRUE" | "1" | "t" | "T" => Ok(true),
        "false" | "False" | "FALSE" | "0" | "f" | "F" => Ok(false),
        other => Err(Error::Filter(format!("'{}' is not a boolean", other))),
    }
}
