//!
//! This module defines filter policies and the engine that evaluates them against messages.
//!
//! Evaluation is a pure function of the policy and the message: no I/O, no shared state,
//! so it may be called from any number of tasks at once.
//!
use crate::error::ConfigError;
use crate::message::Message;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Bound, RangeBounds};
use tracing::trace;

/// Which part of a message a policy inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum FilterScope {
    #[default]
    #[serde(rename = "MessageAttributes")]
    Attributes,

    #[serde(rename = "MessageBody")]
    Body,
}

/// How several predicates attached to the same field combine.
///
/// Fields always combine with AND.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Composition {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    GreaterOrEqual,
    Greater,
    LessOrEqual,
    Less,
    Equal,
}

impl ComparisonOp {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            ">=" => Some(ComparisonOp::GreaterOrEqual),
            ">" => Some(ComparisonOp::Greater),
            "<=" => Some(ComparisonOp::LessOrEqual),
            "<" => Some(ComparisonOp::Less),
            "=" | "==" => Some(ComparisonOp::Equal),
            _ => None,
        }
    }

    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            ComparisonOp::GreaterOrEqual => lhs >= rhs,
            ComparisonOp::Greater => lhs > rhs,
            ComparisonOp::LessOrEqual => lhs <= rhs,
            ComparisonOp::Less => lhs < rhs,
            ComparisonOp::Equal => lhs == rhs,
        }
    }
}

/// A single matching rule over one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches when the value is one of the listed strings.
    Allowlist(BTreeSet<String>),

    /// Matches when the value is present and none of the listed strings.
    Denylist(BTreeSet<String>),

    NumericRange { start: Bound<f64>, stop: Bound<f64> },

    NumericComparison { op: ComparisonOp, value: f64 },
}

impl Predicate {
    pub fn allowlist<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::Allowlist(values.into_iter().map(Into::into).collect())
    }

    pub fn denylist<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::Denylist(values.into_iter().map(Into::into).collect())
    }

    /// Inclusive range `[start, stop]`.
    pub fn between(start: f64, stop: f64) -> Self {
        Predicate::NumericRange {
            start: Bound::Included(start),
            stop: Bound::Included(stop),
        }
    }

    pub fn compare(op: ComparisonOp, value: f64) -> Self {
        Predicate::NumericComparison { op, value }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        match self {
            Predicate::Allowlist(values) | Predicate::Denylist(values) if values.is_empty() => {
                Err(ConfigError::malformed(field, "value list is empty"))
            }
            Predicate::NumericRange { start, stop } => {
                let (low, low_inclusive) = bound_value(start)
                    .ok_or_else(|| ConfigError::malformed(field, "range needs a lower bound"))?;
                let (high, high_inclusive) = bound_value(stop)
                    .ok_or_else(|| ConfigError::malformed(field, "range needs an upper bound"))?;
                if !low.is_finite() || !high.is_finite() {
                    return Err(ConfigError::malformed(field, "range bounds must be finite"));
                }
                if low > high || (low == high && !(low_inclusive && high_inclusive)) {
                    return Err(ConfigError::malformed(field, "range is empty"));
                }
                Ok(())
            }
            Predicate::NumericComparison { value, .. } if !value.is_finite() => {
                Err(ConfigError::malformed(field, "comparison value must be finite"))
            }
            _ => Ok(()),
        }
    }

    fn matches_string(&self, text: &str) -> bool {
        match self {
            Predicate::Allowlist(values) => values.contains(text),
            Predicate::Denylist(values) => !values.contains(text),
            _ => false,
        }
    }

    fn matches_number(&self, number: f64) -> bool {
        match self {
            Predicate::NumericRange { start, stop } => (*start, *stop).contains(&number),
            Predicate::NumericComparison { op, value } => op.holds(number, *value),
            Predicate::Allowlist(_) => false,
            Predicate::Denylist(_) => true,
        }
    }

    /// Attribute values are strings; numeric predicates parse them and fail closed.
    fn matches_attribute(&self, text: &str) -> bool {
        match self {
            Predicate::Allowlist(_) | Predicate::Denylist(_) => self.matches_string(text),
            _ => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|number| number.is_finite())
                .is_some_and(|number| self.matches_number(number)),
        }
    }

    fn matches_json(&self, value: &Value) -> bool {
        match value {
            Value::Array(items) => items.iter().any(|item| self.matches_json(item)),
            Value::String(text) => self.matches_string(text),
            Value::Number(number) => number
                .as_f64()
                .is_some_and(|number| self.matches_number(number)),
            Value::Null => false,
            Value::Bool(_) | Value::Object(_) => matches!(self, Predicate::Denylist(_)),
        }
    }
}

fn bound_value(bound: &Bound<f64>) -> Option<(f64, bool)> {
    match bound {
        Bound::Included(value) => Some((*value, true)),
        Bound::Excluded(value) => Some((*value, false)),
        Bound::Unbounded => None,
    }
}

/// A set of field-level predicates gating whether a subscription receives a message.
///
/// Body-scoped field names may address nested objects with dotted paths, e.g. `order.total`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPolicy {
    scope: FilterScope,
    composition: Composition,
    fields: BTreeMap<String, Vec<Predicate>>,
}

impl FilterPolicy {
    pub fn new(scope: FilterScope) -> Self {
        FilterPolicy {
            scope,
            composition: Composition::default(),
            fields: BTreeMap::new(),
        }
    }

    pub fn attributes() -> Self {
        FilterPolicy::new(FilterScope::Attributes)
    }

    pub fn body() -> Self {
        FilterPolicy::new(FilterScope::Body)
    }

    pub fn with_composition(mut self, composition: Composition) -> Self {
        self.composition = composition;
        self
    }

    pub fn with_predicate(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.fields.entry(field.into()).or_default().push(predicate);
        self
    }

    pub fn scope(&self) -> FilterScope {
        self.scope
    }

    pub fn composition(&self) -> Composition {
        self.composition
    }

    pub fn predicates(&self, field: &str) -> Option<&[Predicate]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fields.is_empty() {
            return Err(ConfigError::EmptyPolicy);
        }
        for (field, predicates) in &self.fields {
            if predicates.is_empty() {
                return Err(ConfigError::malformed(field, "no predicates"));
            }
            for predicate in predicates {
                predicate.validate(field)?;
            }
        }
        Ok(())
    }

    pub fn matches(&self, message: &Message) -> bool {
        match self.scope {
            FilterScope::Attributes => self.fields.iter().all(|(field, predicates)| {
                match message.attribute(field) {
                    Some(value) => self.combine(predicates, |p| p.matches_attribute(value)),
                    None => false,
                }
            }),
            FilterScope::Body => {
                let document: Value = match serde_json::from_slice(message.body()) {
                    Ok(document) => document,
                    Err(e) => {
                        trace!(message_id = %message.id(), error = %e, "Body is not JSON, body policy does not match");
                        return false;
                    }
                };
                self.fields.iter().all(|(field, predicates)| {
                    match lookup(&document, field) {
                        Some(value) if !value.is_null() => {
                            self.combine(predicates, |p| p.matches_json(value))
                        }
                        _ => false,
                    }
                })
            }
        }
    }

    fn combine<F>(&self, predicates: &[Predicate], check: F) -> bool
    where
        F: Fn(&Predicate) -> bool,
    {
        match self.composition {
            Composition::All => predicates.iter().all(|p| check(p)),
            Composition::Any => predicates.iter().any(|p| check(p)),
        }
    }
}

fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = document.get(path) {
        return Some(value);
    }
    path.split('.')
        .try_fold(document, |node, segment| node.get(segment))
}

/// Evaluates an optional policy. A subscription without a policy receives everything.
pub fn evaluate(policy: Option<&FilterPolicy>, message: &Message) -> bool {
    policy.map_or(true, |policy| policy.matches(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle_policy() -> FilterPolicy {
        FilterPolicy::attributes().with_predicate("insurance_type", Predicate::allowlist(["car", "boat"]))
    }

    fn new_volvo_policy() -> FilterPolicy {
        FilterPolicy::body()
            .with_predicate("car", Predicate::allowlist(["volvo"]))
            .with_predicate("year", Predicate::between(2008.0, 2010.0))
    }

    #[test]
    fn test_no_policy_matches_everything() {
        assert!(evaluate(None, &Message::new("anything")));
        assert!(evaluate(None, &Message::new(Vec::new())));
    }

    #[test]
    fn test_attribute_allowlist() {
        let policy = vehicle_policy();
        let car = Message::new("x").with_attribute("insurance_type", "car");
        let health = Message::new("x").with_attribute("insurance_type", "health");
        assert!(evaluate(Some(&policy), &car));
        assert!(!evaluate(Some(&policy), &health));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let denylist = FilterPolicy::attributes().with_predicate("kind", Predicate::denylist(["sale"]));
        let message = Message::new("x").with_attribute("other", "value");
        assert!(!evaluate(Some(&vehicle_policy()), &message));
        assert!(!evaluate(Some(&denylist), &message));
    }

    #[test]
    fn test_attribute_denylist() {
        let policy = FilterPolicy::attributes().with_predicate("kind", Predicate::denylist(["sale"]));
        assert!(evaluate(Some(&policy), &Message::new("x").with_attribute("kind", "regular")));
        assert!(!evaluate(Some(&policy), &Message::new("x").with_attribute("kind", "sale")));
    }

    #[test]
    fn test_numeric_attribute() {
        let policy = FilterPolicy::attributes()
            .with_predicate("price", Predicate::compare(ComparisonOp::Greater, 100.0));
        assert!(evaluate(Some(&policy), &Message::new("x").with_attribute("price", "100.5")));
        assert!(!evaluate(Some(&policy), &Message::new("x").with_attribute("price", "100")));
        assert!(!evaluate(Some(&policy), &Message::new("x").with_attribute("price", "cheap")));
        assert!(!evaluate(Some(&policy), &Message::new("x").with_attribute("price", "inf")));
    }

    #[test]
    fn test_body_policy() {
        let policy = new_volvo_policy();
        assert!(evaluate(Some(&policy), &Message::new(r#"{"car": "volvo", "year": 2009}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"car": "volvo", "year": 2015}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"car": "saab", "year": 2009}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"car": "volvo"}"#)));
    }

    #[test]
    fn test_numeric_predicate_on_string_field_does_not_match() {
        let policy = new_volvo_policy();
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"car": "volvo", "year": "2009"}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"car": "volvo", "year": null}"#)));
    }

    #[test]
    fn test_unparseable_body_does_not_match() {
        let policy = new_volvo_policy();
        assert!(!evaluate(Some(&policy), &Message::new("Hello User!")));
        assert!(!evaluate(Some(&policy), &Message::new(r#"["volvo", 2009]"#)));
    }

    #[test]
    fn test_nested_body_fields() {
        let policy = FilterPolicy::body()
            .with_predicate("order.total", Predicate::compare(ComparisonOp::GreaterOrEqual, 10.0));
        assert!(evaluate(Some(&policy), &Message::new(r#"{"order": {"total": 12}}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"order": {"total": 2}}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"order": 12}"#)));
    }

    #[test]
    fn test_array_field_matches_any_element() {
        let policy = FilterPolicy::body().with_predicate("tags", Predicate::allowlist(["urgent"]));
        assert!(evaluate(Some(&policy), &Message::new(r#"{"tags": ["low", "urgent"]}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"tags": []}"#)));
    }

    #[test]
    fn test_composition_within_field() {
        // Range and lower bound on the same field, as in the "new volvo" subscription.
        let all = FilterPolicy::body()
            .with_predicate("year", Predicate::between(2008.0, 2010.0))
            .with_predicate("year", Predicate::compare(ComparisonOp::GreaterOrEqual, 2020.0));
        let any = all.clone().with_composition(Composition::Any);

        for year in [2009, 2021] {
            let message = Message::new(format!(r#"{{"year": {}}}"#, year));
            assert!(!evaluate(Some(&all), &message));
            assert!(evaluate(Some(&any), &message));
        }
        assert!(!evaluate(Some(&any), &Message::new(r#"{"year": 2015}"#)));
    }

    #[test]
    fn test_exclusive_range() {
        let policy = FilterPolicy::attributes().with_predicate(
            "size",
            Predicate::NumericRange {
                start: Bound::Excluded(0.0),
                stop: Bound::Included(5.0),
            },
        );
        assert!(!evaluate(Some(&policy), &Message::new("x").with_attribute("size", "0")));
        assert!(evaluate(Some(&policy), &Message::new("x").with_attribute("size", "5")));
    }

    #[test]
    fn test_validate() {
        assert!(vehicle_policy().validate().is_ok());
        assert!(matches!(
            FilterPolicy::attributes().validate(),
            Err(ConfigError::EmptyPolicy)
        ));
        let empty_list = FilterPolicy::attributes().with_predicate("a", Predicate::Allowlist(BTreeSet::new()));
        assert!(empty_list.validate().is_err());
        let inverted = FilterPolicy::body().with_predicate("a", Predicate::between(10.0, 1.0));
        assert!(inverted.validate().is_err());
        let nan = FilterPolicy::body().with_predicate("a", Predicate::compare(ComparisonOp::Less, f64::NAN));
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_comparison_op_parse() {
        assert_eq!(ComparisonOp::parse(">="), Some(ComparisonOp::GreaterOrEqual));
        assert_eq!(ComparisonOp::parse("="), Some(ComparisonOp::Equal));
        assert_eq!(ComparisonOp::parse("=="), Some(ComparisonOp::Equal));
        assert_eq!(ComparisonOp::parse("=>"), None);
    }
}
