//!
//! This module defines the static configuration the broker is assembled from.
//!
//! Filter policies use the JSON vocabulary of SNS subscription filter policies:
//! each field maps to an array of conditions, bare strings form an allowlist,
//! `{"anything-but": [...]}` a denylist and `{"numeric": [op, n, ...]}` a numeric test.
//!
use crate::broker::DeliverySettings;
use crate::error::ConfigError;
use crate::filter::{ComparisonOp, Composition, FilterPolicy, FilterScope, Predicate};
use crate::topic::{DeliveryOrdering, Subscription, Topic};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    #[serde(default)]
    pub delivery: DeliveryConfig,

    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryConfig {
    pub enqueue_timeout_millis: u64,
    pub group_idle_timeout_millis: u64,
    pub failure_channel_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let settings = DeliverySettings::default();
        DeliveryConfig {
            enqueue_timeout_millis: settings.enqueue_timeout.as_millis() as u64,
            group_idle_timeout_millis: settings.group_idle_timeout.as_millis() as u64,
            failure_channel_capacity: settings.failure_channel_capacity,
        }
    }
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> DeliverySettings {
        DeliverySettings {
            enqueue_timeout: Duration::from_millis(config.enqueue_timeout_millis),
            group_idle_timeout: Duration::from_millis(config.group_idle_timeout_millis),
            failure_channel_capacity: config.failure_channel_capacity.max(1),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub id: String,

    #[serde(default)]
    pub fifo: bool,

    #[serde(default = "default_content_based_deduplication")]
    pub content_based_deduplication: bool,

    #[serde(default)]
    pub dedup_window_secs: Option<u64>,

    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

fn default_content_based_deduplication() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    pub id: String,

    pub destination: String,

    #[serde(default)]
    pub filter_policy: Option<Value>,

    #[serde(default)]
    pub filter_policy_scope: FilterScope,

    #[serde(default)]
    pub filter_composition: Composition,

    #[serde(default)]
    pub ordering: DeliveryOrdering,

    #[serde(default)]
    pub replay: bool,

    /// Overrides the path default: primary subscriptions start active, replay ones inactive.
    #[serde(default)]
    pub active: Option<bool>,
}

impl BrokerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        BrokerConfig::from_json(&json)
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings::from(&self.delivery)
    }

    pub fn topics(&self) -> Result<Vec<Topic>, ConfigError> {
        self.topics.iter().map(Topic::try_from).collect()
    }
}

impl TryFrom<&TopicConfig> for Topic {
    type Error = ConfigError;

    fn try_from(config: &TopicConfig) -> Result<Topic, ConfigError> {
        let mut topic = if config.fifo {
            Topic::fifo(config.id.as_str())
        } else {
            Topic::new(config.id.as_str())
        };
        topic = topic.with_content_based_dedup(config.content_based_deduplication);
        if let Some(secs) = config.dedup_window_secs {
            topic = topic.with_dedup_window(Duration::from_secs(secs));
        }
        for subscription in &config.subscriptions {
            topic = topic.with_subscription(Subscription::try_from(subscription)?);
        }
        topic.validate()?;
        Ok(topic)
    }
}

impl TryFrom<&SubscriptionConfig> for Subscription {
    type Error = ConfigError;

    fn try_from(config: &SubscriptionConfig) -> Result<Subscription, ConfigError> {
        let mut subscription = Subscription::new(config.id.as_str(), config.destination.as_str())
            .with_ordering(config.ordering);
        if let Some(document) = &config.filter_policy {
            subscription = subscription.with_filter_policy(parse_filter_policy(
                config.filter_policy_scope,
                config.filter_composition,
                document,
            )?);
        }
        if config.replay {
            subscription = subscription.replay();
        }
        if let Some(active) = config.active {
            subscription = subscription.with_active(active);
        }
        Ok(subscription)
    }
}

/// Parses an SNS style filter policy document.
pub fn parse_filter_policy(
    scope: FilterScope,
    composition: Composition,
    document: &Value,
) -> Result<FilterPolicy, ConfigError> {
    let fields = document
        .as_object()
        .ok_or_else(|| ConfigError::malformed("", "policy must be a JSON object"))?;
    let mut policy = FilterPolicy::new(scope).with_composition(composition);
    for (field, value) in fields {
        policy = parse_field(policy, field, value)?;
    }
    policy.validate()?;
    Ok(policy)
}

fn parse_field(
    mut policy: FilterPolicy,
    field: &str,
    value: &Value,
) -> Result<FilterPolicy, ConfigError> {
    match value {
        Value::Array(conditions) => {
            for predicate in parse_conditions(field, policy.composition(), conditions)? {
                policy = policy.with_predicate(field, predicate);
            }
            Ok(policy)
        }
        Value::Object(nested) if policy.scope() == FilterScope::Body => {
            for (key, value) in nested {
                policy = parse_field(policy, &format!("{}.{}", field, key), value)?;
            }
            Ok(policy)
        }
        _ => Err(ConfigError::malformed(
            field,
            "expected an array of conditions",
        )),
    }
}

fn parse_conditions(
    field: &str,
    composition: Composition,
    conditions: &[Value],
) -> Result<Vec<Predicate>, ConfigError> {
    if conditions.is_empty() {
        return Err(ConfigError::malformed(field, "condition list is empty"));
    }
    let mut allowed = BTreeSet::new();
    let mut predicates = Vec::new();
    let mut equalities = 0;
    for condition in conditions {
        match condition {
            Value::String(value) => {
                allowed.insert(value.clone());
            }
            Value::Number(number) => {
                let value = number
                    .as_f64()
                    .ok_or_else(|| ConfigError::malformed(field, "number out of range"))?;
                predicates.push(Predicate::compare(ComparisonOp::Equal, value));
                equalities += 1;
            }
            Value::Object(operator) => predicates.push(parse_operator(field, operator)?),
            other => {
                return Err(ConfigError::malformed(
                    field,
                    format!("unsupported condition `{}`", other),
                ))
            }
        }
    }
    if !allowed.is_empty() {
        predicates.insert(0, Predicate::Allowlist(allowed));
        equalities += 1;
    }
    // Two exact values can never hold at once.
    if composition == Composition::All && equalities > 1 {
        return Err(ConfigError::malformed(
            field,
            "several exact values require filterComposition `any`",
        ));
    }
    Ok(predicates)
}

fn parse_operator(field: &str, operator: &Map<String, Value>) -> Result<Predicate, ConfigError> {
    let mut entries = operator.iter();
    let (name, operand) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(ConfigError::malformed(
                field,
                "operator object must have exactly one key",
            ))
        }
    };
    match name.as_str() {
        "anything-but" => parse_anything_but(field, operand),
        "numeric" => parse_numeric(field, operand),
        other => Err(ConfigError::malformed(
            field,
            format!("unsupported operator `{}`", other),
        )),
    }
}

fn parse_anything_but(field: &str, operand: &Value) -> Result<Predicate, ConfigError> {
    let values = match operand {
        Value::String(value) => vec![value.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_owned).ok_or_else(|| {
                    ConfigError::malformed(field, "anything-but accepts strings only")
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(ConfigError::malformed(
                field,
                "anything-but expects a string or an array of strings",
            ))
        }
    };
    Ok(Predicate::denylist(values))
}

fn parse_numeric(field: &str, operand: &Value) -> Result<Predicate, ConfigError> {
    let terms = operand
        .as_array()
        .ok_or_else(|| ConfigError::malformed(field, "numeric expects an array"))?;
    let mut comparisons = Vec::with_capacity(2);
    for pair in terms.chunks(2) {
        let [op, value] = pair else {
            return Err(ConfigError::malformed(
                field,
                "numeric expects operator/value pairs",
            ));
        };
        let op = op
            .as_str()
            .and_then(ComparisonOp::parse)
            .ok_or_else(|| ConfigError::malformed(field, format!("unknown operator `{}`", op)))?;
        let value = value
            .as_f64()
            .ok_or_else(|| ConfigError::malformed(field, "numeric operand must be a number"))?;
        comparisons.push((op, value));
    }

    match comparisons.as_slice() {
        [(op, value)] => Ok(Predicate::compare(*op, *value)),
        [first, second] => {
            let (lower, upper) = match (lower_bound(*first), upper_bound(*second)) {
                (Some(lower), Some(upper)) => (lower, upper),
                _ => match (lower_bound(*second), upper_bound(*first)) {
                    (Some(lower), Some(upper)) => (lower, upper),
                    _ => {
                        return Err(ConfigError::malformed(
                            field,
                            "numeric range needs one lower and one upper bound",
                        ))
                    }
                },
            };
            Ok(Predicate::NumericRange {
                start: lower,
                stop: upper,
            })
        }
        _ => Err(ConfigError::malformed(
            field,
            "numeric expects a single comparison or a range",
        )),
    }
}

fn lower_bound((op, value): (ComparisonOp, f64)) -> Option<Bound<f64>> {
    match op {
        ComparisonOp::GreaterOrEqual => Some(Bound::Included(value)),
        ComparisonOp::Greater => Some(Bound::Excluded(value)),
        _ => None,
    }
}

fn upper_bound((op, value): (ComparisonOp, f64)) -> Option<Bound<f64>> {
    match op {
        ComparisonOp::LessOrEqual => Some(Bound::Included(value)),
        ComparisonOp::Less => Some(Bound::Excluded(value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::evaluate;
    use crate::message::Message;
    use crate::topic::SubscriptionPath;
    use serde_json::json;

    #[test]
    fn test_broker_config_deserialization() -> Result<(), Box<dyn std::error::Error>> {
        let json = r#"
        {"delivery": {"enqueueTimeoutMillis": 250},
         "topics": [
            {"id": "prices", "fifo": true, "dedupWindowSecs": 60, "subscriptions": [
                {"id": "main", "destination": "MainQueue"},
                {"id": "replay-fifo", "destination": "ReplayFifoQueue", "ordering": "fifo", "replay": true,
                 "filterPolicyScope": "MessageBody",
                 "filterPolicy": {"priceUpdateType": [{"anything-but": ["sale"]}]}}
            ]}
         ]}
        "#;
        let config = BrokerConfig::from_json(json)?;
        let settings = config.delivery_settings();
        assert_eq!(settings.enqueue_timeout, Duration::from_millis(250));
        assert_eq!(settings.group_idle_timeout, DeliverySettings::default().group_idle_timeout);

        let topics = config.topics()?;
        assert_eq!(topics.len(), 1);
        let topic = &topics[0];
        assert!(topic.is_ordered());
        assert!(topic.content_based_dedup());
        assert_eq!(topic.dedup_window(), Duration::from_secs(60));

        let main = topic.subscription("main").ok_or("missing main")?;
        assert!(main.is_active());
        assert!(main.filter_policy().is_none());

        let replay = topic.subscription("replay-fifo").ok_or("missing replay")?;
        assert_eq!(replay.path(), SubscriptionPath::Replay);
        assert_eq!(replay.ordering(), DeliveryOrdering::Fifo);
        assert!(!replay.is_active());
        let policy = replay.filter_policy().ok_or("missing policy")?;
        assert_eq!(policy.scope(), FilterScope::Body);
        assert_eq!(
            policy.predicates("priceUpdateType"),
            Some(&[Predicate::denylist(["sale"])][..])
        );
        Ok(())
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            BrokerConfig::from_json("{\"topics\": 7}"),
            Err(ConfigError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_fifo_subscription_on_standard_topic_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let json = r#"
        {"topics": [{"id": "t", "subscriptions": [{"id": "s", "destination": "Q", "ordering": "fifo"}]}]}
        "#;
        let config = BrokerConfig::from_json(json)?;
        assert!(matches!(
            config.topics(),
            Err(ConfigError::FifoSubscriptionOnStandardTopic { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_parse_allowlist() -> Result<(), ConfigError> {
        let policy = parse_filter_policy(
            FilterScope::Attributes,
            Composition::All,
            &json!({"insurance_type": ["car", "boat"]}),
        )?;
        assert_eq!(
            policy.predicates("insurance_type"),
            Some(&[Predicate::allowlist(["boat", "car"])][..])
        );
        Ok(())
    }

    #[test]
    fn test_parse_numeric_conditions() -> Result<(), ConfigError> {
        let policy = parse_filter_policy(
            FilterScope::Body,
            Composition::Any,
            &json!({
                "car": ["volvo"],
                "year": [{"numeric": [">=", 2008, "<=", 2010]}, {"numeric": [">=", 2020]}]
            }),
        )?;
        assert_eq!(
            policy.predicates("year"),
            Some(
                &[
                    Predicate::between(2008.0, 2010.0),
                    Predicate::compare(ComparisonOp::GreaterOrEqual, 2020.0)
                ][..]
            )
        );
        assert!(evaluate(Some(&policy), &Message::new(r#"{"car": "volvo", "year": 2009}"#)));
        assert!(evaluate(Some(&policy), &Message::new(r#"{"car": "volvo", "year": 2022}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"car": "volvo", "year": 2015}"#)));
        Ok(())
    }

    #[test]
    fn test_parse_reversed_and_exclusive_range() -> Result<(), ConfigError> {
        let policy = parse_filter_policy(
            FilterScope::Attributes,
            Composition::All,
            &json!({"size": [{"numeric": ["<", 10, ">", 0]}]}),
        )?;
        assert_eq!(
            policy.predicates("size"),
            Some(
                &[Predicate::NumericRange {
                    start: Bound::Excluded(0.0),
                    stop: Bound::Excluded(10.0)
                }][..]
            )
        );
        Ok(())
    }

    #[test]
    fn test_parse_bare_number_and_nested_body_field() -> Result<(), ConfigError> {
        let policy = parse_filter_policy(
            FilterScope::Body,
            Composition::All,
            &json!({"order": {"quantity": [3]}}),
        )?;
        assert!(evaluate(Some(&policy), &Message::new(r#"{"order": {"quantity": 3}}"#)));
        assert!(!evaluate(Some(&policy), &Message::new(r#"{"order": {"quantity": 4}}"#)));
        Ok(())
    }

    #[test]
    fn test_exact_value_lists() -> Result<(), ConfigError> {
        let strings = parse_filter_policy(FilterScope::Body, Composition::All, &json!({"q": ["3", "4"]}))?;
        assert!(evaluate(Some(&strings), &Message::new(r#"{"q": "3"}"#)));
        assert!(evaluate(Some(&strings), &Message::new(r#"{"q": "4"}"#)));

        for document in [json!({"q": [3, 4]}), json!({"q": ["3", 4]})] {
            assert!(matches!(
                parse_filter_policy(FilterScope::Body, Composition::All, &document),
                Err(ConfigError::MalformedPolicy { .. })
            ));
        }

        let numbers = parse_filter_policy(FilterScope::Body, Composition::Any, &json!({"q": [3, 4]}))?;
        assert!(evaluate(Some(&numbers), &Message::new(r#"{"q": 3}"#)));
        assert!(evaluate(Some(&numbers), &Message::new(r#"{"q": 4}"#)));
        assert!(!evaluate(Some(&numbers), &Message::new(r#"{"q": 5}"#)));
        Ok(())
    }

    #[test]
    fn test_parse_malformed_policies() {
        let cases = [
            (FilterScope::Attributes, json!(["car"])),
            (FilterScope::Attributes, json!({})),
            (FilterScope::Attributes, json!({"a": []})),
            (FilterScope::Attributes, json!({"a": "car"})),
            (FilterScope::Attributes, json!({"a": {"b": ["c"]}})),
            (FilterScope::Attributes, json!({"a": [true]})),
            (FilterScope::Attributes, json!({"a": [{"prefix": "x"}]})),
            (FilterScope::Attributes, json!({"a": [{"numeric": [">=", "ten"]}]})),
            (FilterScope::Attributes, json!({"a": [{"numeric": [">=", 1, ">=", 2]}]})),
            (FilterScope::Attributes, json!({"a": [{"numeric": [">=", 1, "<="]}]})),
            (FilterScope::Attributes, json!({"a": [{"numeric": [">=", 5, "<=", 1]}]})),
            (FilterScope::Attributes, json!({"a": [{"anything-but": [1]}]})),
            (FilterScope::Body, json!({"a": [{"numeric": [">", 1], "anything-but": ["x"]}]})),
        ];
        for (scope, document) in cases {
            assert!(
                parse_filter_policy(scope, Composition::All, &document).is_err(),
                "accepted {}",
                document
            );
        }
    }
}
