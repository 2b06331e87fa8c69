use crate::error::ConfigError;
use crate::filter::FilterPolicy;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub type SubscriptionId = String;

/// Dedup interval applied to ordered topics unless configured otherwise.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOrdering {
    #[default]
    Standard,

    /// Same-group messages are delivered one at a time, in publish order.
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionPath {
    #[default]
    Primary,

    /// Provisioned ahead of time and switched on only to redrive traffic.
    Replay,
}

/// Binds a destination to an optional filter policy.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,

    /// Name of the destination the broker resolves when it is built.
    destination: String,

    filter_policy: Option<FilterPolicy>,

    ordering: DeliveryOrdering,

    path: SubscriptionPath,

    /// The only part of a subscription that changes after setup.
    active: AtomicBool,
}

impl Subscription {
    pub fn new(id: impl Into<SubscriptionId>, destination: impl Into<String>) -> Self {
        Subscription {
            id: id.into(),
            destination: destination.into(),
            filter_policy: None,
            ordering: DeliveryOrdering::Standard,
            path: SubscriptionPath::Primary,
            active: AtomicBool::new(true),
        }
    }

    pub fn with_filter_policy(mut self, policy: FilterPolicy) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    pub fn with_ordering(mut self, ordering: DeliveryOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn fifo(self) -> Self {
        self.with_ordering(DeliveryOrdering::Fifo)
    }

    /// Moves the subscription onto the replay path. Replay subscriptions start inactive.
    pub fn replay(mut self) -> Self {
        self.path = SubscriptionPath::Replay;
        self.active = AtomicBool::new(false);
        self
    }

    pub fn with_active(self, active: bool) -> Self {
        self.set_active(active);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn filter_policy(&self) -> Option<&FilterPolicy> {
        self.filter_policy.as_ref()
    }

    pub fn ordering(&self) -> DeliveryOrdering {
        self.ordering
    }

    pub fn path(&self) -> SubscriptionPath {
        self.path
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

/// A named fanout point and its subscriptions.
#[derive(Debug)]
pub struct Topic {
    id: String,

    /// Ordered topics require a group id on every message and collapse duplicate publishes.
    ordered: bool,

    content_based_dedup: bool,

    dedup_window: Duration,

    subscriptions: Vec<Subscription>,
}

impl Topic {
    pub fn new(id: impl Into<String>) -> Self {
        Topic {
            id: id.into(),
            ordered: false,
            content_based_dedup: true,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            subscriptions: Vec::new(),
        }
    }

    pub fn fifo(id: impl Into<String>) -> Self {
        Topic {
            ordered: true,
            ..Topic::new(id)
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_content_based_dedup(mut self, enabled: bool) -> Self {
        self.content_based_dedup = enabled;
        self
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn content_based_dedup(&self) -> bool {
        self.content_based_dedup
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn subscription(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ordered && self.dedup_window.is_zero() {
            return Err(ConfigError::ZeroDedupWindow(self.id.clone()));
        }
        let mut seen = HashSet::new();
        for subscription in &self.subscriptions {
            if !seen.insert(subscription.id.as_str()) {
                return Err(ConfigError::DuplicateSubscription(subscription.id.clone()));
            }
            if subscription.ordering == DeliveryOrdering::Fifo && !self.ordered {
                return Err(ConfigError::FifoSubscriptionOnStandardTopic {
                    topic: self.id.clone(),
                    subscription: subscription.id.clone(),
                });
            }
            if let Some(policy) = &subscription.filter_policy {
                policy.validate()?;
            }
        }
        Ok(())
    }
}
