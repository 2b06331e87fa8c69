//!
//! This module defines the broker: the publish entry point that ties the ordering manager,
//! the router and the per-subscription delivery targets together.
//!
use crate::config::BrokerConfig;
use crate::destination::{Courier, Delivery, DeliveryFailure, Destination};
use crate::error::{BrokerError, ConfigError};
use crate::message::Message;
use crate::ordering::{Admission, OrderingManager};
use crate::route;
use crate::sequencer::GroupSequencer;
use crate::topic::{DeliveryOrdering, Subscription, SubscriptionId, SubscriptionPath, Topic};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Longest a single destination may take to accept a delivery.
    pub enqueue_timeout: Duration,

    /// FIFO group workers with no traffic for this long are retired.
    pub group_idle_timeout: Duration,

    pub failure_channel_capacity: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        DeliverySettings {
            enqueue_timeout: Duration::from_secs(5),
            group_idle_timeout: Duration::from_secs(60),
            failure_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub message_id: Uuid,

    pub accepted: bool,

    /// The publish repeated a dedup key seen within the window and produced no deliveries.
    pub deduped: bool,

    /// Subscriptions a copy was handed off to.
    pub routed: Vec<SubscriptionId>,
}

enum Target {
    Standard(Courier),
    Fifo(GroupSequencer),
}

struct TopicRuntime {
    topic: Topic,

    /// Present on ordered topics only.
    ordering: Option<Mutex<OrderingManager>>,

    targets: HashMap<SubscriptionId, Target>,
}

impl TopicRuntime {
    fn fan_out(&self, message: &Message) -> Vec<SubscriptionId> {
        let mut routed = Vec::new();
        for subscription in route::matching(&self.topic, message) {
            let Some(target) = self.targets.get(subscription.id()) else {
                continue;
            };
            match target {
                Target::Standard(courier) => {
                    let courier = courier.clone();
                    let delivery = Delivery::new(subscription.id().to_owned(), message.clone());
                    tokio::spawn(async move {
                        courier.send(delivery).await;
                    });
                }
                Target::Fifo(sequencer) => match message.group_id() {
                    Some(group_id) => sequencer.submit(group_id, message.clone()),
                    None => continue,
                },
            }
            routed.push(subscription.id().to_owned());
        }
        routed
    }
}

/// Publish/subscribe fanout broker.
///
/// Topic and subscription definitions are fixed once built; only replay activation changes.
pub struct Broker {
    topics: HashMap<String, TopicRuntime>,

    /// subscription id -> topic id
    subscriptions: HashMap<SubscriptionId, String>,

    failures: broadcast::Sender<DeliveryFailure>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    /// Assembles a broker from static configuration, binding destination names to implementations.
    ///
    /// # Errors
    /// Raise ConfigError if the configuration is invalid or names a destination that is not supplied.
    pub fn from_config<I>(config: &BrokerConfig, destinations: I) -> Result<Broker, ConfigError>
    where
        I: IntoIterator<Item = (String, Arc<dyn Destination>)>,
    {
        let mut builder = Broker::builder().settings(config.delivery_settings());
        for (name, destination) in destinations {
            builder = builder.shared_destination(name, destination);
        }
        for topic in config.topics()? {
            builder = builder.topic(topic);
        }
        builder.build()
    }

    /// Publishes a message to a topic.
    ///
    /// Returns once every matching subscription has been handed a copy for delivery; it never
    /// waits on a destination.
    ///
    /// # Errors
    /// Raise BrokerError::UnknownTopic for an unknown topic, and a configuration error when an
    /// ordered topic receives a message without a group id. Rejected publishes deliver nothing.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime and the message matches a subscription.
    pub fn publish(&self, topic_id: &str, message: Message) -> Result<PublishResult, BrokerError> {
        let runtime = self.runtime(topic_id)?;
        let message_id = message.id();

        let Some(ordering) = &runtime.ordering else {
            let message = message.stamp(SystemTime::now(), None);
            let routed = runtime.fan_out(&message);
            debug!(topic = topic_id, %message_id, routed = routed.len(), "Published");
            return Ok(PublishResult {
                message_id,
                accepted: true,
                deduped: false,
                routed,
            });
        };

        let mut ordering = lock(ordering);
        match ordering.admit(&message, Instant::now())? {
            Admission::Duplicate { dedup_key } => {
                info!(topic = topic_id, %message_id, %dedup_key, "Duplicate publish collapsed");
                Ok(PublishResult {
                    message_id,
                    accepted: true,
                    deduped: true,
                    routed: Vec::new(),
                })
            }
            Admission::Admitted { dedup_key } => {
                let message = message.stamp(SystemTime::now(), Some(dedup_key));
                // Fanning out under the lock keeps every group queue in admission order.
                let routed = runtime.fan_out(&message);
                drop(ordering);
                debug!(
                    topic = topic_id,
                    %message_id,
                    group = message.group_id().unwrap_or_default(),
                    routed = routed.len(),
                    "Published"
                );
                Ok(PublishResult {
                    message_id,
                    accepted: true,
                    deduped: false,
                    routed,
                })
            }
        }
    }

    /// Dry run of the router: the subscriptions `message` would currently be delivered to.
    pub fn route(&self, topic_id: &str, message: &Message) -> Result<Vec<SubscriptionId>, BrokerError> {
        Ok(route::route(&self.runtime(topic_id)?.topic, message))
    }

    /// Switches a replay subscription on or off.
    ///
    /// While off, the subscription is neither evaluated nor delivered to.
    pub fn set_replay_active(&self, subscription_id: &str, active: bool) -> Result<(), BrokerError> {
        let subscription = self.subscription(subscription_id)?;
        if subscription.path() != SubscriptionPath::Replay {
            return Err(ConfigError::NotReplaySubscription(subscription_id.to_owned()).into());
        }
        subscription.set_active(active);
        info!(subscription = subscription_id, active, "Replay subscription toggled");
        Ok(())
    }

    pub fn topic(&self, topic_id: &str) -> Option<&Topic> {
        self.topics.get(topic_id).map(|runtime| &runtime.topic)
    }

    pub fn subscription(&self, subscription_id: &str) -> Result<&Subscription, BrokerError> {
        self.subscriptions
            .get(subscription_id)
            .and_then(|topic_id| self.topics.get(topic_id))
            .and_then(|runtime| runtime.topic.subscription(subscription_id))
            .ok_or_else(|| BrokerError::UnknownSubscription(subscription_id.to_owned()))
    }

    /// Operational channel reporting deliveries a destination did not accept.
    pub fn delivery_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.failures.subscribe()
    }

    fn runtime(&self, topic_id: &str) -> Result<&TopicRuntime, BrokerError> {
        self.topics
            .get(topic_id)
            .ok_or_else(|| BrokerError::UnknownTopic(topic_id.to_owned()))
    }
}

fn lock(ordering: &Mutex<OrderingManager>) -> MutexGuard<'_, OrderingManager> {
    match ordering.lock() {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Ordering state lock is poisoned, recovering");
            e.into_inner()
        }
    }
}

#[derive(Default)]
pub struct BrokerBuilder {
    topics: Vec<Topic>,
    destinations: HashMap<String, Arc<dyn Destination>>,
    settings: DeliverySettings,
}

impl BrokerBuilder {
    pub fn topic(mut self, topic: Topic) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn destination(self, name: impl Into<String>, destination: impl Destination) -> Self {
        self.shared_destination(name, Arc::new(destination))
    }

    pub fn shared_destination(mut self, name: impl Into<String>, destination: Arc<dyn Destination>) -> Self {
        self.destinations.insert(name.into(), destination);
        self
    }

    pub fn settings(mut self, settings: DeliverySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Broker, ConfigError> {
        let (failures, _) = broadcast::channel(self.settings.failure_channel_capacity.max(1));
        let mut topics = HashMap::new();
        let mut subscriptions = HashMap::new();

        for topic in self.topics {
            topic.validate()?;
            if topics.contains_key(topic.id()) {
                return Err(ConfigError::DuplicateTopic(topic.id().to_owned()));
            }

            let mut targets = HashMap::new();
            for subscription in topic.subscriptions() {
                if subscriptions
                    .insert(subscription.id().to_owned(), topic.id().to_owned())
                    .is_some()
                {
                    return Err(ConfigError::DuplicateSubscription(subscription.id().to_owned()));
                }
                let destination = self
                    .destinations
                    .get(subscription.destination())
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownDestination(subscription.destination().to_owned()))?;
                let courier = Courier::new(
                    topic.id(),
                    subscription.id(),
                    subscription.destination(),
                    destination,
                    self.settings.enqueue_timeout,
                    failures.clone(),
                );
                let target = match subscription.ordering() {
                    DeliveryOrdering::Standard => Target::Standard(courier),
                    DeliveryOrdering::Fifo => {
                        Target::Fifo(GroupSequencer::new(courier, self.settings.group_idle_timeout))
                    }
                };
                targets.insert(subscription.id().to_owned(), target);
            }

            let ordering = topic
                .is_ordered()
                .then(|| Mutex::new(OrderingManager::new(&topic)));
            debug!(topic = topic.id(), subscriptions = targets.len(), ordered = topic.is_ordered(), "Topic ready");
            topics.insert(
                topic.id().to_owned(),
                TopicRuntime {
                    topic,
                    ordering,
                    targets,
                },
            );
        }

        Ok(Broker {
            topics,
            subscriptions,
            failures,
        })
    }
}
