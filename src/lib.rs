//! This crate provides a publish/subscribe fanout broker: a message published once to a topic is
//! copied to every active subscription whose filter policy matches it, with per-group ordering and
//! duplicate suppression on ordered topics.
pub mod broker;
pub mod config;
pub mod destination;
pub mod error;
pub mod filter;
pub mod message;
pub mod ordering;
pub mod route;
mod sequencer;
pub mod topic;

pub use broker::{Broker, BrokerBuilder, DeliverySettings, PublishResult};
pub use config::BrokerConfig;
pub use destination::{Delivery, DeliveryFailure, Destination, MemoryQueue};
pub use error::{BrokerError, ConfigError, EnqueueError};
pub use filter::{evaluate, ComparisonOp, Composition, FilterPolicy, FilterScope, Predicate};
pub use message::{Message, PublishRequest};
pub use topic::{DeliveryOrdering, Subscription, SubscriptionId, SubscriptionPath, Topic};
