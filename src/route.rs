//!
//! This module defines the fanout router, which picks the subscriptions a published message goes to.
//!
use crate::filter;
use crate::message::Message;
use crate::topic::{Subscription, SubscriptionId, Topic};

/// Ids of the active subscriptions of `topic` whose filter policy accepts `message`.
///
/// Inactive subscriptions are skipped before their policy is looked at. Order carries no meaning.
pub fn route(topic: &Topic, message: &Message) -> Vec<SubscriptionId> {
    matching(topic, message)
        .map(|subscription| subscription.id().to_owned())
        .collect()
}

pub(crate) fn matching<'a>(
    topic: &'a Topic,
    message: &'a Message,
) -> impl Iterator<Item = &'a Subscription> + 'a {
    topic
        .subscriptions()
        .iter()
        .filter(|subscription| subscription.is_active())
        .filter(move |subscription| filter::evaluate(subscription.filter_policy(), message))
}
