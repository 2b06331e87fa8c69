//!
//! This module defines the enqueue boundary between the broker and its consumers.
//!
use crate::error::EnqueueError;
use crate::message::Message;
use crate::topic::SubscriptionId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{trace, warn};
use uuid::Uuid;

/// An opaque enqueue target bound to one or more subscriptions.
///
/// `enqueue` returning `Ok` means the destination has taken ownership of the delivery;
/// the broker never waits for it to be processed except to sequence FIFO groups.
#[async_trait]
pub trait Destination: Send + Sync + 'static {
    async fn enqueue(&self, delivery: Delivery) -> Result<(), EnqueueError>;
}

/// One independent copy of a message on its way to a subscription.
#[derive(Debug)]
pub struct Delivery {
    subscription: SubscriptionId,
    message: Message,

    /// Present on FIFO deliveries; the group's next message waits on it.
    receipt: Option<oneshot::Sender<()>>,
}

impl Delivery {
    pub(crate) fn new(subscription: SubscriptionId, message: Message) -> Self {
        Delivery {
            subscription,
            message,
            receipt: None,
        }
    }

    pub(crate) fn ordered(
        subscription: SubscriptionId,
        message: Message,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery {
            subscription,
            message,
            receipt: Some(tx),
        };
        (delivery, rx)
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn is_ordered(&self) -> bool {
        self.receipt.is_some()
    }

    /// Marks the delivery processed, making the next message of its group visible.
    ///
    /// Dropping a delivery without acknowledging it releases the group as well.
    pub fn ack(mut self) {
        if let Some(receipt) = self.receipt.take() {
            let _ = receipt.send(());
        }
    }
}

/// In-process queue backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    name: String,
    sender: mpsc::Sender<Delivery>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queue = MemoryQueue {
            name: name.into(),
            sender,
        };
        (queue, receiver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Destination for MemoryQueue {
    async fn enqueue(&self, delivery: Delivery) -> Result<(), EnqueueError> {
        self.sender
            .send(delivery)
            .await
            .map_err(|_e| EnqueueError::Closed(self.name.clone()))
    }
}

/// A delivery that could not be handed to its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub topic: String,
    pub subscription: SubscriptionId,
    pub destination: String,
    pub message_id: Uuid,
    pub error: EnqueueError,
}

/// Carries deliveries for one subscription to its destination.
///
/// Failures are logged and broadcast to the operational channel, never returned to the publisher.
#[derive(Clone)]
pub(crate) struct Courier {
    topic: String,
    subscription: SubscriptionId,
    destination_name: String,
    destination: Arc<dyn Destination>,
    enqueue_timeout: Duration,
    failures: broadcast::Sender<DeliveryFailure>,
}

impl Courier {
    pub(crate) fn new(
        topic: &str,
        subscription: &str,
        destination_name: &str,
        destination: Arc<dyn Destination>,
        enqueue_timeout: Duration,
        failures: broadcast::Sender<DeliveryFailure>,
    ) -> Self {
        Courier {
            topic: topic.to_owned(),
            subscription: subscription.to_owned(),
            destination_name: destination_name.to_owned(),
            destination,
            enqueue_timeout,
            failures,
        }
    }

    pub(crate) fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Returns whether the destination accepted the delivery.
    pub(crate) async fn send(&self, delivery: Delivery) -> bool {
        let message_id = delivery.message().id();
        let result = match timeout(self.enqueue_timeout, self.destination.enqueue(delivery)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(EnqueueError::Timeout(
                self.destination_name.clone(),
                self.enqueue_timeout,
            )),
        };

        match result {
            Ok(()) => {
                trace!(topic = %self.topic, subscription = %self.subscription, %message_id, "Delivered");
                true
            }
            Err(error) => {
                warn!(
                    topic = %self.topic,
                    subscription = %self.subscription,
                    destination = %self.destination_name,
                    %message_id,
                    %error,
                    "Failed to enqueue delivery"
                );
                // No receiver simply means nobody is watching.
                let _ = self.failures.send(DeliveryFailure {
                    topic: self.topic.clone(),
                    subscription: self.subscription.clone(),
                    destination: self.destination_name.clone(),
                    message_id,
                    error,
                });
                false
            }
        }
    }
}
