//!
//! This module defines the single-writer-per-group sequencer used by FIFO subscriptions.
//!
//! Each active group owns one worker task. The worker hands a message to the destination,
//! waits for the delivery to be acknowledged (or dropped), and only then takes the next one,
//! so at most one message per group is in flight to the destination. Groups are independent.
//!
use crate::destination::{Courier, Delivery};
use crate::message::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

type Groups = HashMap<String, mpsc::UnboundedSender<Message>>;

/// Per-group FIFO delivery for one subscription.
///
/// Group queues are unbounded. A consumer that never acknowledges a delivery stalls its group:
/// later messages for that group accumulate without limit and its worker is never retired.
pub(crate) struct GroupSequencer {
    courier: Courier,
    idle_timeout: Duration,

    /// group id -> queue of the group's worker
    groups: Arc<Mutex<Groups>>,
}

impl GroupSequencer {
    pub(crate) fn new(courier: Courier, idle_timeout: Duration) -> Self {
        GroupSequencer {
            courier,
            idle_timeout,
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Appends a message to its group. Never waits on the destination.
    ///
    /// Messages submitted for the same group are delivered in submission order.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime and the group has no running worker.
    pub(crate) fn submit(&self, group_id: &str, message: Message) {
        let mut groups = lock_groups(&self.groups);
        let message = match groups.get(group_id) {
            Some(sender) => match sender.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive until the worker below is spawned.
        let _ = sender.send(message);
        groups.insert(group_id.to_owned(), sender);
        drop(groups);

        let worker = GroupWorker {
            group_id: group_id.to_owned(),
            courier: self.courier.clone(),
            idle_timeout: self.idle_timeout,
            groups: Arc::clone(&self.groups),
        };
        tokio::spawn(worker.run(receiver));
    }

    #[cfg(test)]
    pub(crate) fn active_groups(&self) -> usize {
        lock_groups(&self.groups).len()
    }
}

struct GroupWorker {
    group_id: String,
    courier: Courier,
    idle_timeout: Duration,
    groups: Arc<Mutex<Groups>>,
}

impl GroupWorker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<Message>) {
        debug!(subscription = %self.courier.subscription(), group = %self.group_id, "Group worker started");
        loop {
            let message = match timeout(self.idle_timeout, receiver.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_idle) => match self.retire_or_take(&mut receiver) {
                    Some(message) => message,
                    None => break,
                },
            };
            self.deliver(message).await;
        }
        debug!(subscription = %self.courier.subscription(), group = %self.group_id, "Group worker retired");
    }

    /// Unregisters the group unless a message raced in. Submitters hold the same lock,
    /// so nothing can be queued once the entry is gone.
    fn retire_or_take(&self, receiver: &mut mpsc::UnboundedReceiver<Message>) -> Option<Message> {
        let mut groups = lock_groups(&self.groups);
        match receiver.try_recv() {
            Ok(message) => Some(message),
            Err(_) => {
                groups.remove(&self.group_id);
                None
            }
        }
    }

    async fn deliver(&self, message: Message) {
        let (delivery, processed) = Delivery::ordered(self.courier.subscription().to_owned(), message);
        if self.courier.send(delivery).await && processed.await.is_err() {
            debug!(
                subscription = %self.courier.subscription(),
                group = %self.group_id,
                "Delivery dropped without acknowledgement, releasing group"
            );
        }
    }
}

fn lock_groups(groups: &Mutex<Groups>) -> MutexGuard<'_, Groups> {
    match groups.lock() {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Group table lock is poisoned, recovering");
            e.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{DeliveryFailure, MemoryQueue};
    use tokio::sync::broadcast;

    fn sequencer(idle: Duration) -> (GroupSequencer, mpsc::Receiver<Delivery>, broadcast::Receiver<DeliveryFailure>) {
        let (queue, receiver) = MemoryQueue::new("Fifo", 16);
        let (failures, failure_rx) = broadcast::channel(16);
        let courier = Courier::new("t", "ordered", "Fifo", Arc::new(queue), Duration::from_secs(1), failures);
        (GroupSequencer::new(courier, idle), receiver, failure_rx)
    }

    async fn next(receiver: &mut mpsc::Receiver<Delivery>) -> Delivery {
        timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn test_next_message_waits_for_ack() {
        let (sequencer, mut receiver, _failures) = sequencer(Duration::from_secs(60));
        let m1 = Message::new("1");
        let m2 = Message::new("2");
        sequencer.submit("G1", m1.clone());
        sequencer.submit("G1", m2.clone());

        let d1 = next(&mut receiver).await;
        assert_eq!(d1.message(), &m1);
        assert!(d1.is_ordered());
        assert!(timeout(Duration::from_millis(100), receiver.recv()).await.is_err());

        d1.ack();
        let d2 = next(&mut receiver).await;
        assert_eq!(d2.message(), &m2);
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let (sequencer, mut receiver, _failures) = sequencer(Duration::from_secs(60));
        sequencer.submit("G1", Message::new("g1-a"));
        sequencer.submit("G1", Message::new("g1-b"));
        sequencer.submit("G2", Message::new("g2-a"));

        // Both group heads are in flight at once, G1's second message is held back.
        let first = next(&mut receiver).await;
        let second = next(&mut receiver).await;
        let mut bodies = vec![first.message().body().clone(), second.message().body().clone()];
        bodies.sort();
        assert_eq!(bodies, vec!["g1-a", "g2-a"]);
        assert!(timeout(Duration::from_millis(100), receiver.recv()).await.is_err());
        assert_eq!(sequencer.active_groups(), 2);
    }

    #[tokio::test]
    async fn test_dropped_delivery_releases_group() {
        let (sequencer, mut receiver, _failures) = sequencer(Duration::from_secs(60));
        sequencer.submit("G1", Message::new("1"));
        sequencer.submit("G1", Message::new("2"));
        drop(next(&mut receiver).await);
        assert_eq!(&next(&mut receiver).await.message().body()[..], b"2");
    }

    #[tokio::test]
    async fn test_failed_enqueue_moves_on() {
        let (sequencer, receiver, mut failures) = sequencer(Duration::from_secs(60));
        drop(receiver);
        let m1 = Message::new("1");
        let m2 = Message::new("2");
        sequencer.submit("G1", m1.clone());
        sequencer.submit("G1", m2.clone());

        let first = failures.recv().await.expect("failure reported");
        let second = failures.recv().await.expect("failure reported");
        assert_eq!(first.message_id, m1.id());
        assert_eq!(second.message_id, m2.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_group_is_retired() {
        let (sequencer, mut receiver, _failures) = sequencer(Duration::from_secs(5));
        sequencer.submit("G1", Message::new("1"));
        next(&mut receiver).await.ack();
        assert_eq!(sequencer.active_groups(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sequencer.active_groups(), 0);

        sequencer.submit("G1", Message::new("2"));
        assert_eq!(&next(&mut receiver).await.message().body()[..], b"2");
    }
}
