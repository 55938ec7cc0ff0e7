//! In-process broker with named queues and manual acknowledgment.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use pilot_model::{MessageId, Payload};
use tokio::{sync::Notify, time::Instant};
use tracing::trace;

use super::{Broker, Message, PubResource, SubResource};
use crate::error::BrokerError;

/// Shared in-memory broker.
///
/// Cloning is cheap; every clone sees the same queues. A nacked delivery is dead-lettered unless
/// requeueing was enabled with [`MemoryBroker::with_requeue_on_nack`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    unacked: HashMap<MessageId, Delivery>,
    acked: Vec<MessageId>,
    nacked: Vec<MessageId>,
    next_consumer: u64,
    requeue_on_nack: bool,
    keepalive: bool,
    keepalives: u64,
    fail_ack: bool,
    fail_nack: bool,
    fail_publish: bool,
}

struct Delivery {
    queue: String,
    consumer: u64,
    message: Message,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requeue_on_nack(self, on: bool) -> Self {
        self.shared.lock().requeue_on_nack = on;
        self
    }

    /// Make resources report that they need keep-alive probes.
    pub fn with_keepalive(self, on: bool) -> Self {
        self.shared.lock().keepalive = on;
        self
    }

    /// Append a payload to `queue` under a fresh id.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Payload>) -> MessageId {
        let msg = Message::new(uuid::Uuid::new_v4().to_string(), payload.into());
        let id = msg.id.clone();
        self.enqueue_message(queue, msg);
        id
    }

    pub fn enqueue_message(&self, queue: &str, msg: Message) {
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(msg);
        self.shared.notify.notify_waiters();
    }

    /// Payloads currently waiting in `queue`, oldest first.
    pub fn payloads(&self, queue: &str) -> Vec<Payload> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove and return every message waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Message> {
        self.shared
            .lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn acked(&self) -> Vec<MessageId> {
        self.shared.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<MessageId> {
        self.shared.lock().nacked.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    pub fn keepalives(&self) -> u64 {
        self.shared.lock().keepalives
    }

    /// Make every following ack fail.
    pub fn fail_acks(&self, on: bool) {
        self.shared.lock().fail_ack = on;
    }

    pub fn fail_nacks(&self, on: bool) {
        self.shared.lock().fail_nack = on;
    }

    pub fn fail_publishes(&self, on: bool) {
        self.shared.lock().fail_publish = on;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_sub(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn SubResource>, BrokerError> {
        let consumer = {
            let mut st = self.shared.lock();
            st.next_consumer += 1;
            st.queues.entry(queue.to_string()).or_default();
            st.next_consumer
        };
        trace!(target: "pilot.core.broker", queue, prefetch, consumer, "subscribe");
        Ok(Box::new(MemorySub {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            consumer,
            prefetch: usize::from(prefetch.max(1)),
            timeout: Duration::from_secs(1),
        }))
    }

    async fn open_pub(&self, queue: &str) -> Result<Box<dyn PubResource>, BrokerError> {
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(Box::new(MemoryPub {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
        }))
    }
}

struct MemorySub {
    shared: Arc<Shared>,
    queue: String,
    consumer: u64,
    prefetch: usize,
    timeout: Duration,
}

impl MemorySub {
    fn try_take(&self) -> Option<Message> {
        let mut st = self.shared.lock();
        let in_flight = st
            .unacked
            .values()
            .filter(|d| d.consumer == self.consumer)
            .count();
        if in_flight >= self.prefetch {
            return None;
        }
        let msg = st.queues.get_mut(&self.queue)?.pop_front()?;
        st.unacked.insert(
            msg.id.clone(),
            Delivery {
                queue: self.queue.clone(),
                consumer: self.consumer,
                message: msg.clone(),
            },
        );
        Some(msg)
    }
}

#[async_trait]
impl SubResource for MemorySub {
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn next_message(&mut self) -> Result<Message, BrokerError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            // Registered before the check so a concurrent enqueue is not missed.
            let notified = self.shared.notify.notified();
            if let Some(msg) = self.try_take() {
                return Ok(msg);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BrokerError::NoMessage);
            }
        }
    }

    async fn ack(&self, msg: &Message) -> Result<(), BrokerError> {
        {
            let mut st = self.shared.lock();
            if st.fail_ack {
                return Err(BrokerError::Ack(format!("ack rejected for {}", msg.id)));
            }
            if st.unacked.remove(&msg.id).is_none() {
                return Err(BrokerError::Ack(format!("unknown delivery {}", msg.id)));
            }
            st.acked.push(msg.id.clone());
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, msg: &Message) -> Result<(), BrokerError> {
        {
            let mut st = self.shared.lock();
            if st.fail_nack {
                return Err(BrokerError::Nack(format!("nack rejected for {}", msg.id)));
            }
            let Some(delivery) = st.unacked.remove(&msg.id) else {
                return Err(BrokerError::Nack(format!("unknown delivery {}", msg.id)));
            };
            st.nacked.push(msg.id.clone());
            if st.requeue_on_nack {
                let mut again = delivery.message;
                again.redelivered = true;
                st.queues.entry(delivery.queue).or_default().push_front(again);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn needs_keepalive(&self) -> bool {
        self.shared.lock().keepalive
    }

    async fn keepalive(&self) -> Result<(), BrokerError> {
        self.shared.lock().keepalives += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        {
            let mut st = self.shared.lock();
            let mine: Vec<MessageId> = st
                .unacked
                .iter()
                .filter(|(_, d)| d.consumer == self.consumer)
                .map(|(id, _)| id.clone())
                .collect();
            for id in mine {
                if let Some(d) = st.unacked.remove(&id) {
                    let mut again = d.message;
                    again.redelivered = true;
                    st.queues.entry(d.queue).or_default().push_front(again);
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryPub {
    shared: Arc<Shared>,
    queue: String,
}

#[async_trait]
impl PubResource for MemoryPub {
    async fn send(&self, payload: &Payload) -> Result<(), BrokerError> {
        {
            let mut st = self.shared.lock();
            if st.fail_publish {
                return Err(BrokerError::Publish(format!("queue {} refused message", self.queue)));
            }
            let msg = Message::new(uuid::Uuid::new_v4().to_string(), payload.clone());
            st.queues.entry(self.queue.clone()).or_default().push_back(msg);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn needs_keepalive(&self) -> bool {
        self.shared.lock().keepalive
    }

    async fn keepalive(&self) -> Result<(), BrokerError> {
        self.shared.lock().keepalives += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_and_tracks_acks() {
        let broker = MemoryBroker::new();
        let a = broker.enqueue("in", "a");
        let b = broker.enqueue("in", "b");

        let mut sub = broker.open_sub("in", 10).await.unwrap();
        let m1 = sub.next_message().await.unwrap();
        let m2 = sub.next_message().await.unwrap();
        assert_eq!(m1.id, a);
        assert_eq!(m2.id, b);
        assert_eq!(broker.unacked_count(), 2);

        sub.ack(&m1).await.unwrap();
        sub.nack(&m2).await.unwrap();
        assert_eq!(broker.acked(), vec![a]);
        assert_eq!(broker.nacked(), vec![b]);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_len("in"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_times_out() {
        let broker = MemoryBroker::new();
        let mut sub = broker.open_sub("in", 1).await.unwrap();
        sub.set_timeout(Duration::from_secs(3));

        let started = Instant::now();
        let err = sub.next_message().await.unwrap_err();
        assert_eq!(err, BrokerError::NoMessage);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_holds_back_deliveries() {
        let broker = MemoryBroker::new();
        broker.enqueue("in", "a");
        broker.enqueue("in", "b");

        let mut sub = broker.open_sub("in", 1).await.unwrap();
        sub.set_timeout(Duration::from_millis(100));
        let first = sub.next_message().await.unwrap();
        assert_eq!(sub.next_message().await.unwrap_err(), BrokerError::NoMessage);

        sub.ack(&first).await.unwrap();
        let second = sub.next_message().await.unwrap();
        assert_eq!(second.payload, Payload::from("b"));
    }

    #[tokio::test]
    async fn wakes_up_on_enqueue() {
        let broker = MemoryBroker::new();
        let mut sub = broker.open_sub("in", 1).await.unwrap();
        sub.set_timeout(Duration::from_secs(5));

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue("in", "late");
        });

        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.payload, Payload::from("late"));
    }

    #[tokio::test]
    async fn requeue_and_close_return_deliveries() {
        let broker = MemoryBroker::new().with_requeue_on_nack(true);
        broker.enqueue("in", "x");
        broker.enqueue("in", "y");

        let mut sub = broker.open_sub("in", 5).await.unwrap();
        let x = sub.next_message().await.unwrap();
        sub.nack(&x).await.unwrap();
        assert_eq!(broker.queue_len("in"), 2);

        let again = sub.next_message().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.id, x.id);

        sub.close().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_len("in"), 2);
    }

    #[tokio::test]
    async fn publish_and_failure_injection() {
        let broker = MemoryBroker::new();
        let publisher = broker.open_pub("out").await.unwrap();
        publisher.send(&Payload::from("r1")).await.unwrap();
        assert_eq!(broker.payloads("out"), vec![Payload::from("r1")]);

        broker.fail_publishes(true);
        assert!(matches!(
            publisher.send(&Payload::from("r2")).await,
            Err(BrokerError::Publish(_))
        ));
        assert_eq!(broker.queue_len("out"), 1);
    }
}
