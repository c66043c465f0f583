//! In-memory broker
//!
//! A single topic exchange with named queues, AMQP-style bindings and
//! manual acknowledgement. Nacked deliveries with `requeue` go back to the
//! head of their queue flagged as redelivered. Used for local runs and tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use super::{
    topic_matches, BrokerError, InboundMessage, MessagePublisher, MessageSource,
    OutboundMessage, CAUSATION_ID_HEADER,
};

#[derive(Debug, Default)]
struct QueueState {
    bindings: Vec<String>,
    ready: VecDeque<InboundMessage>,
    unacked: HashMap<u64, InboundMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    published: Vec<OutboundMessage>,
    failing_publishes: u32,
    next_tag: u64,
}

impl Inner {
    fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

/// In-process topic exchange; clones share the same exchange
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a queue bound with the given topic patterns
    pub fn declare_queue(&self, name: &str, bindings: &[&str]) {
        let mut inner = self.inner();
        let queue = inner.queues.entry(name.to_string()).or_default();
        for binding in bindings {
            if !queue.bindings.iter().any(|b| b == binding) {
                queue.bindings.push(binding.to_string());
            }
        }
    }

    /// Consumer handle for one queue
    pub fn source(&self, queue: &str) -> MemorySource {
        MemorySource {
            broker: self.clone(),
            queue: queue.to_string(),
        }
    }

    /// Every message accepted by the exchange, in publish order
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.inner().published.clone()
    }

    /// The next `n` publishes fail as if the broker were down
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner().failing_publishes = n;
    }

    /// Deliveries waiting in a queue
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out but not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner().queues.get(queue).map_or(0, |q| q.unacked.len())
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut inner = self.inner();

        if inner.failing_publishes > 0 {
            inner.failing_publishes -= 1;
            return Err(BrokerError::Unavailable("connection refused".to_string()));
        }

        let mut headers = HashMap::new();
        headers.insert(CAUSATION_ID_HEADER.to_string(), message.causation_id.to_string());
        headers.insert("content-type".to_string(), message.content_type.to_string());

        let targets: Vec<String> = inner
            .queues
            .iter()
            .filter(|(_, q)| q.bindings.iter().any(|b| topic_matches(b, &message.routing_key)))
            .map(|(name, _)| name.clone())
            .collect();

        for name in targets {
            let delivery_tag = inner.next_tag();
            let delivery = InboundMessage {
                delivery_tag,
                message_id: Some(message.message_id.to_string()),
                routing_key: message.routing_key.clone(),
                correlation_id: Some(message.correlation_id.to_string()),
                headers: headers.clone(),
                body: message.body.clone(),
                redelivered: false,
            };
            if let Some(queue) = inner.queues.get_mut(&name) {
                queue.ready.push_back(delivery);
                queue.notify.notify_one();
            }
        }

        inner.published.push(message);
        Ok(())
    }
}

/// Consumer handle for one queue of an [`InMemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemorySource {
    broker: InMemoryBroker,
    queue: String,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn receive(&self) -> Result<Option<InboundMessage>, BrokerError> {
        loop {
            let notify = {
                let mut inner = self.broker.inner();
                let queue = inner
                    .queues
                    .get_mut(&self.queue)
                    .ok_or_else(|| BrokerError::Consume(format!("no queue '{}'", self.queue)))?;

                if let Some(delivery) = queue.ready.pop_front() {
                    queue.unacked.insert(delivery.delivery_tag, delivery.clone());
                    return Ok(Some(delivery));
                }
                queue.notify.clone()
            };

            notify.notified().await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut inner = self.broker.inner();
        inner
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&delivery_tag))
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(delivery_tag))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut inner = self.broker.inner();
        let new_tag = inner.next_tag();

        let queue = inner
            .queues
            .get_mut(&self.queue)
            .ok_or(BrokerError::UnknownDelivery(delivery_tag))?;
        let mut delivery = queue
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDelivery(delivery_tag))?;

        if requeue {
            delivery.delivery_tag = new_tag;
            delivery.redelivered = true;
            queue.ready.push_front(delivery);
            queue.notify.notify_one();
        }
        Ok(())
    }
}
