//! Message-bus abstraction for inter-broker RPC.
//!
//! Brokers talk to each other over a subject-addressed message bus with
//! publish, request/reply and subscription semantics. The trait keeps the
//! replication and metadata planes independent of the concrete transport;
//! [`InMemoryBus`] wires a whole cluster together inside one process for
//! tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ClusterError, ClusterResult};

/// A message delivered to a subscriber.
#[derive(Debug)]
pub struct BusMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Message payload.
    pub data: Bytes,
    /// Present when the sender expects a reply.
    pub reply: Option<ReplyHandle>,
}

/// One-shot reply channel for a request.
#[derive(Debug)]
pub struct ReplyHandle {
    tx: oneshot::Sender<Bytes>,
}

impl ReplyHandle {
    /// Sends the reply. Dropping the handle without responding surfaces as
    /// a timeout on the requester.
    pub fn respond(self, data: Bytes) {
        let _ = self.tx.send(data);
    }
}

/// An active subscription to a subject.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Receives the next message, or `None` once the subscription is dead.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// Subject-addressed transport between brokers.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publishes a fire-and-forget message to all subscribers of `subject`.
    async fn publish(&self, subject: &str, data: Bytes) -> ClusterResult<()>;

    /// Sends a request to one subscriber of `subject` and awaits the reply
    /// within `timeout`.
    async fn request(&self, subject: &str, data: Bytes, timeout: Duration)
        -> ClusterResult<Bytes>;

    /// Subscribes to `subject`.
    async fn subscribe(&self, subject: &str) -> ClusterResult<Subscription>;
}

const SUBSCRIPTION_DEPTH: usize = 256;

/// In-process bus connecting every broker in a test cluster.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
}

impl InMemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn senders_for(&self, subject: &str) -> Vec<mpsc::Sender<BusMessage>> {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(subject) {
            senders.retain(|s| !s.is_closed());
            senders.clone()
        } else {
            Vec::new()
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, data: Bytes) -> ClusterResult<()> {
        for sender in self.senders_for(subject) {
            let _ = sender
                .send(BusMessage {
                    subject: subject.to_string(),
                    data: data.clone(),
                    reply: None,
                })
                .await;
        }
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        data: Bytes,
        timeout: Duration,
    ) -> ClusterResult<Bytes> {
        let senders = self.senders_for(subject);
        if senders.is_empty() {
            return Err(ClusterError::NoResponders {
                subject: subject.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let mut reply = Some(ReplyHandle { tx });
        let mut delivered = false;
        for sender in senders {
            let Some(handle) = reply.take() else { break };
            match sender
                .send(BusMessage {
                    subject: subject.to_string(),
                    data: data.clone(),
                    reply: Some(handle),
                })
                .await
            {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(mpsc::error::SendError(msg)) => {
                    // Subscriber died between snapshot and send; try the next.
                    reply = msg.reply;
                }
            }
        }
        if !delivered {
            return Err(ClusterError::NoResponders {
                subject: subject.to_string(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => Err(ClusterError::Timeout {
                operation: "bus request",
            }),
        }
    }

    async fn subscribe(&self, subject: &str) -> ClusterResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        self.subscribers
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription { receiver: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fans_out() {
        let bus = InMemoryBus::new();
        let mut sub1 = bus.subscribe("topic").await.unwrap();
        let mut sub2 = bus.subscribe("topic").await.unwrap();

        bus.publish("topic", Bytes::from("hello")).await.unwrap();

        assert_eq!(sub1.recv().await.unwrap().data, Bytes::from("hello"));
        assert_eq!(sub2.recv().await.unwrap().data, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("echo").await.unwrap();

        let server = tokio::spawn(async move {
            let msg = sub.recv().await.unwrap();
            msg.reply.unwrap().respond(msg.data);
        });

        let response = bus
            .request("echo", Bytes::from("ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, Bytes::from("ping"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_without_subscribers() {
        let bus = InMemoryBus::new();
        let err = bus
            .request("nobody", Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoResponders { .. }));
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("slow").await.unwrap();

        let server = tokio::spawn(async move {
            let msg = sub.recv().await.unwrap();
            // Never respond.
            drop(msg);
        });

        let err = bus
            .request("slow", Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. }));
        server.await.unwrap();
    }
}
