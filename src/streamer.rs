//! # Streaming plane
//!
//! [`ChaskiStreamer`] layers topic publish/subscribe and chunked file
//! transfer on top of the node core. Received `topic_message` payloads land
//! in a bounded [`DeliveryQueue`]; when the queue is full the **oldest**
//! message is dropped and an overflow counter incremented — the plane is
//! lossy by design, never blocking and never crashing.
//!
//! Two consumption styles:
//! - a scoped [`StreamSession`] (`streamer.session()`): dropping the guard
//!   stops the node and closes every edge;
//! - the explicit stream: call [`ChaskiStreamer::recv`] until
//!   [`ChaskiStreamer::terminate_stream`] or [`ChaskiStreamer::stop`].
//!
//! Ordering: messages from one sender on one topic arrive in push order.
//! Nothing is guaranteed across senders or across topics.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::address::{Address, NodeClass};
use crate::edge::EdgeInfo;
use crate::node::{ChaskiNode, NodeConfig, NodeError, NodeRole, NodeStats, OnPair, PushedFile};

/// A received application message.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub source: Address,
    /// Origin wall clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// Bounded drop-oldest buffer between the node actor and the application.
///
/// An mpsc channel cannot express these semantics (it drops newest or
/// blocks), so this is a small ring guarded by a mutex with a notify for
/// the consumer side.
pub struct DeliveryQueue {
    inner: Mutex<VecDeque<Message>>,
    capacity: usize,
    overflow: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            overflow: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Append a message, dropping the oldest when full.
    pub fn push(&self, message: Message) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.inner.lock().expect("delivery queue poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Await the next message; `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock().expect("delivery queue poisoned");
                if let Some(message) = queue.pop_front() {
                    // Wake any sibling consumer for the remaining items.
                    if !queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(message);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking take.
    pub fn try_recv(&self) -> Option<Message> {
        self.inner
            .lock()
            .expect("delivery queue poisoned")
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("delivery queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages dropped because the queue was full.
    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Topic streaming node: publish, subscribe, receive, and file transfer.
#[derive(Clone)]
pub struct ChaskiStreamer {
    node: ChaskiNode,
}

impl ChaskiStreamer {
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let node =
            ChaskiNode::start_with_role(config, NodeClass::Streamer, NodeRole::Peer).await?;
        Ok(Self { node })
    }

    /// The underlying node, for control-plane operations.
    pub fn node(&self) -> &ChaskiNode {
        &self.node
    }

    pub fn address(&self) -> &Address {
        self.node.address()
    }

    pub async fn connect(&self, target: &str) -> Result<Address, NodeError> {
        self.node.connect(target).await
    }

    pub async fn discovery(&self, on_pair: OnPair) -> Result<usize, NodeError> {
        self.node.discovery(on_pair).await
    }

    pub async fn edges(&self) -> Result<Vec<EdgeInfo>, NodeError> {
        self.node.edges().await
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.node.subscriptions()
    }

    pub async fn stats(&self) -> Result<NodeStats, NodeError> {
        self.node.stats().await
    }

    /// Publish `payload` to every peer paired on `topic`. Returns once the
    /// writes are submitted to the per-edge queues; peer delivery is not
    /// awaited.
    pub async fn push(&self, topic: &str, payload: Vec<u8>) -> Result<usize, NodeError> {
        self.node.push(topic, payload).await
    }

    /// Stream a file to every peer paired on `topic`.
    pub async fn push_file(
        &self,
        topic: &str,
        path: impl Into<PathBuf>,
    ) -> Result<PushedFile, NodeError> {
        self.node.push_file(topic, path, Vec::new()).await
    }

    /// Like [`push_file`](Self::push_file) with an opaque attachment handed
    /// to the receiver's file callback.
    pub async fn push_file_with(
        &self,
        topic: &str,
        path: impl Into<PathBuf>,
        attachment: Vec<u8>,
    ) -> Result<PushedFile, NodeError> {
        self.node.push_file(topic, path, attachment).await
    }

    /// Next received message; `None` after `terminate_stream` or `stop`.
    pub async fn recv(&self) -> Option<Message> {
        self.node.delivery().recv().await
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.node.delivery().try_recv()
    }

    /// End the explicit stream: pending and future `recv` calls return
    /// `None` once the queue drains. The node itself keeps running.
    pub fn terminate_stream(&self) {
        self.node.delivery().close();
    }

    /// Messages dropped due to a full delivery queue.
    pub async fn queue_overflow(&self) -> u64 {
        self.node.delivery().overflow()
    }

    /// Scoped consumption: the returned guard yields messages, and dropping
    /// it stops the node and closes all edges.
    pub fn session(&self) -> StreamSession {
        StreamSession {
            streamer: self.clone(),
        }
    }

    pub async fn stop(&self) {
        self.node.delivery().close();
        self.node.stop().await;
    }
}

/// Scoped receive handle; see [`ChaskiStreamer::session`].
pub struct StreamSession {
    streamer: ChaskiStreamer,
}

impl StreamSession {
    pub async fn recv(&self) -> Option<Message> {
        self.streamer.recv().await
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.streamer.terminate_stream();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let streamer = self.streamer.clone();
            handle.spawn(async move {
                streamer.stop().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: u8) -> Message {
        Message {
            topic: "t".into(),
            source: Address::new(NodeClass::Streamer, "127.0.0.1", 65431),
            timestamp: n as u64,
            data: vec![n],
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let queue = DeliveryQueue::new(4);
        for n in 0..100 {
            queue.push(message(n));
        }
        assert_eq!(queue.overflow(), 96);
        assert_eq!(queue.len(), 4);

        // Exactly the last four, in push order.
        for expected in 96..100 {
            let got = queue.recv().await.unwrap();
            assert_eq!(got.data, vec![expected]);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let queue = std::sync::Arc::new(DeliveryQueue::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(message(7));
        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.data, vec![7]);
    }

    #[tokio::test]
    async fn close_releases_waiting_consumers() {
        let queue = std::sync::Arc::new(DeliveryQueue::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());

        // Closed queues refuse further pushes.
        queue.push(message(1));
        assert!(queue.try_recv().is_none());
    }
}
