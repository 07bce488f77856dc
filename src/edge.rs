//! Per-peer edges.
//!
//! An [`Edge`] owns one duplex peer connection: a writer task draining a
//! bounded outbound queue (so writes are serialized and never interleave)
//! and a reader task that decodes frames and forwards envelopes to the
//! node's event loop. All mutable edge state (subscriptions, pairing flags,
//! latency) is owned by the node actor; the tasks only move bytes.
//!
//! Invariant: at most one live edge per peer address per node. The node
//! enforces this when the handshake binds an address to a connection.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::address::Address;
use crate::codec::{self, Format};
use crate::messages::Envelope;

/// Outbound queue depth per edge. When full, senders observe backpressure.
const OUTBOUND_QUEUE_DEPTH: usize = 1024;

/// Event emitted by edge tasks into the node's event loop.
#[derive(Debug)]
pub(crate) enum EdgeEvent {
    Envelope { conn_id: u64, envelope: Envelope },
    Closed { conn_id: u64, reason: String },
}

/// Why a send into the edge's outbound queue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendError {
    /// The writer task is gone; the edge is terminal.
    Closed,
    /// The outbound queue is full; the peer is not draining fast enough.
    Backpressure,
}

/// A live peer connection.
pub(crate) struct Edge {
    pub id: u64,
    pub remote_socket: SocketAddr,
    /// Declared (listening) address, known after `report_paired`.
    pub peer: Option<Address>,
    /// Topics the peer declared interest in.
    pub subscriptions: HashSet<String>,
    /// Topics this edge is actively paired on.
    pub paired: HashSet<String>,
    /// True when this node dialed the peer via `connect()`; governs the
    /// reconnect policy.
    pub explicit: bool,
    /// The dial requested immediate pairing (config or `*` address form).
    pub dialed_paired: bool,
    /// The `report_paired` exchange completed in both directions.
    pub handshaken: bool,
    /// Last measured round-trip time.
    pub latency: Option<Duration>,
    /// Outstanding ping: (sent_at millis echoed by the peer, local instant).
    pub ping_sent: Option<(u64, Instant)>,
    /// When the last latency probe was issued.
    pub last_probe: Option<Instant>,
    /// Instant of the last envelope received on this edge.
    pub last_seen: Instant,
    /// Last streaming traffic per paired topic, for idle unpairing.
    pub topic_activity: HashMap<String, Instant>,
    outbound: mpsc::Sender<Envelope>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Edge {
    /// Split `stream` and spawn the reader/writer tasks.
    pub fn spawn<S>(
        id: u64,
        stream: S,
        remote_socket: SocketAddr,
        format: Format,
        max_frame_len: u32,
        events: mpsc::Sender<EdgeEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_DEPTH);

        let writer_format = format.clone();
        let writer_events = events.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                trace!(conn = id, command = envelope.command.name(), "write frame");
                if let Err(e) =
                    codec::write_frame(&mut write_half, &*writer_format, &envelope, max_frame_len)
                        .await
                {
                    let _ = writer_events
                        .send(EdgeEvent::Closed {
                            conn_id: id,
                            reason: format!("write: {e}"),
                        })
                        .await;
                    return;
                }
            }
            // All senders dropped: the edge was closed locally.
        });

        let reader_task = tokio::spawn(async move {
            loop {
                match codec::read_frame(&mut read_half, &*format, max_frame_len).await {
                    Ok(Some(envelope)) => {
                        if events
                            .send(EdgeEvent::Envelope {
                                conn_id: id,
                                envelope,
                            })
                            .await
                            .is_err()
                        {
                            return; // node stopped
                        }
                    }
                    Ok(None) => {
                        let _ = events
                            .send(EdgeEvent::Closed {
                                conn_id: id,
                                reason: "peer closed".into(),
                            })
                            .await;
                        return;
                    }
                    Err(e) => {
                        let _ = events
                            .send(EdgeEvent::Closed {
                                conn_id: id,
                                reason: format!("read: {e}"),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Self {
            id,
            remote_socket,
            peer: None,
            subscriptions: HashSet::new(),
            paired: HashSet::new(),
            explicit: false,
            dialed_paired: false,
            handshaken: false,
            latency: None,
            ping_sent: None,
            last_probe: None,
            last_seen: Instant::now(),
            topic_activity: HashMap::new(),
            outbound,
            reader_task,
            writer_task,
        }
    }

    /// Submit an envelope to the edge's write queue. Returns immediately:
    /// the writer task serializes and flushes in submission order.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        match self.outbound.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Backpressure),
        }
    }

    /// Clone of the outbound queue, for tasks (file senders, slow
    /// handlers) that reply without going back through the node actor.
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound.clone()
    }

    /// Address to show in logs before the handshake names the peer.
    pub fn label(&self) -> String {
        match &self.peer {
            Some(addr) => addr.to_string(),
            None => self.remote_socket.to_string(),
        }
    }

    /// Record streaming traffic on a topic (for idle unpairing).
    pub fn touch_topic(&mut self, topic: &str) {
        self.topic_activity
            .insert(topic.to_string(), Instant::now());
    }

    /// Tear down both tasks and close the socket. Queued but unwritten
    /// envelopes are discarded; delivery is at-most-once per edge.
    pub fn close(self) {
        debug!(conn = self.id, peer = %self.label(), "closing edge");
        self.reader_task.abort();
        drop(self.outbound);
        self.writer_task.abort();
    }
}

/// Public snapshot of an edge, returned by `ChaskiNode::edges()`.
#[derive(Debug, Clone)]
pub struct EdgeInfo {
    pub address: Address,
    pub subscriptions: Vec<String>,
    pub paired_topics: Vec<String>,
    pub latency: Option<Duration>,
    pub explicit: bool,
}

impl Edge {
    pub fn info(&self) -> Option<EdgeInfo> {
        let address = self.peer.clone()?;
        let mut subscriptions: Vec<String> = self.subscriptions.iter().cloned().collect();
        subscriptions.sort();
        let mut paired_topics: Vec<String> = self.paired.iter().cloned().collect();
        paired_topics.sort();
        Some(EdgeInfo {
            address,
            subscriptions,
            paired_topics,
            latency: self.latency,
            explicit: self.explicit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeClass;
    use crate::codec::default_format;
    use crate::messages::Command;

    fn test_envelope(port: u16) -> Envelope {
        Envelope::new(
            Address::new(NodeClass::Node, "127.0.0.1", port),
            Command::Keepalive { sent_at: 1 },
        )
    }

    #[tokio::test]
    async fn edge_writes_frames_in_submission_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (events_tx, _events_rx) = mpsc::channel(16);
        let edge = Edge::spawn(
            1,
            client,
            addr,
            default_format(),
            codec::DEFAULT_MAX_FRAME_LEN,
            events_tx,
        );

        for port in [1u16, 2, 3] {
            edge.send(test_envelope(port)).unwrap();
        }

        let format = default_format();
        let mut server = server;
        for expected_port in [1u16, 2, 3] {
            let envelope = codec::read_frame(&mut server, &*format, codec::DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(envelope.origin.port, expected_port);
        }

        edge.close();
    }

    #[tokio::test]
    async fn reader_reports_peer_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _edge = Edge::spawn(
            7,
            client,
            addr,
            default_format(),
            codec::DEFAULT_MAX_FRAME_LEN,
            events_tx,
        );

        drop(server);
        match events_rx.recv().await {
            Some(EdgeEvent::Closed { conn_id, .. }) => assert_eq!(conn_id, 7),
            other => panic!("expected Closed event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_after_close_reports_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let (events_tx, _events_rx) = mpsc::channel(16);
        let edge = Edge::spawn(
            2,
            client,
            addr,
            default_format(),
            codec::DEFAULT_MAX_FRAME_LEN,
            events_tx,
        );

        let outbound = edge.outbound.clone();
        edge.close();
        // The aborted writer task drops its receiver; senders then observe
        // the closed queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outbound.try_send(test_envelope(9)).is_err());
    }
}
