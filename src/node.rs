//! # Node core
//!
//! [`ChaskiNode`] is the runtime every role builds on: it owns the listener,
//! the edge set, the control-message dispatcher, the discovery engine, the
//! keepalive/latency machinery, and the reconnection policy.
//!
//! ## Concurrency
//!
//! The node uses the Handle/Actor pattern: [`ChaskiNode`] is a cheap-to-clone
//! handle sending [`NodeCommand`]s over a channel; `NodeActor` owns every
//! piece of mutable state and processes commands, edge events, and timer
//! ticks strictly sequentially in one `tokio::select!` loop. Edges talk back
//! through an event channel, never through a pointer to the node, so there
//! is no cycle between a node and its edges.
//!
//! ## Dispatch
//!
//! Incoming envelopes are matched on the closed [`Command`] set. Responses
//! (`*_response`) resolve the pending-request slot installed under the
//! request's envelope id; everything else is routed to its handler.
//! Decode failures close the offending edge; they never propagate out of
//! the actor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::address::{Address, ConnectTarget, NodeClass};
use crate::ca::CertificateAuthority;
use crate::codec::{self, Format};
use crate::edge::{Edge, EdgeEvent, EdgeInfo, SendError};
use crate::files::{self, FileCallback, FileIntake, SenderCtrl};
use crate::messages::{now_millis, Command, Envelope, ReportPaired};
use crate::remote::ProxyRegistry;
use crate::streamer::{DeliveryQueue, Message};
use crate::tls::{PeerStream, TlsContext, TlsSettings};

/// Capacity of the handle→actor command channel.
const COMMAND_CHANNEL_DEPTH: usize = 256;

/// Capacity of the edge→actor event channels.
const EVENT_CHANNEL_DEPTH: usize = 1024;

/// Entries in the discovery (origin, envelope-id) dedupe cache.
const DISCOVERY_SEEN_CAPACITY: usize = 4096;

/// Ceiling for reconnect backoff.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Errors surfaced to callers of the node API.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("edge closed")]
    EdgeClosed,
    #[error("edge backpressure")]
    Backpressure,
    #[error("request timed out")]
    RequestTimeout,
    #[error("cancelled")]
    Cancelled,
    #[error("not connected to {0}")]
    NotConnected(Address),
    #[error("peer refused: too many edges")]
    TooManyEdges,
    #[error("node stopped")]
    Stopped,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("startup failed: {0}")]
    Startup(String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    #[error("{0}")]
    Other(String),
}

/// What to do with the edges that carried a discovery once pairing succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnPair {
    /// Keep every edge.
    #[default]
    None,
    /// Drop edges that ended up with no pairing (and no reconnect).
    Disconnect,
}

/// Counters exposed for tests and monitoring.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub edges: usize,
    pub queue_overflow: u64,
    pub discovery_duplicates: u64,
}

/// Outcome of `push_file`: one uuid per file, fanned out to `targets` peers.
#[derive(Debug, Clone)]
pub struct PushedFile {
    pub file_id: Uuid,
    pub targets: usize,
}

/// Node configuration. Defaults follow the mesh-wide conventions; every
/// timeout is adjustable.
#[derive(Clone)]
pub struct NodeConfig {
    pub ip: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    pub name: String,
    pub subscriptions: Vec<String>,
    /// Establish pairing on every shared topic at connect time.
    pub paired: bool,
    /// Initial hop budget for discovery envelopes.
    pub ttl: u8,
    pub max_connections: usize,
    /// Reconnect attempts for explicitly connected peers; `None` = infinite.
    pub reconnections: Option<u32>,
    pub request_timeout: Duration,
    /// Cadence of the keepalive maintenance tick.
    pub keepalive_interval: Duration,
    /// An unanswered ping older than this declares the edge dead.
    pub keepalive_timeout: Duration,
    /// Cadence of latency probes on each edge.
    pub latency_update: Duration,
    pub discovery_interval: Duration,
    /// Dial + handshake deadline.
    pub pairing_timeout: Duration,
    /// Idle time after which a pairing is dropped.
    pub pairing_idle_timeout: Duration,
    pub max_frame_len: u32,
    pub queue_capacity: usize,
    pub chunk_size: u64,
    pub max_concurrent_files: usize,
    pub file_idle_timeout: Duration,
    pub allow_incoming_files: bool,
    pub destination_folder: PathBuf,
    pub file_handling_callback: Option<FileCallback>,
    pub tls: Option<TlsSettings>,
    pub format: Format,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            port: 0,
            name: "Node".into(),
            subscriptions: Vec::new(),
            paired: false,
            ttl: 64,
            max_connections: 16,
            reconnections: Some(32),
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(7),
            keepalive_timeout: Duration::from_secs(14),
            latency_update: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(30),
            pairing_timeout: Duration::from_secs(5),
            pairing_idle_timeout: Duration::from_secs(600),
            max_frame_len: codec::DEFAULT_MAX_FRAME_LEN,
            queue_capacity: 1024,
            chunk_size: files::DEFAULT_CHUNK_SIZE,
            max_concurrent_files: 8,
            file_idle_timeout: Duration::from_secs(30),
            allow_incoming_files: false,
            destination_folder: PathBuf::from("."),
            file_handling_callback: None,
            tls: None,
            format: codec::default_format(),
        }
    }
}

impl NodeConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_subscriptions<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn with_paired(mut self, paired: bool) -> Self {
        self.paired = paired;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_reconnections(mut self, reconnections: Option<u32>) -> Self {
        self.reconnections = reconnections;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_incoming_files(mut self, destination: impl Into<PathBuf>) -> Self {
        self.allow_incoming_files = true;
        self.destination_folder = destination.into();
        self
    }

    pub fn with_file_handling_callback(mut self, callback: FileCallback) -> Self {
        self.file_handling_callback = Some(callback);
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Role-specific services carried by the actor.
pub(crate) enum NodeRole {
    Peer,
    Ca(Arc<CertificateAuthority>),
    Remote(Arc<ProxyRegistry>),
}

enum NodeCommand {
    Connect {
        target: ConnectTarget,
        reply: oneshot::Sender<Result<Address, NodeError>>,
    },
    Disconnect {
        address: Address,
        reply: oneshot::Sender<bool>,
    },
    Send {
        to: Address,
        command: Command,
        topic: Option<String>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Request {
        to: Address,
        command: Command,
        topic: Option<String>,
        reply: oneshot::Sender<Result<Envelope, NodeError>>,
    },
    Push {
        topic: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<usize, NodeError>>,
    },
    PushFile {
        topic: String,
        path: PathBuf,
        attachment: Vec<u8>,
        reply: oneshot::Sender<Result<PushedFile, NodeError>>,
    },
    Discovery {
        on_pair: OnPair,
        reply: oneshot::Sender<usize>,
    },
    Edges {
        reply: oneshot::Sender<Vec<EdgeInfo>>,
    },
    IsConnectedTo {
        address: Address,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<NodeStats>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum NodeEvent {
    Accepted {
        stream: PeerStream,
        remote: SocketAddr,
    },
    DialDone {
        address: Address,
        paired: bool,
        explicit: bool,
        result: Result<PeerStream, String>,
    },
    RequestExpired {
        id: Uuid,
    },
    HandshakeExpired {
        address: Address,
    },
    Redial {
        address: Address,
    },
    TransferDone {
        peer: Address,
        file_id: Uuid,
    },
}

/// Handle to a running node. Cloning is cheap; all clones drive the same
/// actor. The node runs until [`ChaskiNode::stop`] completes.
#[derive(Clone)]
pub struct ChaskiNode {
    address: Address,
    cmd_tx: mpsc::Sender<NodeCommand>,
    delivery: Arc<DeliveryQueue>,
    config: Arc<NodeConfig>,
}

impl ChaskiNode {
    /// Bind a listener and start the node actor.
    ///
    /// Fatal startup errors (address in use, broken TLS material) are
    /// reported here; nothing keeps running after an `Err`.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        Self::start_with_role(config, NodeClass::Node, NodeRole::Peer).await
    }

    pub(crate) async fn start_with_role(
        config: NodeConfig,
        class: NodeClass,
        role: NodeRole,
    ) -> Result<Self, NodeError> {
        let tls = match &config.tls {
            Some(settings) => Some(
                TlsContext::from_settings(settings)
                    .map_err(|e| NodeError::Startup(format!("TLS: {e:#}")))?,
            ),
            None => None,
        };

        let listener = TcpListener::bind((config.ip.as_str(), config.port))
            .await
            .map_err(|e| {
                NodeError::Startup(format!("cannot bind {}:{}: {e}", config.ip, config.port))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| NodeError::Startup(e.to_string()))?
            .port();
        let address = Address::new(class, config.ip.clone(), port);

        let delivery = Arc::new(DeliveryQueue::new(config.queue_capacity));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (edge_tx, edge_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        let listener_task = spawn_listener(listener, tls.clone(), event_tx.clone());

        let intake = FileIntake::new(
            config.destination_folder.clone(),
            config.allow_incoming_files,
            config.max_concurrent_files,
            config.file_handling_callback.clone(),
        );

        let actor = NodeActor {
            address: address.clone(),
            config: config.clone(),
            role,
            tls,
            delivery: delivery.clone(),
            edges: HashMap::new(),
            by_addr: HashMap::new(),
            next_conn_id: 1,
            pending: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_pairings: HashMap::new(),
            discovery_rounds: HashMap::new(),
            seen_discovery: LruCache::new(
                NonZeroUsize::new(DISCOVERY_SEEN_CAPACITY).expect("capacity is non-zero"),
            ),
            discovery_duplicates: 0,
            reconnects: HashMap::new(),
            transfers_out: HashMap::new(),
            intake,
            event_tx,
            edge_tx,
            listener_task,
            stopping: false,
        };
        tokio::spawn(actor.run(cmd_rx, event_rx, edge_rx));

        info!(name = %config.name, address = %address, "node started");
        Ok(Self {
            address,
            cmd_tx,
            delivery,
            config: Arc::new(config),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn delivery(&self) -> &Arc<DeliveryQueue> {
        &self.delivery
    }

    /// Connect to a peer given its text address. A leading `*` requests
    /// pairing on every shared topic.
    pub async fn connect(&self, target: &str) -> Result<Address, NodeError> {
        let mut target: ConnectTarget = target
            .parse()
            .map_err(|e| NodeError::Other(format!("invalid address: {e}")))?;
        target.paired |= self.config.paired;
        self.connect_target(target).await
    }

    pub async fn connect_target(&self, target: ConnectTarget) -> Result<Address, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Connect { target, reply }).await?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn disconnect(&self, address: &Address) -> Result<bool, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Disconnect {
            address: address.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Fire-and-forget control send on the edge to `to`.
    pub(crate) async fn send_command(
        &self,
        to: &Address,
        command: Command,
        topic: Option<String>,
    ) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Send {
            to: to.clone(),
            command,
            topic,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Correlated request/response on the edge to `to`. Resolves with
    /// [`NodeError::RequestTimeout`] after `request_timeout`, and with
    /// [`NodeError::Cancelled`] if the node stops first.
    pub async fn request(&self, to: &Address, command: Command) -> Result<Envelope, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Request {
            to: to.clone(),
            command,
            topic: None,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Publish a payload to every peer paired on `topic`. Returns the number
    /// of edges the write was submitted to; it does not await delivery.
    pub async fn push(&self, topic: &str, payload: Vec<u8>) -> Result<usize, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Push {
            topic: topic.to_string(),
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Stream a file to every peer paired on `topic`.
    pub async fn push_file(
        &self,
        topic: &str,
        path: impl Into<PathBuf>,
        attachment: Vec<u8>,
    ) -> Result<PushedFile, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::PushFile {
            topic: topic.to_string(),
            path: path.into(),
            attachment,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Ask the peer to drop this edge without reconnecting (the
    /// `terminate` control command).
    pub async fn terminate_peer(&self, address: &Address) -> Result<(), NodeError> {
        self.send_command(address, Command::Terminate, None).await
    }

    /// Run one discovery round now for every topic without a pairing.
    /// Returns the number of discovery envelopes emitted.
    pub async fn discovery(&self, on_pair: OnPair) -> Result<usize, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Discovery { on_pair, reply }).await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn edges(&self) -> Result<Vec<EdgeInfo>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Edges { reply }).await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn is_connected_to(&self, address: &Address) -> Result<bool, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::IsConnectedTo {
            address: address.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.config.subscriptions.clone()
    }

    pub async fn stats(&self) -> Result<NodeStats, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Stats { reply }).await?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Stop the node: close every edge and socket, cancel every background
    /// task, and resolve pending requests with `Cancelled`. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(NodeCommand::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn command(&self, command: NodeCommand) -> Result<(), NodeError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| NodeError::Stopped)
    }
}

fn spawn_listener(
    listener: TcpListener,
    tls: Option<TlsContext>,
    event_tx: mpsc::Sender<NodeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let tls = tls.clone();
            let event_tx = event_tx.clone();
            // The TLS handshake must not stall the accept loop.
            tokio::spawn(async move {
                let stream = match tls {
                    Some(ctx) => match ctx.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(peer = %remote, error = %e, "refusing peer: TLS verification failed");
                            return;
                        }
                    },
                    None => PeerStream::Plain(stream),
                };
                let _ = event_tx.send(NodeEvent::Accepted { stream, remote }).await;
            });
        }
    })
}

struct PendingDial {
    replies: Vec<oneshot::Sender<Result<Address, NodeError>>>,
    paired: bool,
    explicit: bool,
}

struct ReconnectState {
    attempts: u32,
    paired: bool,
}

struct NodeActor {
    address: Address,
    config: NodeConfig,
    role: NodeRole,
    tls: Option<TlsContext>,
    delivery: Arc<DeliveryQueue>,
    edges: HashMap<u64, Edge>,
    by_addr: HashMap<Address, u64>,
    next_conn_id: u64,
    pending: HashMap<Uuid, oneshot::Sender<Result<Envelope, NodeError>>>,
    pending_dials: HashMap<Address, PendingDial>,
    /// Pairing offers queued until the dial to the initiator completes.
    pending_pairings: HashMap<Address, Vec<String>>,
    /// Topic → mode of the discovery round currently in flight.
    discovery_rounds: HashMap<String, OnPair>,
    seen_discovery: LruCache<(Address, Uuid), ()>,
    discovery_duplicates: u64,
    reconnects: HashMap<Address, ReconnectState>,
    /// Control channels of running outbound file transfers.
    transfers_out: HashMap<(Address, Uuid), mpsc::Sender<SenderCtrl>>,
    intake: FileIntake,
    event_tx: mpsc::Sender<NodeEvent>,
    edge_tx: mpsc::Sender<EdgeEvent>,
    listener_task: JoinHandle<()>,
    stopping: bool,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<NodeCommand>,
        mut event_rx: mpsc::Receiver<NodeEvent>,
        mut edge_rx: mpsc::Receiver<EdgeEvent>,
    ) {
        let mut maintenance = tokio::time::interval(self.config.keepalive_interval);
        maintenance.tick().await; // skip the immediate tick
        let mut discovery = tokio::time::interval(self.config.discovery_interval);
        discovery.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(NodeCommand::Stop { reply }) => {
                            self.shutdown();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            // Every handle dropped: the node winds down.
                            self.shutdown();
                            break;
                        }
                    }
                }
                Some(event) = event_rx.recv() => self.handle_event(event).await,
                Some(event) = edge_rx.recv() => self.handle_edge_event(event).await,
                _ = maintenance.tick() => self.maintenance_tick(),
                _ = discovery.tick() => { self.emit_discovery(OnPair::None); }
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Connect { target, reply } => {
                self.start_dial(target.address, target.paired, true, Some(reply));
            }
            NodeCommand::Disconnect { address, reply } => {
                let existed = self.by_addr.get(&address).copied();
                if let Some(id) = existed {
                    self.close_conn(id, "disconnect requested", false);
                }
                let _ = reply.send(existed.is_some());
            }
            NodeCommand::Send {
                to,
                command,
                topic,
                reply,
            } => {
                let _ = reply.send(self.send_to(&to, command, topic));
            }
            NodeCommand::Request {
                to,
                command,
                topic,
                reply,
            } => {
                let mut envelope = Envelope::new(self.address.clone(), command);
                if let Some(topic) = topic {
                    envelope = envelope.with_topic(topic);
                }
                let id = envelope.id;
                match self.send_envelope(&to, envelope) {
                    Ok(()) => {
                        self.pending.insert(id, reply);
                        let event_tx = self.event_tx.clone();
                        let timeout = self.config.request_timeout;
                        tokio::spawn(async move {
                            tokio::time::sleep(timeout).await;
                            let _ = event_tx.send(NodeEvent::RequestExpired { id }).await;
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NodeCommand::Push {
                topic,
                payload,
                reply,
            } => {
                let _ = reply.send(Ok(self.push_topic(&topic, payload)));
            }
            NodeCommand::PushFile {
                topic,
                path,
                attachment,
                reply,
            } => {
                let _ = reply.send(Ok(self.push_file(&topic, path, attachment)));
            }
            NodeCommand::Discovery { on_pair, reply } => {
                let _ = reply.send(self.emit_discovery(on_pair));
            }
            NodeCommand::Edges { reply } => {
                let mut infos: Vec<EdgeInfo> = self
                    .edges
                    .values()
                    .filter(|e| e.handshaken)
                    .filter_map(|e| e.info())
                    .collect();
                infos.sort_by(|a, b| a.address.to_string().cmp(&b.address.to_string()));
                let _ = reply.send(infos);
            }
            NodeCommand::IsConnectedTo { address, reply } => {
                let connected = self
                    .by_addr
                    .get(&address)
                    .and_then(|id| self.edges.get(id))
                    .map(|e| e.handshaken)
                    .unwrap_or(false);
                let _ = reply.send(connected);
            }
            NodeCommand::Stats { reply } => {
                let _ = reply.send(NodeStats {
                    edges: self.by_addr.len(),
                    queue_overflow: self.delivery.overflow(),
                    discovery_duplicates: self.discovery_duplicates,
                });
            }
            NodeCommand::Stop { .. } => unreachable!("handled in run loop"),
        }
    }

    fn send_to(
        &mut self,
        to: &Address,
        command: Command,
        topic: Option<String>,
    ) -> Result<(), NodeError> {
        let mut envelope = Envelope::new(self.address.clone(), command);
        if let Some(topic) = topic {
            envelope = envelope.with_topic(topic);
        }
        self.send_envelope(to, envelope)
    }

    fn send_envelope(&mut self, to: &Address, envelope: Envelope) -> Result<(), NodeError> {
        let id = *self
            .by_addr
            .get(to)
            .ok_or_else(|| NodeError::NotConnected(to.clone()))?;
        let edge = self.edges.get(&id).ok_or(NodeError::EdgeClosed)?;
        edge.send(envelope).map_err(|e| match e {
            SendError::Closed => NodeError::EdgeClosed,
            SendError::Backpressure => NodeError::Backpressure,
        })
    }

    fn push_topic(&mut self, topic: &str, payload: Vec<u8>) -> usize {
        let origin = self.address.clone();
        let mut sent = 0;
        for edge in self.edges.values_mut() {
            if !edge.handshaken || !edge.paired.contains(topic) {
                continue;
            }
            let envelope = Envelope::new(
                origin.clone(),
                Command::TopicMessage {
                    payload: payload.clone(),
                },
            )
            .with_topic(topic);
            match edge.send(envelope) {
                Ok(()) => {
                    edge.touch_topic(topic);
                    sent += 1;
                }
                Err(e) => {
                    debug!(peer = %edge.label(), ?e, "push skipped edge");
                }
            }
        }
        sent
    }

    fn push_file(&mut self, topic: &str, path: PathBuf, attachment: Vec<u8>) -> PushedFile {
        let file_id = Uuid::new_v4();
        let mut targets = 0;
        for edge in self.edges.values() {
            if !edge.handshaken || !edge.paired.contains(topic) {
                continue;
            }
            let Some(peer) = edge.peer.clone() else {
                continue;
            };
            let (ctrl_tx, ctrl_rx) = mpsc::channel(8);
            self.transfers_out.insert((peer.clone(), file_id), ctrl_tx);

            let edge_tx = edge.sender();
            let origin = self.address.clone();
            let topic = topic.to_string();
            let path = path.clone();
            let attachment = attachment.clone();
            let chunk_size = self.config.chunk_size;
            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = files::run_sender(
                    edge_tx,
                    origin,
                    topic,
                    path,
                    file_id,
                    chunk_size,
                    attachment,
                    ctrl_rx,
                )
                .await
                {
                    warn!(id = %file_id, error = %e, "file send ended with error");
                }
                let _ = event_tx
                    .send(NodeEvent::TransferDone {
                        peer,
                        file_id,
                    })
                    .await;
            });
            targets += 1;
        }
        PushedFile { file_id, targets }
    }

    // ------------------------------------------------------------------
    // Dialing and reconnection
    // ------------------------------------------------------------------

    fn start_dial(
        &mut self,
        address: Address,
        paired: bool,
        explicit: bool,
        reply: Option<oneshot::Sender<Result<Address, NodeError>>>,
    ) {
        if address == self.address {
            if let Some(reply) = reply {
                let _ = reply.send(Err(NodeError::Other("cannot connect to self".into())));
            }
            return;
        }
        if self.by_addr.contains_key(&address) {
            // Already connected; a paired request still refreshes pairing.
            if paired {
                let hello = self.hello(true);
                let _ = self.send_to(&address, hello, None);
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(address));
            }
            return;
        }

        match self.pending_dials.get_mut(&address) {
            Some(pd) => {
                pd.paired |= paired;
                pd.explicit |= explicit;
                if let Some(reply) = reply {
                    pd.replies.push(reply);
                }
                return;
            }
            None => {
                self.pending_dials.insert(
                    address.clone(),
                    PendingDial {
                        replies: reply.into_iter().collect(),
                        paired,
                        explicit,
                    },
                );
            }
        }

        let tls = self.tls.clone();
        let event_tx = self.event_tx.clone();
        let deadline = self.config.pairing_timeout;
        let dial_addr = address.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(deadline, async {
                let tcp = TcpStream::connect(dial_addr.socket_addr())
                    .await
                    .map_err(|e| e.to_string())?;
                match &tls {
                    Some(ctx) => ctx
                        .connect(tcp, &dial_addr.host)
                        .await
                        .map_err(|e| format!("{e:#}")),
                    None => Ok(PeerStream::Plain(tcp)),
                }
            })
            .await
            .unwrap_or_else(|_| Err("connect timed out".into()));

            let _ = event_tx
                .send(NodeEvent::DialDone {
                    address: dial_addr,
                    paired,
                    explicit,
                    result,
                })
                .await;
        });

        // Handshake watchdog: the dial may succeed but the peer never
        // report_paired back.
        let event_tx = self.event_tx.clone();
        let watchdog = self.config.pairing_timeout * 2;
        tokio::spawn(async move {
            tokio::time::sleep(watchdog).await;
            let _ = event_tx.send(NodeEvent::HandshakeExpired { address }).await;
        });
    }

    fn schedule_reconnect(&mut self, address: Address, paired: bool) {
        let state = self
            .reconnects
            .entry(address.clone())
            .or_insert(ReconnectState { attempts: 0, paired });
        state.paired |= paired;
        if let Some(max) = self.config.reconnections {
            if state.attempts >= max {
                warn!(peer = %address, "reconnect budget exhausted");
                self.reconnects.remove(&address);
                return;
            }
        }
        state.attempts += 1;
        let backoff = Duration::from_secs(1 << (state.attempts - 1).min(5)).min(RECONNECT_BACKOFF_CAP);
        debug!(peer = %address, attempt = state.attempts, ?backoff, "scheduling reconnect");
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = event_tx.send(NodeEvent::Redial { address }).await;
        });
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Accepted { stream, remote } => self.handle_accepted(stream, remote),
            NodeEvent::DialDone {
                address,
                paired,
                explicit,
                result,
            } => self.handle_dial_done(address, paired, explicit, result),
            NodeEvent::RequestExpired { id } => {
                if let Some(slot) = self.pending.remove(&id) {
                    let _ = slot.send(Err(NodeError::RequestTimeout));
                }
            }
            NodeEvent::HandshakeExpired { address } => {
                if let Some(pd) = self.pending_dials.remove(&address) {
                    for reply in pd.replies {
                        let _ = reply.send(Err(NodeError::RequestTimeout));
                    }
                }
                if let Some(&id) = self.by_addr.get(&address) {
                    let done = self.edges.get(&id).map(|e| e.handshaken).unwrap_or(true);
                    if !done {
                        self.close_conn(id, "handshake timed out", false);
                    }
                }
            }
            NodeEvent::Redial { address } => {
                if self.stopping || self.by_addr.contains_key(&address) {
                    return;
                }
                let paired = self
                    .reconnects
                    .get(&address)
                    .map(|s| s.paired)
                    .unwrap_or(false);
                self.start_dial(address, paired, true, None);
            }
            NodeEvent::TransferDone { peer, file_id } => {
                self.transfers_out.remove(&(peer, file_id));
            }
        }
    }

    fn handle_accepted(&mut self, stream: PeerStream, remote: SocketAddr) {
        if self.stopping {
            return;
        }
        if self.edges.len() >= self.config.max_connections {
            debug!(peer = %remote, "refusing inbound edge: cap reached");
            let refusal = Envelope::new(self.address.clone(), Command::TooManyEdges);
            let format = self.config.format.clone();
            let max_frame = self.config.max_frame_len;
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = codec::write_frame(&mut stream, &*format, &refusal, max_frame).await;
            });
            return;
        }
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let edge = Edge::spawn(
            id,
            stream,
            remote,
            self.config.format.clone(),
            self.config.max_frame_len,
            self.edge_tx.clone(),
        );
        self.edges.insert(id, edge);
        trace!(conn = id, peer = %remote, "inbound connection");
    }

    fn handle_dial_done(
        &mut self,
        address: Address,
        paired: bool,
        explicit: bool,
        result: Result<PeerStream, String>,
    ) {
        let stream = match result {
            Ok(stream) => stream,
            Err(reason) => {
                debug!(peer = %address, %reason, "dial failed");
                let user_waiting = self
                    .pending_dials
                    .remove(&address)
                    .map(|pd| {
                        let waiting = !pd.replies.is_empty();
                        for reply in pd.replies {
                            let _ = reply.send(Err(NodeError::Transport(reason.clone())));
                        }
                        waiting
                    })
                    .unwrap_or(false);
                // Reconnect attempts (no caller waiting) keep trying.
                if !user_waiting && explicit && !self.stopping {
                    self.schedule_reconnect(address, paired);
                }
                return;
            }
        };

        if self.stopping {
            return;
        }
        if self.by_addr.contains_key(&address) {
            // A simultaneous inbound edge won the race.
            if let Some(pd) = self.pending_dials.remove(&address) {
                for reply in pd.replies {
                    let _ = reply.send(Ok(address.clone()));
                }
            }
            return;
        }

        let remote = stream
            .remote_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let mut edge = Edge::spawn(
            id,
            stream,
            remote,
            self.config.format.clone(),
            self.config.max_frame_len,
            self.edge_tx.clone(),
        );
        edge.peer = Some(address.clone());
        edge.explicit = explicit;
        edge.dialed_paired = paired;
        let hello = self.hello(paired);
        if edge.send(Envelope::new(self.address.clone(), hello)).is_err() {
            edge.close();
            if let Some(pd) = self.pending_dials.remove(&address) {
                for reply in pd.replies {
                    let _ = reply.send(Err(NodeError::EdgeClosed));
                }
            }
            return;
        }
        self.edges.insert(id, edge);
        self.by_addr.insert(address, id);
    }

    fn hello(&self, paired: bool) -> Command {
        Command::ReportPaired(ReportPaired {
            address: self.address.clone(),
            subscriptions: self.config.subscriptions.clone(),
            paired,
        })
    }

    // ------------------------------------------------------------------
    // Edge events / dispatcher
    // ------------------------------------------------------------------

    async fn handle_edge_event(&mut self, event: EdgeEvent) {
        match event {
            EdgeEvent::Closed { conn_id, reason } => {
                if self.edges.contains_key(&conn_id) {
                    debug!(conn = conn_id, %reason, "edge closed");
                    self.close_conn(conn_id, &reason, true);
                }
            }
            EdgeEvent::Envelope { conn_id, envelope } => {
                if !self.edges.contains_key(&conn_id) {
                    return; // raced with close
                }
                self.dispatch(conn_id, envelope).await;
            }
        }
    }

    async fn dispatch(&mut self, conn_id: u64, envelope: Envelope) {
        if let Some(edge) = self.edges.get_mut(&conn_id) {
            edge.last_seen = Instant::now();
        }
        trace!(conn = conn_id, command = envelope.command.name(), "dispatch");

        // Correlated responses resolve their pending slot and go no further.
        if envelope.command.is_response() {
            if let Some(slot) = self.pending.remove(&envelope.id) {
                let _ = slot.send(Ok(envelope));
                return;
            }
            if let Command::KeepaliveResponse { sent_at } = envelope.command {
                self.note_pong(conn_id, sent_at);
            }
            return;
        }

        match envelope.command.clone() {
            Command::ReportPaired(rp) => self.on_report_paired(conn_id, rp),
            Command::Keepalive { sent_at } => {
                let reply = envelope.respond(
                    self.address.clone(),
                    Command::KeepaliveResponse { sent_at },
                );
                if let Some(edge) = self.edges.get(&conn_id) {
                    let _ = edge.send(reply);
                }
            }
            Command::Discovery { previous_node } => {
                self.on_discovery(conn_id, &envelope, previous_node)
            }
            Command::Pairing { responder } => self.on_pairing(conn_id, &envelope, responder),
            Command::PairDeclined => {
                if let (Some(topic), Some(edge)) = (&envelope.topic, self.edges.get_mut(&conn_id))
                {
                    edge.paired.remove(topic);
                }
            }
            Command::Unpair => {
                if let (Some(topic), Some(edge)) = (&envelope.topic, self.edges.get_mut(&conn_id))
                {
                    debug!(peer = %edge.label(), topic = %topic, "unpaired by peer");
                    edge.paired.remove(topic);
                }
            }
            Command::TopicMessage { payload } => {
                let Some(topic) = envelope.topic.clone() else {
                    return;
                };
                if let Some(edge) = self.edges.get_mut(&conn_id) {
                    edge.touch_topic(&topic);
                }
                if self.config.subscriptions.iter().any(|t| t == &topic) {
                    self.delivery.push(Message {
                        topic,
                        source: envelope.origin,
                        timestamp: envelope.timestamp,
                        data: payload,
                    });
                }
            }
            Command::FileChunk(chunk) => {
                let from = envelope.origin.clone();
                let replies = self
                    .intake
                    .handle_chunk(&from, envelope.topic.as_deref(), chunk)
                    .await;
                self.reply_all(conn_id, &envelope, replies);
            }
            Command::FileResumeFrom {
                file_id,
                next_index,
            } => {
                self.route_sender_ctrl(&envelope.origin, file_id, SenderCtrl::ResumeFrom(next_index));
            }
            Command::FlowPause { file_id } => {
                self.route_sender_ctrl(&envelope.origin, file_id, SenderCtrl::Pause);
            }
            Command::FlowResume { file_id } => {
                self.route_sender_ctrl(&envelope.origin, file_id, SenderCtrl::Resume);
            }
            Command::FileTransferFailed { file_id, reason } => {
                if self
                    .transfers_out
                    .contains_key(&(envelope.origin.clone(), file_id))
                {
                    self.route_sender_ctrl(
                        &envelope.origin,
                        file_id,
                        SenderCtrl::Abort(reason),
                    );
                } else {
                    self.intake.handle_failed(file_id, &reason);
                }
            }
            Command::CaRequestCertificate(request) => {
                self.on_ca_request(conn_id, &envelope, request)
            }
            Command::CaRevoke { serial } => {
                if let NodeRole::Ca(ca) = &self.role {
                    let ca = ca.clone();
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = ca.revoke(&serial) {
                            warn!(serial = %serial, error = %e, "revocation failed");
                        }
                    });
                }
            }
            Command::CaGetCrl => {
                if let NodeRole::Ca(ca) = &self.role {
                    let crl_pem = ca.crl_pem().unwrap_or_default();
                    let reply =
                        envelope.respond(self.address.clone(), Command::CaGetCrlResponse { crl_pem });
                    if let Some(edge) = self.edges.get(&conn_id) {
                        let _ = edge.send(reply);
                    }
                }
            }
            Command::ProxyCall(call) => self.on_proxy_call(conn_id, &envelope, call),
            Command::TooManyEdges => {
                let peer = self
                    .edges
                    .get(&conn_id)
                    .and_then(|e| e.peer.clone());
                if let Some(address) = peer {
                    if let Some(pd) = self.pending_dials.remove(&address) {
                        for reply in pd.replies {
                            let _ = reply.send(Err(NodeError::TooManyEdges));
                        }
                    }
                }
                self.close_conn(conn_id, "peer at capacity", false);
            }
            Command::Terminate => {
                info!(conn = conn_id, "terminated by peer request");
                self.close_conn(conn_id, "terminate", false);
            }
            // Responses are handled above; reaching here means the peer sent
            // one with no pending slot, which is harmless.
            Command::KeepaliveResponse { .. }
            | Command::CaRequestCertificateResponse(_)
            | Command::CaGetCrlResponse { .. }
            | Command::ProxyCallResponse(_) => {}
        }
    }

    fn reply_all(&mut self, conn_id: u64, request: &Envelope, commands: Vec<Command>) {
        if let Some(edge) = self.edges.get(&conn_id) {
            for command in commands {
                let mut reply = Envelope::new(self.address.clone(), command);
                reply.topic = request.topic.clone();
                let _ = edge.send(reply);
            }
        }
    }

    fn route_sender_ctrl(&mut self, from: &Address, file_id: Uuid, ctrl: SenderCtrl) {
        if let Some(tx) = self.transfers_out.get(&(from.clone(), file_id)) {
            let _ = tx.try_send(ctrl);
        }
    }

    fn note_pong(&mut self, conn_id: u64, sent_at: u64) {
        if let Some(edge) = self.edges.get_mut(&conn_id) {
            if let Some((expected, at)) = edge.ping_sent {
                if expected == sent_at {
                    edge.latency = Some(at.elapsed());
                    edge.ping_sent = None;
                    trace!(peer = %edge.label(), rtt = ?edge.latency, "latency update");
                }
            }
        }
    }

    fn on_report_paired(&mut self, conn_id: u64, rp: ReportPaired) {
        let is_hello = match self.edges.get(&conn_id) {
            Some(edge) => edge.peer.is_none(),
            None => return,
        };

        if is_hello {
            if self.by_addr.contains_key(&rp.address) {
                // Duplicate inbound connection from an already-known address.
                debug!(peer = %rp.address, "closing duplicate edge");
                self.close_conn(conn_id, "duplicate address", false);
                return;
            }
            if let Some(edge) = self.edges.get_mut(&conn_id) {
                edge.peer = Some(rp.address.clone());
            }
            self.by_addr.insert(rp.address.clone(), conn_id);
        }

        let overlap: Vec<String> = {
            let edge = match self.edges.get_mut(&conn_id) {
                Some(edge) => edge,
                None => return,
            };
            edge.subscriptions = rp.subscriptions.iter().cloned().collect();
            edge.handshaken = true;
            let want_paired = rp.paired || edge.dialed_paired;
            if want_paired {
                self.config
                    .subscriptions
                    .iter()
                    .filter(|t| edge.subscriptions.contains(*t))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            }
        };
        for topic in &overlap {
            self.pair_topic(conn_id, topic);
        }

        if is_hello {
            // Reply in kind; echoing the paired flag lets both sides agree.
            let reply = Envelope::new(
                self.address.clone(),
                Command::ReportPaired(ReportPaired {
                    address: self.address.clone(),
                    subscriptions: self.config.subscriptions.clone(),
                    paired: rp.paired,
                }),
            );
            if let Some(edge) = self.edges.get(&conn_id) {
                let _ = edge.send(reply);
            }
        }

        // The edge is live: resolve waiting connect() calls and clear the
        // reconnect budget.
        if let Some(pd) = self.pending_dials.remove(&rp.address) {
            for reply in pd.replies {
                let _ = reply.send(Ok(rp.address.clone()));
            }
        }
        self.reconnects.remove(&rp.address);

        // Flush pairing offers that waited for this connection.
        if let Some(topics) = self.pending_pairings.remove(&rp.address) {
            for topic in topics {
                self.offer_pairing(conn_id, &topic);
            }
        }
    }

    fn pair_topic(&mut self, conn_id: u64, topic: &str) {
        if let Some(edge) = self.edges.get_mut(&conn_id) {
            if edge.paired.insert(topic.to_string()) {
                edge.touch_topic(topic);
                debug!(peer = %edge.label(), topic = %topic, "paired");
            }
        }
    }

    fn offer_pairing(&mut self, conn_id: u64, topic: &str) {
        let origin = self.address.clone();
        if let Some(edge) = self.edges.get_mut(&conn_id) {
            let envelope = Envelope::new(
                origin.clone(),
                Command::Pairing { responder: origin },
            )
            .with_topic(topic);
            if edge.send(envelope).is_ok() {
                // Optimistic: a pair_declined rolls this back.
                edge.paired.insert(topic.to_string());
                edge.touch_topic(topic);
            }
        }
    }

    fn on_discovery(&mut self, conn_id: u64, envelope: &Envelope, previous_node: Address) {
        let key = (envelope.origin.clone(), envelope.id);
        if self.seen_discovery.put(key, ()).is_some() {
            self.discovery_duplicates += 1;
            return;
        }
        let Some(topic) = envelope.topic.clone() else {
            return;
        };
        if envelope.visited.contains(&self.address) {
            return;
        }

        let subscribed = self.config.subscriptions.iter().any(|t| t == &topic);
        if subscribed && previous_node != self.address && !self.paired_with(&previous_node, &topic)
        {
            match self.by_addr.get(&previous_node).copied() {
                Some(id) => self.offer_pairing(id, &topic),
                None => {
                    let queued = self
                        .pending_pairings
                        .entry(previous_node.clone())
                        .or_default();
                    if !queued.contains(&topic) {
                        queued.push(topic.clone());
                    }
                    self.start_dial(previous_node.clone(), false, false, None);
                }
            }
        }

        if envelope.ttl > 0 {
            let mut forward = envelope.clone();
            forward.visited.push(self.address.clone());
            forward.ttl -= 1;
            for edge in self.edges.values() {
                if edge.id == conn_id || !edge.handshaken {
                    continue;
                }
                let Some(peer) = &edge.peer else { continue };
                if forward.visited.contains(peer) {
                    continue;
                }
                let _ = edge.send(forward.clone());
            }
        }
    }

    fn on_pairing(&mut self, conn_id: u64, envelope: &Envelope, responder: Address) {
        let Some(topic) = envelope.topic.clone() else {
            return;
        };
        let subscribed = self.config.subscriptions.iter().any(|t| t == &topic);
        let already_paired_here = self
            .edges
            .get(&conn_id)
            .map(|e| e.paired.contains(&topic))
            .unwrap_or(false);
        if already_paired_here {
            return; // pairing is exclusive per (topic, peer); nothing changes
        }

        let round = self.discovery_rounds.remove(&topic);
        let accept = subscribed && (round.is_some() || !self.paired_anywhere(&topic));
        if !accept {
            if round.is_none() {
                // Late responder after the first pairing won this round.
                debug!(peer = %responder, topic = %topic, "declining surplus pairing");
            }
            let reply = envelope.respond(self.address.clone(), Command::PairDeclined);
            if let Some(edge) = self.edges.get(&conn_id) {
                let _ = edge.send(reply);
            }
            return;
        }

        self.pair_topic(conn_id, &topic);
        if round == Some(OnPair::Disconnect) {
            self.drop_unpaired_edges();
        }
    }

    fn paired_with(&self, peer: &Address, topic: &str) -> bool {
        self.by_addr
            .get(peer)
            .and_then(|id| self.edges.get(id))
            .map(|e| e.paired.contains(topic))
            .unwrap_or(false)
    }

    fn paired_anywhere(&self, topic: &str) -> bool {
        self.edges.values().any(|e| e.paired.contains(topic))
    }

    fn emit_discovery(&mut self, on_pair: OnPair) -> usize {
        if self.stopping {
            return 0;
        }
        let topics: Vec<String> = self
            .config
            .subscriptions
            .iter()
            .filter(|t| !self.paired_anywhere(t))
            .cloned()
            .collect();
        let mut emitted = 0;
        for topic in topics {
            self.discovery_rounds.insert(topic.clone(), on_pair);
            let mut envelope = Envelope::new(
                self.address.clone(),
                Command::Discovery {
                    previous_node: self.address.clone(),
                },
            )
            .with_topic(topic.clone())
            .with_ttl(self.config.ttl);
            envelope.visited.push(self.address.clone());
            // A looped-back copy must be recognized as already seen.
            self.seen_discovery
                .put((self.address.clone(), envelope.id), ());

            let mut sent_any = false;
            for edge in self.edges.values() {
                if edge.handshaken && edge.send(envelope.clone()).is_ok() {
                    sent_any = true;
                }
            }
            if sent_any {
                debug!(topic = %topic, "discovery round emitted");
                emitted += 1;
            }
        }
        emitted
    }

    fn drop_unpaired_edges(&mut self) {
        let targets: Vec<u64> = self
            .edges
            .values()
            .filter(|e| e.handshaken && e.paired.is_empty())
            .map(|e| e.id)
            .collect();
        for id in targets {
            self.close_conn(id, "discovery disconnect", false);
        }
    }

    // ------------------------------------------------------------------
    // Role services
    // ------------------------------------------------------------------

    fn on_ca_request(
        &mut self,
        conn_id: u64,
        envelope: &Envelope,
        request: crate::messages::CaCertificateRequest,
    ) {
        let NodeRole::Ca(ca) = &self.role else {
            return;
        };
        let ca = ca.clone();
        let Some(edge) = self.edges.get(&conn_id) else {
            return;
        };
        let sender = edge.sender();
        let origin = self.address.clone();
        let template = envelope.clone();
        // Key generation and signing are CPU-bound; keep them off the actor.
        tokio::spawn(async move {
            let command = match tokio::task::spawn_blocking(move || ca.issue(request)).await {
                Ok(Ok(response)) => Command::CaRequestCertificateResponse(response),
                Ok(Err(e)) => {
                    warn!(error = %e, "certificate issuance failed");
                    Command::CaRequestCertificateResponse(crate::messages::CaCertificateResponse {
                        certificate_pem: String::new(),
                        root_certificate_pem: String::new(),
                        private_key_pem: None,
                        serial: format!("error: {e}"),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "certificate issuance task failed");
                    return;
                }
            };
            let _ = sender.send(template.respond(origin, command)).await;
        });
    }

    fn on_proxy_call(
        &mut self,
        conn_id: u64,
        envelope: &Envelope,
        call: crate::messages::ProxyCall,
    ) {
        let NodeRole::Remote(registry) = &self.role else {
            return;
        };
        let registry = registry.clone();
        let Some(edge) = self.edges.get(&conn_id) else {
            return;
        };
        let sender = edge.sender();
        let origin = self.address.clone();
        let template = envelope.clone();
        tokio::spawn(async move {
            let response = registry.dispatch(call).await;
            let _ = sender
                .send(template.respond(origin, Command::ProxyCallResponse(response)))
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn maintenance_tick(&mut self) {
        if self.stopping {
            return;
        }
        let now = Instant::now();
        let mut dead: Vec<(u64, Option<Address>, bool, bool)> = Vec::new();
        let mut unpairs: Vec<(u64, String)> = Vec::new();

        for edge in self.edges.values_mut() {
            // Unnamed inbound connections that never handshake are dropped.
            if !edge.handshaken {
                if edge.last_seen.elapsed() > self.config.pairing_timeout * 2 {
                    dead.push((edge.id, None, false, false));
                }
                continue;
            }

            if let Some((_, at)) = edge.ping_sent {
                if at.elapsed() > self.config.keepalive_timeout {
                    warn!(peer = %edge.label(), "keepalive missed; edge is dead");
                    dead.push((edge.id, edge.peer.clone(), edge.explicit, edge.dialed_paired));
                    continue;
                }
            } else {
                let due = edge
                    .last_probe
                    .map(|t| t.elapsed() >= self.config.latency_update)
                    .unwrap_or(true);
                if due {
                    let sent_at = now_millis();
                    let envelope = Envelope::new(
                        self.address.clone(),
                        Command::Keepalive { sent_at },
                    );
                    if edge.send(envelope).is_ok() {
                        edge.ping_sent = Some((sent_at, now));
                        edge.last_probe = Some(now);
                    }
                }
            }

            // Idle pairings are released on either side.
            for (topic, last) in edge.topic_activity.clone() {
                if edge.paired.contains(&topic)
                    && last.elapsed() > self.config.pairing_idle_timeout
                {
                    unpairs.push((edge.id, topic));
                }
            }
        }

        for (conn_id, topic) in unpairs {
            let origin = self.address.clone();
            if let Some(edge) = self.edges.get_mut(&conn_id) {
                debug!(peer = %edge.label(), topic = %topic, "unpairing idle topic");
                let envelope = Envelope::new(origin, Command::Unpair).with_topic(topic.clone());
                let _ = edge.send(envelope);
                edge.paired.remove(&topic);
                edge.topic_activity.remove(&topic);
            }
        }

        for (conn_id, peer, explicit, paired) in dead {
            self.close_conn(conn_id, "keepalive timeout", false);
            if let (Some(address), true) = (peer, explicit) {
                self.schedule_reconnect(address, paired);
            }
        }

        self.intake.sweep_idle(self.config.file_idle_timeout);
    }

    fn close_conn(&mut self, conn_id: u64, reason: &str, allow_reconnect: bool) {
        let Some(edge) = self.edges.remove(&conn_id) else {
            return;
        };
        debug!(conn = conn_id, peer = %edge.label(), reason, "removing edge");
        if let Some(address) = edge.peer.clone() {
            if self.by_addr.get(&address) == Some(&conn_id) {
                self.by_addr.remove(&address);
            }
            if let Some(pd) = self.pending_dials.remove(&address) {
                for reply in pd.replies {
                    let _ = reply.send(Err(NodeError::EdgeClosed));
                }
            }
            self.transfers_out.retain(|(a, _), _| a != &address);
            if allow_reconnect && edge.explicit && !self.stopping {
                self.schedule_reconnect(address, edge.dialed_paired);
            }
        }
        edge.close();
    }

    fn shutdown(&mut self) {
        self.stopping = true;
        self.listener_task.abort();
        let ids: Vec<u64> = self.edges.keys().copied().collect();
        for id in ids {
            self.close_conn(id, "node stopping", false);
        }
        for (_, slot) in self.pending.drain() {
            let _ = slot.send(Err(NodeError::Cancelled));
        }
        for (_, pd) in self.pending_dials.drain() {
            for reply in pd.replies {
                let _ = reply.send(Err(NodeError::Cancelled));
            }
        }
        self.transfers_out.clear();
        self.delivery.close();
        info!(address = %self.address, "node stopped");
    }
}
