//! # Wire Protocol Messages
//!
//! All envelopes exchanged between nodes are defined here. Envelopes are
//! serialized with bincode and framed by the codec; deserialization is
//! always bounded to prevent memory exhaustion from hostile peers.
//!
//! ## Command set
//!
//! The command set is closed: every on-wire message is one variant of
//! [`Command`]. An unknown tag fails bincode decoding and is treated as a
//! protocol error by the receiving edge, never silently ignored.
//!
//! | Group | Commands |
//! |-------|----------|
//! | Edge lifecycle | `ReportPaired`, `Keepalive`, `KeepaliveResponse`, `TooManyEdges`, `Terminate` |
//! | Discovery | `Discovery`, `Pairing`, `PairDeclined`, `Unpair` |
//! | Streaming | `TopicMessage` |
//! | File transfer | `FileChunk`, `FileResumeFrom`, `FileTransferFailed`, `FlowPause`, `FlowResume` |
//! | CA | `CaRequestCertificate(+Response)`, `CaRevoke`, `CaGetCrl(+Response)` |
//! | Remote proxy | `ProxyCall(+Response)` |
//!
//! ## Correlation
//!
//! Requests that expect a reply (`Keepalive`, `CaRequestCertificate`,
//! `CaGetCrl`, `ProxyCall`) are answered with an envelope carrying the
//! **same id**; the origin installs a pending slot keyed by that id before
//! sending.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;

/// Default ceiling for a deserialized envelope (matches the default frame
/// limit plus framing overhead).
pub const MAX_DESERIALIZE_SIZE: u64 = 64 * 1024 * 1024 + 4096;

/// Returns bincode options with size limits enforced.
/// Always use this for deserialization of peer-supplied bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_envelope(envelope: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(envelope)
}

pub fn deserialize_envelope(bytes: &[u8]) -> Result<Envelope, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Milliseconds since the Unix epoch, the timestamp carried by envelopes.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The unit of on-wire communication.
///
/// `ttl` and `visited` are only meaningful for discovery envelopes; they
/// ride on the envelope (not the command payload) so forwarding can rewrite
/// them without reconstructing the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique within the origin; responses echo the request id.
    pub id: Uuid,
    /// Origin wall clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Canonical address of the sending node.
    pub origin: Address,
    /// Remaining discovery hops. Zero for non-discovery traffic.
    pub ttl: u8,
    /// Addresses that have already forwarded this envelope, in order.
    pub visited: Vec<Address>,
    /// Topic the envelope concerns, when any.
    pub topic: Option<String>,
    pub command: Command,
}

impl Envelope {
    pub fn new(origin: Address, command: Command) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_millis(),
            origin,
            ttl: 0,
            visited: Vec::new(),
            topic: None,
            command,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Build a response envelope correlated to this request.
    pub fn respond(&self, origin: Address, command: Command) -> Envelope {
        Envelope {
            id: self.id,
            timestamp: now_millis(),
            origin,
            ttl: 0,
            visited: Vec::new(),
            topic: self.topic.clone(),
            command,
        }
    }
}

/// Initial handshake after TCP accept/connect, and its echo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPaired {
    /// The sender's canonical (listening) address.
    pub address: Address,
    pub subscriptions: Vec<String>,
    /// When true, pairing on every shared topic is established immediately,
    /// bypassing discovery.
    pub paired: bool,
}

/// One chunk of a file in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_id: Uuid,
    pub filename: String,
    /// Zero-based chunk index.
    pub index: u64,
    pub total_chunks: u64,
    pub chunk_size: u64,
    /// Total file size in bytes.
    pub size: u64,
    pub data: Vec<u8>,
    /// SHA-256 of `data`; verified by the receiver before the chunk is
    /// accepted.
    pub sha256: [u8; 32],
    pub eof: bool,
    /// Opaque application attachment, delivered to the receive callback.
    pub attachment: Vec<u8>,
}

/// Certificate request served by a CA node. When `csr_pem` is absent the CA
/// generates a key and CSR on the requester's behalf and returns the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaCertificateRequest {
    /// Subject attributes: Country, State, Locality, Organization, Common Name.
    pub subject: BTreeMap<String, String>,
    /// Requester IP, included as a SAN entry.
    pub ip: String,
    pub csr_pem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaCertificateResponse {
    pub certificate_pem: String,
    pub root_certificate_pem: String,
    /// Present only when the CA generated the key on the requester's behalf.
    pub private_key_pem: Option<String>,
    /// Hex serial of the issued certificate.
    pub serial: String,
}

/// Remote object invocation over the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyCall {
    pub module_path: String,
    pub attr_path: String,
    /// Positional arguments, marshaled by the proxy layer.
    pub args: Vec<Vec<u8>>,
    /// Keyword arguments, marshaled by the proxy layer.
    pub kwargs: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyCallResponse {
    Result(Vec<u8>),
    Error(String),
}

/// The closed command set. See the module docs for grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ReportPaired(ReportPaired),
    Keepalive {
        /// Sender clock at send time, echoed back for RTT measurement.
        sent_at: u64,
    },
    KeepaliveResponse {
        sent_at: u64,
    },
    /// TTL-bounded topic discovery; the topic rides on the envelope.
    Discovery {
        /// The node originally asking to be paired.
        previous_node: Address,
    },
    /// Direct response to a discovery: the responder offers to pair.
    Pairing {
        responder: Address,
    },
    PairDeclined,
    Unpair,
    TopicMessage {
        payload: Vec<u8>,
    },
    FileChunk(FileChunk),
    /// Receiver-side: resume (or re-request a corrupted chunk) from `next_index`.
    FileResumeFrom {
        file_id: Uuid,
        next_index: u64,
    },
    FileTransferFailed {
        file_id: Uuid,
        reason: String,
    },
    FlowPause {
        file_id: Uuid,
    },
    FlowResume {
        file_id: Uuid,
    },
    CaRequestCertificate(CaCertificateRequest),
    CaRequestCertificateResponse(CaCertificateResponse),
    CaRevoke {
        serial: String,
    },
    CaGetCrl,
    CaGetCrlResponse {
        crl_pem: String,
    },
    ProxyCall(ProxyCall),
    ProxyCallResponse(ProxyCallResponse),
    /// Inbound connection refused: the edge cap is reached.
    TooManyEdges,
    /// Ask the peer to close this edge without reconnecting.
    Terminate,
}

impl Command {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ReportPaired(_) => "report_paired",
            Command::Keepalive { .. } => "keepalive",
            Command::KeepaliveResponse { .. } => "keepalive_response",
            Command::Discovery { .. } => "discovery",
            Command::Pairing { .. } => "pairing",
            Command::PairDeclined => "pair_declined",
            Command::Unpair => "unpair",
            Command::TopicMessage { .. } => "topic_message",
            Command::FileChunk(_) => "file_chunk",
            Command::FileResumeFrom { .. } => "file_resume_from",
            Command::FileTransferFailed { .. } => "file_transfer_failed",
            Command::FlowPause { .. } => "flow_pause",
            Command::FlowResume { .. } => "flow_resume",
            Command::CaRequestCertificate(_) => "ca_request_certificate",
            Command::CaRequestCertificateResponse(_) => "ca_request_certificate_response",
            Command::CaRevoke { .. } => "ca_revoke",
            Command::CaGetCrl => "ca_get_crl",
            Command::CaGetCrlResponse { .. } => "ca_get_crl_response",
            Command::ProxyCall(_) => "proxy_call",
            Command::ProxyCallResponse(_) => "proxy_call_response",
            Command::TooManyEdges => "too_many_edges",
            Command::Terminate => "terminate",
        }
    }

    /// True for commands that resolve a pending request slot.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Command::KeepaliveResponse { .. }
                | Command::CaRequestCertificateResponse(_)
                | Command::CaGetCrlResponse { .. }
                | Command::ProxyCallResponse(_)
        )
    }
}
