//! # Chaski-Confluent
//!
//! A peer-to-peer distributed messaging fabric: long-lived nodes discover
//! each other by topic subscription, exchange typed control messages,
//! stream application payloads on a publish/subscribe overlay, relay large
//! files in chunks, and optionally authenticate peers through an in-network
//! certificate authority.
//!
//! ## Quick start
//!
//! ```ignore
//! let producer = ChaskiStreamer::start(
//!     NodeConfig::default().with_subscriptions(["topic1"]),
//! ).await?;
//! let consumer = ChaskiStreamer::start(
//!     NodeConfig::default().with_subscriptions(["topic1"]).with_paired(true),
//! ).await?;
//!
//! consumer.connect(&producer.address().to_string()).await?;
//! producer.push("topic1", b"hello".to_vec()).await?;
//! let message = consumer.recv().await.unwrap();
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `address` | Canonical `<class>@<host>:<port>` addresses |
//! | `codec` | Length-prefixed framing, pluggable serialization |
//! | `messages` | Envelope and the closed control-command set |
//! | `edge` | Per-peer duplex connection: serialized writes, read task |
//! | `node` | Node core: dispatcher, discovery, keepalive, reconnection |
//! | `streamer` | Publish/subscribe plane with a bounded delivery queue |
//! | `files` | Chunked file transfer with resume and flow control |
//! | `ca` | Embedded certificate authority (root, CSR signing, CRL) |
//! | `tls` | Mutual-TLS contexts anchored on the mesh CA |
//! | `remote` | Correlated request/response hooks for object proxies |
//!
//! ## Concurrency model
//!
//! Every node is one actor task plus one read task per edge. Handles are
//! cheap to clone and talk to the actor over channels; no lock is exposed
//! to users and edges never hold a reference back to their node.

pub mod address;
pub mod ca;
pub mod codec;
pub mod edge;
pub mod files;
pub mod messages;
pub mod node;
pub mod remote;
pub mod streamer;
pub mod tls;

pub use address::{Address, AddressParseError, ConnectTarget, NodeClass};
pub use ca::{CaAttributes, CertificateAuthority, ChaskiCa};
pub use codec::{BincodeFormat, FrameError, WireFormat};
pub use edge::EdgeInfo;
pub use files::{FileCallback, FileEvent};
pub use messages::{Command, Envelope};
pub use node::{ChaskiNode, NodeConfig, NodeError, NodeStats, OnPair, PushedFile};
pub use remote::{ChaskiRemote, ProxyHandler, ProxyRegistry};
pub use streamer::{ChaskiStreamer, DeliveryQueue, Message, StreamSession};
pub use tls::{TlsContext, TlsSettings};
