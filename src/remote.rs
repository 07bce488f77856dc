//! # Remote proxy transport hooks
//!
//! [`ChaskiRemote`] carries remote object invocations over the dispatcher:
//! a `proxy_call` request names a module path and attribute path plus
//! marshaled arguments, and resolves to a correlated `proxy_call_response`.
//! The transport guarantees exactly that — correlation and bounded
//! in-flight concurrency. Argument and return marshaling belong to the
//! proxy layer above and stay opaque `Vec<u8>` here.
//!
//! Allowed module paths are a **per-node** configuration set; lookups never
//! consult any process-wide registry.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::address::{Address, ConnectTarget, NodeClass};
use crate::messages::{Command, ProxyCall, ProxyCallResponse};
use crate::node::{ChaskiNode, NodeConfig, NodeError, NodeRole};

/// Concurrent proxy calls served by one node.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Server-side handler invoked for each allowed call.
pub type ProxyHandler = Arc<dyn Fn(ProxyCall) -> Result<Vec<u8>, String> + Send + Sync>;

/// The per-node set of proxied modules and their handler.
pub struct ProxyRegistry {
    allowed: HashSet<String>,
    handler: ProxyHandler,
    limiter: Arc<Semaphore>,
}

impl ProxyRegistry {
    pub fn new<I, S>(modules: I, handler: ProxyHandler) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_max_in_flight(modules, handler, DEFAULT_MAX_IN_FLIGHT)
    }

    pub fn with_max_in_flight<I, S>(modules: I, handler: ProxyHandler, max_in_flight: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: modules.into_iter().map(Into::into).collect(),
            handler,
            limiter: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn allows(&self, module_path: &str) -> bool {
        self.allowed.contains(module_path)
    }

    /// Run one call under the in-flight limit.
    pub(crate) async fn dispatch(&self, call: ProxyCall) -> ProxyCallResponse {
        if !self.allows(&call.module_path) {
            warn!(module = %call.module_path, "proxy call to unlisted module refused");
            return ProxyCallResponse::Error(format!(
                "module not allowed: {}",
                call.module_path
            ));
        }
        let Ok(_permit) = self.limiter.acquire().await else {
            return ProxyCallResponse::Error("proxy shutting down".into());
        };
        debug!(module = %call.module_path, attr = %call.attr_path, "proxy call");
        let handler = self.handler.clone();
        match tokio::task::spawn_blocking(move || handler(call)).await {
            Ok(Ok(result)) => ProxyCallResponse::Result(result),
            Ok(Err(message)) => ProxyCallResponse::Error(message),
            Err(e) => ProxyCallResponse::Error(format!("handler panicked: {e}")),
        }
    }
}

/// A node exposing (and invoking) remote object proxies.
#[derive(Clone)]
pub struct ChaskiRemote {
    node: ChaskiNode,
}

impl ChaskiRemote {
    pub async fn start(config: NodeConfig, registry: ProxyRegistry) -> Result<Self, NodeError> {
        let node = ChaskiNode::start_with_role(
            config,
            NodeClass::Remote,
            NodeRole::Remote(Arc::new(registry)),
        )
        .await?;
        Ok(Self { node })
    }

    pub fn node(&self) -> &ChaskiNode {
        &self.node
    }

    pub fn address(&self) -> &Address {
        self.node.address()
    }

    pub async fn connect(&self, target: &str) -> Result<Address, NodeError> {
        self.node.connect(target).await
    }

    /// Invoke `module_path.attr_path(args, kwargs)` on the peer serving the
    /// proxy. Resolves with the marshaled result or the peer's error.
    pub async fn call(
        &self,
        to: &str,
        module_path: &str,
        attr_path: &str,
        args: Vec<Vec<u8>>,
        kwargs: BTreeMap<String, Vec<u8>>,
    ) -> Result<Vec<u8>, NodeError> {
        let target: ConnectTarget = to
            .parse()
            .map_err(|e| NodeError::Other(format!("invalid address: {e}")))?;
        let response = self
            .node
            .request(
                &target.address,
                Command::ProxyCall(ProxyCall {
                    module_path: module_path.to_string(),
                    attr_path: attr_path.to_string(),
                    args,
                    kwargs,
                }),
            )
            .await?;
        match response.command {
            Command::ProxyCallResponse(ProxyCallResponse::Result(result)) => Ok(result),
            Command::ProxyCallResponse(ProxyCallResponse::Error(message)) => {
                Err(NodeError::Other(message))
            }
            _ => Err(NodeError::UnexpectedResponse("proxy_call")),
        }
    }

    pub async fn stop(&self) {
        self.node.stop().await;
    }
}
