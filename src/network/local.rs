//! In-process network used by tests and embedded clusters.
//!
//! Every message is round-tripped through the bincode codec so the wire
//! format is exercised, and every request runs on its own task, like an
//! inbound RPC stream on a real node. Nodes can be killed and the network
//! can be split into partitions.

use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{decode_message, encode_message, Message};
use crate::network::transport::{MessageHandler, Transport};
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Registry of node handlers connected by an in-memory network.
#[derive(Default)]
pub struct InMemoryNetwork {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    killed: RwLock<HashSet<NodeId>>,
    /// Partition group per node; nodes in different groups cannot talk.
    groups: RwLock<HashMap<NodeId, usize>>,
}

impl fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("nodes", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("killed", &*self.killed.read())
            .finish()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect a node's handler.
    pub fn register(&self, node: NodeId, handler: Arc<dyn MessageHandler>) {
        self.killed.write().remove(&node);
        self.handlers.write().insert(node, handler);
    }

    /// Transport for a node.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node,
            network: self.clone(),
        })
    }

    /// Crash a node: it stops receiving and sending.
    pub fn kill(&self, node: NodeId) {
        self.handlers.write().remove(&node);
        self.killed.write().insert(node);
        debug!(node, "Node killed");
    }

    /// Split the network. Nodes not listed stay in group 0 with the first group.
    pub fn partition(&self, groups: &[Vec<NodeId>]) {
        let mut map = self.groups.write();
        map.clear();
        for (i, group) in groups.iter().enumerate() {
            for node in group {
                map.insert(*node, i);
            }
        }
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.groups.write().clear();
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        !self.killed.read().contains(&node) && self.handlers.read().contains_key(&node)
    }

    fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        if !self.is_alive(from) || !self.is_alive(to) {
            return false;
        }
        let groups = self.groups.read();
        groups.get(&from).copied().unwrap_or(0) == groups.get(&to).copied().unwrap_or(0)
    }

    fn handler(&self, node: NodeId) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(&node).cloned()
    }
}

/// One node's endpoint on an [`InMemoryNetwork`].
pub struct LocalTransport {
    node: NodeId,
    network: Arc<InMemoryNetwork>,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("node", &self.node)
            .finish()
    }
}

fn roundtrip(msg: &Message) -> Result<Message> {
    let bytes = encode_message(msg)?;
    decode_message(&bytes).map_err(|e| NetworkError::Deserialization(e.to_string()).into())
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn send(&self, target: NodeId, msg: Message, timeout: Duration) -> Result<Message> {
        if !self.network.can_reach(self.node, target) {
            return Err(NetworkError::Suspect(target).into());
        }
        let handler = self
            .network
            .handler(target)
            .ok_or(NetworkError::Suspect(target))?;

        let request = roundtrip(&msg)?;
        let from = self.node;
        let task = tokio::spawn(async move { handler.handle(from, request).await });

        let response = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(Error::Internal(format!("handler task failed: {e}"))),
            Err(_) => return Err(NetworkError::Timeout(target).into()),
        };

        // a reply from a node that died meanwhile is lost
        if !self.network.can_reach(self.node, target) {
            return Err(NetworkError::Suspect(target).into());
        }
        roundtrip(&response)?.into_result()
    }
}
