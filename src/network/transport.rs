//! Transport seams between nodes.

use crate::error::Result;
use crate::network::rpc::Message;
use crate::types::NodeId;
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt::Debug;
use std::time::Duration;

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a request from `from` and produce the response. Failures are
    /// reported as `Message::Error`.
    async fn handle(&self, from: NodeId, msg: Message) -> Message;
}

/// Reliable point-to-point request/response with a bounded timeout.
///
/// Responses of kind `Message::Error` are turned back into `Err` values,
/// so callers see the same error the remote handler produced. A peer that
/// cannot be reached or does not answer in time fails with
/// `NetworkError::Suspect` or `NetworkError::Timeout`.
#[async_trait]
pub trait Transport: Send + Sync + Debug + 'static {
    /// This node's id.
    fn local_node(&self) -> NodeId;

    /// Send a request and wait for its response.
    async fn send(&self, target: NodeId, msg: Message, timeout: Duration) -> Result<Message>;

    /// Send the same request to several nodes concurrently.
    async fn broadcast(
        &self,
        targets: &[NodeId],
        msg: Message,
        timeout: Duration,
    ) -> Vec<(NodeId, Result<Message>)> {
        let sends = targets.iter().map(|&target| {
            let msg = msg.clone();
            async move { (target, self.send(target, msg, timeout).await) }
        });
        join_all(sends).await
    }
}
