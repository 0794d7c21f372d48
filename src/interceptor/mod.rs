//! Command handler chain.
//!
//! Every cache operation is a [`Command`] that runs through an ordered list
//! of [`CommandHandler`]s. Each handler may answer the command itself or
//! pass it on through [`Next`]:
//!
//! ```text
//! ┌──────────────────────┐   ┌─────────────────────┐   ┌─────────────┐
//! │ StateTransferHandler │──►│ DistributionHandler │──►│ DataHandler │
//! │ retry, wait for      │   │ route to owners,    │   │ local data  │
//! │ topology             │   │ replicate           │   │ and txs     │
//! └──────────────────────┘   └─────────────────────┘   └─────────────┘
//! ```
//!
//! The same chain runs for commands issued locally and for commands
//! received from other nodes; [`InvocationRole`] tells the handlers which
//! part of the protocol they are executing.

mod data;
mod distribution;
mod state_transfer;

pub use data::DataHandler;
pub use distribution::DistributionHandler;
pub use state_transfer::StateTransferHandler;

use crate::cache::transactions::GlobalTransactionId;
use crate::error::{Error, Result};
use crate::types::{InternalEntry, Mutation, NodeId, TopologyId};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// Cache operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Get { key: Bytes },
    Put { entry: InternalEntry },
    Remove { key: Bytes },
    Clear,
    Prepare {
        gtx: GlobalTransactionId,
        modifications: Vec<Mutation>,
    },
    Commit { gtx: GlobalTransactionId },
    Rollback { gtx: GlobalTransactionId },
}

impl Command {
    /// Key of a single-key command.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Command::Get { key } | Command::Remove { key } => Some(key),
            Command::Put { entry } => Some(&entry.key),
            _ => None,
        }
    }

    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            Command::Prepare { .. } | Command::Commit { .. } | Command::Rollback { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::Put { .. } => "put",
            Command::Remove { .. } => "remove",
            Command::Clear => "clear",
            Command::Prepare { .. } => "prepare",
            Command::Commit { .. } => "commit",
            Command::Rollback { .. } => "rollback",
        }
    }
}

/// Which part of the protocol a node executes for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationRole {
    /// The command was issued on this node.
    Originator,
    /// Execute a write as primary owner and replicate it.
    Primary,
    /// Apply a replicated write.
    Backup,
    /// Serve a forwarded read.
    ReadOwner,
    /// Prepare, commit or roll back a transaction.
    TxParticipant,
}

/// A command sent to another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub cache: String,
    pub command: Command,
    /// Topology the sender issued the command under.
    pub topology_id: TopologyId,
    pub role: InvocationRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    Value(Option<InternalEntry>),
    Done,
}

impl CommandResult {
    pub fn into_value(self) -> Option<InternalEntry> {
        match self {
            CommandResult::Value(v) => v,
            CommandResult::Done => None,
        }
    }
}

/// Per-invocation state.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Node that sent the command.
    pub origin: NodeId,
    pub role: InvocationRole,
    /// Topology the command runs under. Carried by remote commands, chosen
    /// by the distribution handler on the originator.
    pub topology_id: Option<TopologyId>,
}

impl InvocationContext {
    pub fn local(node: NodeId) -> Self {
        Self {
            origin: node,
            role: InvocationRole::Originator,
            topology_id: None,
        }
    }

    pub fn remote(origin: NodeId, envelope: &CommandEnvelope) -> Self {
        Self {
            origin,
            role: envelope.role,
            topology_id: Some(envelope.topology_id),
        }
    }
}

/// One step of the chain.
#[async_trait]
pub trait CommandHandler: Send + Sync + Debug + 'static {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult>;
}

/// The rest of the chain after the current handler.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    handlers: &'a [Arc<dyn CommandHandler>],
}

impl<'a> Next<'a> {
    pub fn run<'b>(
        self,
        ctx: &'b mut InvocationContext,
        cmd: &'b Command,
    ) -> BoxFuture<'b, Result<CommandResult>>
    where
        'a: 'b,
    {
        match self.handlers.split_first() {
            Some((handler, rest)) => handler.handle(ctx, cmd, Next { handlers: rest }),
            None => Box::pin(async {
                Err(Error::Internal("command reached the end of the chain".into()))
            }),
        }
    }
}

/// Ordered handler list of one cache.
#[derive(Debug, Clone)]
pub struct InterceptorChain {
    handlers: Vec<Arc<dyn CommandHandler>>,
}

impl InterceptorChain {
    pub fn new(handlers: Vec<Arc<dyn CommandHandler>>) -> Self {
        Self { handlers }
    }

    pub async fn invoke(&self, mut ctx: InvocationContext, cmd: &Command) -> Result<CommandResult> {
        Next {
            handlers: &self.handlers,
        }
        .run(&mut ctx, cmd)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        answer: bool,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn handle(
            &self,
            ctx: &mut InvocationContext,
            cmd: &Command,
            next: Next<'_>,
        ) -> Result<CommandResult> {
            self.seen.lock().push(self.name);
            if self.answer {
                return Ok(CommandResult::Done);
            }
            next.run(ctx, cmd).await
        }
    }

    fn chain(answers: &[(&'static str, bool)], seen: &Arc<Mutex<Vec<&'static str>>>) -> InterceptorChain {
        InterceptorChain::new(
            answers
                .iter()
                .map(|&(name, answer)| {
                    Arc::new(Recorder {
                        name,
                        seen: seen.clone(),
                        answer,
                    }) as Arc<dyn CommandHandler>
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_and_short_circuits() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let c = chain(&[("a", false), ("b", true), ("c", false)], &seen);
        let result = c.invoke(InvocationContext::local(1), &Command::Clear).await;
        assert_eq!(result.unwrap(), CommandResult::Done);
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_chain_without_terminal_fails() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let c = chain(&[("a", false)], &seen);
        let err = c
            .invoke(InvocationContext::local(1), &Command::Clear)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_command_keys() {
        let put = Command::Put {
            entry: InternalEntry::new("k", "v"),
        };
        assert_eq!(put.key().unwrap().as_ref(), b"k");
        assert!(Command::Clear.key().is_none());
        assert!(Command::Commit {
            gtx: GlobalTransactionId { originator: 1, id: 1 }
        }
        .is_transactional());
    }
}
