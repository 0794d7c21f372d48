//! Inter-node message types and codec.

use crate::error::{Error, NetworkError, RemoteError, Result};
use crate::interceptor::{CommandEnvelope, CommandResult};
use crate::rebalancing::transfer::{StateRequest, StateResponse, TransactionInfo};
use crate::rebalancing::RebalancingStatus;
use crate::topology::{
    AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, ManagerStatusResponse,
};
use crate::types::{NodeId, TopologyId, ViewId};
use serde::{Deserialize, Serialize};

/// Maximum encoded frame size accepted from the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Every message exchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// A node joins a cache. Sent to the coordinator.
    Join {
        cache: String,
        joiner: NodeId,
        join_info: CacheJoinInfo,
        view_id: ViewId,
    },

    /// A node leaves a cache. Sent to the coordinator.
    Leave {
        cache: String,
        leaver: NodeId,
        view_id: ViewId,
    },

    /// A member finished applying a rebalance phase.
    RebalancePhaseConfirm {
        cache: String,
        node: NodeId,
        topology_id: TopologyId,
        view_id: ViewId,
    },

    /// Enable or disable rebalancing for one cache or, with `cache: None`,
    /// for the whole cluster. Sent to the coordinator.
    RebalancePolicyUpdate {
        cache: Option<String>,
        enabled: bool,
    },

    /// Start a rebalance now if the cache is not balanced.
    ForceRebalance { cache: String },

    /// Ask the coordinator for a cache's rebalancing status.
    RebalancingStatusRequest { cache: String },

    /// Change a cache's availability mode. Sent to the coordinator.
    AvailabilityModeUpdate {
        cache: String,
        mode: AvailabilityMode,
    },

    /// Coordinator starts a rebalance.
    RebalanceStart {
        cache: String,
        topology: CacheTopology,
        view_id: ViewId,
    },

    /// Coordinator installs a new topology.
    TopologyUpdate {
        cache: String,
        topology: CacheTopology,
        availability: AvailabilityMode,
        view_id: ViewId,
    },

    /// Coordinator records a new stable topology.
    StableTopologyUpdate {
        cache: String,
        topology: CacheTopology,
        view_id: ViewId,
    },

    /// Coordinator tells members the cluster-wide rebalancing flag.
    RebalancingEnabled { enabled: bool },

    /// A newly elected coordinator collects every member's state.
    StatusRequest { view_id: ViewId },

    /// Consumer to provider.
    StateRequest(StateRequest),

    /// Provider to consumer.
    StateResponse(StateResponse),

    /// Remote command execution.
    Command(CommandEnvelope),

    // Responses
    CacheStatus(CacheStatusResponse),
    ManagerStatus(ManagerStatusResponse),
    RebalancingStatus(RebalancingStatus),
    Transactions(Vec<TransactionInfo>),
    CommandResult(CommandResult),
    Ack,
    Error(RemoteError),
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "join",
            Message::Leave { .. } => "leave",
            Message::RebalancePhaseConfirm { .. } => "rebalance_phase_confirm",
            Message::RebalancePolicyUpdate { .. } => "rebalance_policy_update",
            Message::ForceRebalance { .. } => "force_rebalance",
            Message::RebalancingStatusRequest { .. } => "rebalancing_status_request",
            Message::AvailabilityModeUpdate { .. } => "availability_mode_update",
            Message::RebalanceStart { .. } => "rebalance_start",
            Message::TopologyUpdate { .. } => "topology_update",
            Message::StableTopologyUpdate { .. } => "stable_topology_update",
            Message::RebalancingEnabled { .. } => "rebalancing_enabled",
            Message::StatusRequest { .. } => "status_request",
            Message::StateRequest(_) => "state_request",
            Message::StateResponse(_) => "state_response",
            Message::Command(_) => "command",
            Message::CacheStatus(_) => "cache_status",
            Message::ManagerStatus(_) => "manager_status",
            Message::RebalancingStatus(_) => "rebalancing_status",
            Message::Transactions(_) => "transactions",
            Message::CommandResult(_) => "command_result",
            Message::Ack => "ack",
            Message::Error(_) => "error",
        }
    }

    /// Wrap a handler result as a response.
    pub fn from_result(result: Result<Message>) -> Message {
        match result {
            Ok(msg) => msg,
            Err(e) => Message::Error(RemoteError::from(&e)),
        }
    }

    /// Turn an error response back into an `Err`.
    pub fn into_result(self) -> Result<Message> {
        match self {
            Message::Error(remote) => Err(remote.into()),
            other => Ok(other),
        }
    }

    /// Expect a plain acknowledgement.
    pub fn expect_ack(self) -> Result<()> {
        match self.into_result()? {
            Message::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

pub(crate) fn unexpected(msg: &Message) -> Error {
    NetworkError::UnexpectedResponse(msg.kind().to_string()).into()
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> std::result::Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a sender id and message with a length prefix for TCP transmission.
pub fn frame_message(from: NodeId, msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    let data = bincode::serialize(&(from, msg))?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Decode the body of a frame produced by [`frame_message`].
pub fn decode_frame(data: &[u8]) -> std::result::Result<(NodeId, Message), bincode::Error> {
    bincode::deserialize(data)
}
