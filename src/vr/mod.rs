//! Viewstamped Replication core: the metadata master's replication state
//! machine and its driving modules.
//!
//! The protocol follows the VR-revisited scheme:
//!   - <http://pmg.csail.mit.edu/papers/vr-revisited.pdf>
//!
//! `VrStateMachine` is purely reactive and single-threaded: every mutation
//! happens inside a `handle_*`/`process`/`commit` call on the driving task.
//! Outbound protocol messages and side-effect requests accumulate in queues
//! the driver drains after each call.

mod commit;
mod config;
mod durable;
mod logseq;
mod messages;
mod process;
mod reconfig;
mod recovery;
mod replica;
mod sync;
mod transmit;
mod viewchange;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub use config::{
    NodeFlags, NodeId, NodeInfo, VrConfig, NODE_ID_NONE,
    VR_PARAMETERS_PREFIX,
};
pub use logseq::LogSeq;
pub use messages::{LogBlock, TransmitMsg, VrMsg};
pub use process::ProcessResult;
pub use replica::{ReplicaConfigVr, VrReplica};
pub use sync::{MetaDataSync, NullMetaDataSync, SyncOutcome};

pub(crate) use durable::CheckpointHub;
pub(crate) use transmit::LogTransmitterHub;

/// Healthy and serving.
pub const VR_STATUS_OK: i32 = 0;
/// Serving, but this node is not the primary.
pub const VR_STATUS_NOT_PRIMARY: i32 = 1;
/// A view change is in progress.
pub const VR_STATUS_IN_VIEW_CHANGE: i32 = 2;
/// Pulling checkpoint/log state from a peer.
pub const VR_STATUS_LOG_SYNC: i32 = 3;
/// Restoring / replaying persisted state.
pub const VR_STATUS_RECONFIGURATION: i32 = 4;
/// Message carried an `(epoch, view)` older than the local one.
pub const VR_STATUS_STALE_VIEW: i32 = 5;
/// Block arrived out of order; the transmitter must resend from earlier.
pub const VR_STATUS_OUT_OF_ORDER: i32 = 6;
/// Unrecoverable configuration error.
pub const VR_STATUS_CONFIG_ERROR: i32 = -1;
/// Replica stopped (divergence or removed from the replica set).
pub const VR_STATUS_STOPPED: i32 = -2;

/// Lifecycle states of one replica.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReplicaState {
    /// Restoring persisted state / replaying the log at startup.
    Reconfiguration,

    /// Electing a primary.
    ViewChange,

    /// Serving as the view's primary.
    PrimaryOperational,

    /// Following the view's primary.
    BackupOperational,

    /// Pulling checkpoint + log segments from the primary.
    LogSync,

    /// Terminal: removed from the replica set or log divergence.
    Stopped,
}

impl ReplicaState {
    /// Human-readable state name for logs and status surfaces.
    pub fn name(self) -> &'static str {
        match self {
            ReplicaState::Reconfiguration => "reconfiguration",
            ReplicaState::ViewChange => "view_change",
            ReplicaState::PrimaryOperational => "primary",
            ReplicaState::BackupOperational => "backup",
            ReplicaState::LogSync => "log_sync",
            ReplicaState::Stopped => "stopped",
        }
    }
}

/// Side effects the state machine asks its driver to perform.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum VrEvent {
    /// Discard the local uncommitted log suffix beyond `seq`.
    TruncateUncommitted { seq: LogSeq },

    /// Start pulling state from `primary` until the local log reaches
    /// `target`.
    StartLogSync { target: LogSeq, primary: NodeId },

    /// A peer presented an unknown configuration hash; fetch current state
    /// before resuming the view change.
    ConfigMismatch { peer: NodeId },

    /// A reconfiguration record committed and the new config is in force.
    ConfigInstalled { epoch: i64 },

    /// This node is no longer part of the replica set.
    Shutdown,
}

/// Per-view-change ballot: who voted, with their log tails.
#[derive(Debug, Clone)]
pub(crate) struct ViewChangeBallot {
    /// Proposed epoch.
    epoch: i64,

    /// Proposed view.
    view: i64,

    /// `StartViewChange` votes: node -> (last_log_seq, last_view_end_seq).
    start_votes: BTreeMap<NodeId, (LogSeq, LogSeq)>,

    /// `DoViewChange` votes received as the proposed primary.
    do_votes: BTreeMap<NodeId, (LogSeq, LogSeq)>,

    /// Monotonic second this attempt began; bounds its lifetime.
    started_at: i64,

    /// Whether this node already sent its `DoViewChange`.
    do_view_sent: bool,
}

impl ViewChangeBallot {
    fn new(epoch: i64, view: i64, started_at: i64) -> Self {
        ViewChangeBallot {
            epoch,
            view,
            start_votes: BTreeMap::new(),
            do_votes: BTreeMap::new(),
            started_at,
            do_view_sent: false,
        }
    }
}

/// Ack bookkeeping for one in-flight log block on the primary.
#[derive(Debug, Clone)]
pub(crate) struct BlockAck {
    /// First record of the block.
    start_seq: LogSeq,

    /// Voting nodes that reported a successful durable write.
    acks: BTreeSet<NodeId>,
}

/// The replication state machine.
pub struct VrStateMachine {
    /// This node's ID in the replica set.
    node_id: NodeId,

    /// Current lifecycle state.
    state: ReplicaState,

    /// The replica-set configuration in force.
    config: VrConfig,

    /// Current epoch.
    epoch: i64,

    /// Current view within the epoch.
    view: i64,

    /// Primary of the current view; `NODE_ID_NONE` when unknown.
    primary_id: NodeId,

    /// First sequence of the current view.
    view_start_seq: LogSeq,

    /// Local log tail.
    last_log_seq: LogSeq,

    /// Committed tail; only ever advances.
    committed_seq: LogSeq,

    /// Where the previous view ended.
    last_view_end_seq: LogSeq,

    /// Monotonic second of the last evidence of healthy progress.
    last_up_time: i64,

    /// Set by accept/commit paths, folded into `last_up_time` by `process`.
    progress_seen: bool,

    /// In-flight view-change ballot, if any.
    ballot: Option<ViewChangeBallot>,

    /// Primary-side ack tracking, keyed by block end sequence.
    block_acks: BTreeMap<LogSeq, BlockAck>,

    /// Reconfiguration staged at a log sequence, installed at its commit.
    pending_config: Option<(LogSeq, VrConfig)>,

    /// Log position a `LogSync` must reach before rejoining.
    sync_target: LogSeq,

    /// Queued outbound messages: `(None, msg)` broadcasts, `(Some(node),
    /// msg)` unicasts. Suppressed during startup replay.
    out_msgs: VecDeque<(Option<NodeId>, VrMsg)>,

    /// Queued side-effect requests for the driver.
    out_events: VecDeque<VrEvent>,

    /// Startup configuration was unusable; reported as negative status.
    config_error: bool,

    /// Inject a view-start record into the log pipeline on the next tick.
    start_view_record_pending: bool,

    /// Opaque collaborator counters carried through checkpoints.
    err_checksum: i64,
    committed_fid_seed: i64,
    committed_status: i32,
}

impl VrStateMachine {
    /// Creates a state machine in the startup `Reconfiguration` state with
    /// an empty configuration; `restore` + `start` bring it online.
    pub fn new(node_id: NodeId) -> Self {
        VrStateMachine {
            node_id,
            state: ReplicaState::Reconfiguration,
            config: VrConfig::default(),
            epoch: 0,
            view: 0,
            primary_id: NODE_ID_NONE,
            view_start_seq: LogSeq::START,
            last_log_seq: LogSeq::NONE,
            committed_seq: LogSeq::NONE,
            last_view_end_seq: LogSeq::NONE,
            last_up_time: 0,
            progress_seen: false,
            ballot: None,
            block_acks: BTreeMap::new(),
            pending_config: None,
            sync_target: LogSeq::NONE,
            out_msgs: VecDeque::new(),
            out_events: VecDeque::new(),
            config_error: false,
            start_view_record_pending: false,
            err_checksum: 0,
            committed_fid_seed: 0,
            committed_status: 0,
        }
    }

    /// This node's ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Whether a valid node ID was assigned.
    pub fn has_valid_node_id(&self) -> bool {
        self.node_id >= 0
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplicaState {
        self.state
    }

    /// Health/status code: 0 healthy, positive transient, negative fatal.
    pub fn get_status(&self) -> i32 {
        if self.config_error {
            return VR_STATUS_CONFIG_ERROR;
        }
        match self.state {
            ReplicaState::PrimaryOperational
            | ReplicaState::BackupOperational => VR_STATUS_OK,
            ReplicaState::ViewChange => VR_STATUS_IN_VIEW_CHANGE,
            ReplicaState::LogSync => VR_STATUS_LOG_SYNC,
            ReplicaState::Reconfiguration => VR_STATUS_RECONFIGURATION,
            ReplicaState::Stopped => VR_STATUS_STOPPED,
        }
    }

    /// Whether this node is the operating primary.
    pub fn is_primary(&self) -> bool {
        self.state == ReplicaState::PrimaryOperational
            && self.primary_id == self.node_id
    }

    /// Primary of the current view, `NODE_ID_NONE` when unknown.
    pub fn get_primary_node_id(&self) -> NodeId {
        match self.state {
            ReplicaState::PrimaryOperational
            | ReplicaState::BackupOperational
            | ReplicaState::LogSync => self.primary_id,
            _ => NODE_ID_NONE,
        }
    }

    /// Primary of the view containing `seq`; only the current view is
    /// tracked, older positions answer `NODE_ID_NONE`.
    pub fn get_primary_node_id_at(&self, seq: LogSeq) -> NodeId {
        if seq.epoch == self.epoch && seq.view == self.view {
            self.get_primary_node_id()
        } else {
            NODE_ID_NONE
        }
    }

    /// Smallest majority of the Active set under the config in force.
    pub fn get_quorum(&self) -> usize {
        self.config.quorum()
    }

    /// Read-only view of the configuration in force.
    pub fn get_config(&self) -> &VrConfig {
        &self.config
    }

    /// Current `(epoch, view)`.
    pub fn epoch_view(&self) -> (i64, i64) {
        (self.epoch, self.view)
    }

    /// Local log tail.
    pub fn last_log_seq(&self) -> LogSeq {
        self.last_log_seq
    }

    /// Committed tail.
    pub fn committed_seq(&self) -> LogSeq {
        self.committed_seq
    }

    /// Rejects acks that name a primary other than the current view's.
    pub fn validate_ack_primary_id(
        &self,
        node_id: NodeId,
        primary_id: NodeId,
    ) -> bool {
        let _ = node_id;
        primary_id == NODE_ID_NONE || primary_id == self.primary_id
    }

    /// Drains queued outbound messages.
    pub fn drain_msgs(&mut self) -> Vec<(Option<NodeId>, VrMsg)> {
        self.out_msgs.drain(..).collect()
    }

    /// Drains queued side-effect requests.
    pub fn drain_events(&mut self) -> Vec<VrEvent> {
        self.out_events.drain(..).collect()
    }

    // Queues an outbound message unless replay is still in progress (no
    // protocol traffic may leave a replica that has not finished restoring).
    fn push_msg(&mut self, target: Option<NodeId>, msg: VrMsg) {
        if self.state == ReplicaState::Reconfiguration {
            return;
        }
        self.out_msgs.push_back((target, msg));
    }

    fn push_event(&mut self, event: VrEvent) {
        self.out_events.push_back(event);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::utils::ServerLocation;

    /// A 3-node all-Active config with ids 1/2/3 and primary orders 0/1/2.
    pub(crate) fn three_node_config() -> VrConfig {
        let mut config = VrConfig::default();
        for (id, order) in [(1, 0), (2, 1), (3, 2)] {
            config.add_node(
                id,
                NodeInfo::new(
                    NodeFlags::ACTIVE,
                    order,
                    vec![ServerLocation::new(
                        "127.0.0.1",
                        (20000 + id) as u16,
                    )],
                ),
            );
        }
        config
    }

    /// A started backup replica at epoch 0 view 0 with the given log tail.
    pub(crate) fn started_sm(
        node_id: NodeId,
        config: VrConfig,
        last_log_seq: LogSeq,
    ) -> VrStateMachine {
        let mut sm = VrStateMachine::new(node_id);
        sm.config = config;
        sm.last_log_seq = last_log_seq;
        sm.committed_seq = last_log_seq;
        let status = sm.start(0);
        assert!(status >= 0, "start failed with status {}", status);
        sm
    }
}
