//! Public interface to the vrmeta core library: the Viewstamped-Replication
//! state machine of a distributed-filesystem metadata master, plus the RPC
//! operation framing shared by its client, metadata, and chunk-server
//! paths.

#[macro_use]
mod utils;

mod rpc;
mod vr;

pub use utils::{MetaError, ServerLocation, Timer};

pub use rpc::{
    add_default_request_headers, content_checksum, parse_request,
    parse_response, Buffer, ChunkAccessInfo, IdempotentInfo, MetaOp, OpCode,
    OpRequest, Properties, RequestWriter, CLIENT_PROTO_VERSION, REQ_ID_NONE,
};

pub use vr::{
    LogBlock, LogSeq, MetaDataSync, NodeFlags, NodeId, NodeInfo,
    NullMetaDataSync, ProcessResult, ReplicaConfigVr, ReplicaState,
    SyncOutcome, TransmitMsg, VrConfig, VrEvent, VrMsg, VrReplica,
    VrStateMachine, NODE_ID_NONE, VR_PARAMETERS_PREFIX,
    VR_STATUS_CONFIG_ERROR, VR_STATUS_IN_VIEW_CHANGE, VR_STATUS_LOG_SYNC,
    VR_STATUS_NOT_PRIMARY, VR_STATUS_OK, VR_STATUS_OUT_OF_ORDER,
    VR_STATUS_RECONFIGURATION, VR_STATUS_STALE_VIEW, VR_STATUS_STOPPED,
};
