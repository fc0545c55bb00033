//! Peer-to-peer message types of the replication protocol.

use crate::vr::{LogSeq, NodeId, VrConfig};

use get_size::GetSize;
use serde::{Deserialize, Serialize};

/// A contiguous range of log records shipped as one unit.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, GetSize,
)]
pub struct LogBlock {
    /// First record of the block.
    pub start_seq: LogSeq,

    /// Last record of the block; `start_seq <= end_seq`.
    pub end_seq: LogSeq,

    /// Committed tail the sender knew when shipping;
    /// `committed_seq <= end_seq`.
    pub committed_seq: LogSeq,

    /// Node that transmitted the block.
    pub transmitter: NodeId,
}

/// VR control messages exchanged between replicas.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum VrMsg {
    /// Connection-time announcement of a transmitter peer.
    Hello {
        node_id: NodeId,
        last_log_seq: LogSeq,
        config_hash: u64,
    },

    /// Phase 1: a replica noticed primary failure or a newer view.
    StartViewChange {
        epoch: i64,
        view: i64,
        node_id: NodeId,
        last_log_seq: LogSeq,
        last_view_end_seq: LogSeq,
        config_hash: u64,
    },

    /// Phase 2: sent to the proposed primary once quorum phase-1 messages
    /// for the same `(epoch, view)` are in hand.
    DoViewChange {
        epoch: i64,
        view: i64,
        node_id: NodeId,
        primary_id: NodeId,
        last_log_seq: LogSeq,
        last_view_end_seq: LogSeq,
    },

    /// Phase 3: the elected primary announces the new view.
    StartView {
        epoch: i64,
        view: i64,
        primary_id: NodeId,
        start_seq: LogSeq,
        committed_seq: LogSeq,
        config: VrConfig,
    },

    /// Reply carrying the receiver's current view, sent for messages whose
    /// `(epoch, view)` is older than the local one.
    StatusHint {
        epoch: i64,
        view: i64,
        status: i32,
    },
}

impl VrMsg {
    /// The `(epoch, view)` a protocol message speaks for, if it carries one.
    pub fn epoch_view(&self) -> Option<(i64, i64)> {
        match *self {
            VrMsg::StartViewChange { epoch, view, .. }
            | VrMsg::DoViewChange { epoch, view, .. }
            | VrMsg::StartView { epoch, view, .. } => Some((epoch, view)),
            VrMsg::Hello { .. } | VrMsg::StatusHint { .. } => None,
        }
    }
}

/// Everything that travels over a transmitter connection.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum TransmitMsg {
    /// A replicated log block with its opaque record payload.
    Block { block: LogBlock, payload: Vec<u8> },

    /// Per-peer write acknowledgement for a block.
    WriteDone {
        start_seq: LogSeq,
        end_seq: LogSeq,
        committed_seq: LogSeq,
        last_view_end_seq: LogSeq,
        primary_id: NodeId,
        write_ok: bool,
    },

    /// A VR control message.
    Vr(VrMsg),
}

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn epoch_view_extraction() {
        let msg = VrMsg::StartViewChange {
            epoch: 2,
            view: 3,
            node_id: 1,
            last_log_seq: LogSeq::new(2, 2, 9),
            last_view_end_seq: LogSeq::new(2, 2, 9),
            config_hash: 1,
        };
        assert_eq!(msg.epoch_view(), Some((2, 3)));
        let hello = VrMsg::Hello {
            node_id: 1,
            last_log_seq: LogSeq::NONE,
            config_hash: 1,
        };
        assert_eq!(hello.epoch_view(), None);
    }

    #[test]
    fn transmit_msg_roundtrip() {
        let msg = TransmitMsg::Block {
            block: LogBlock {
                start_seq: LogSeq::new(0, 0, 1),
                end_seq: LogSeq::new(0, 0, 4),
                committed_seq: LogSeq::new(0, 0, 0),
                transmitter: 1,
            },
            payload: vec![1, 2, 3],
        };
        let bytes = rmp_serde::encode::to_vec(&msg).unwrap();
        let back: TransmitMsg =
            rmp_serde::decode::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
