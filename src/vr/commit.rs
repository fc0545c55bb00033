//! Log-block acceptance, write acknowledgements, and the quorum commit rule.

use super::*;

impl VrStateMachine {
    /// Offers a log block to the state machine. On the primary (the block's
    /// transmitter is this node) this registers ack tracking for the block;
    /// on a backup it validates ordering against the local tail and adopts
    /// the block. Returns 0 to accept, or a status code the transmitter
    /// reports back as a failed write.
    pub fn handle_log_block(
        &mut self,
        start_seq: LogSeq,
        end_seq: LogSeq,
        committed_seq: LogSeq,
        transmitter: NodeId,
    ) -> i32 {
        if self.state == ReplicaState::Stopped {
            return VR_STATUS_STOPPED;
        }
        if !start_seq.is_valid() || end_seq < start_seq
            || committed_seq > end_seq
        {
            pf_warn!(
                "malformed log block [{}] - [{}] committed [{}]",
                start_seq,
                end_seq,
                committed_seq
            );
            return VR_STATUS_OUT_OF_ORDER;
        }

        if transmitter == self.node_id {
            return self.handle_own_log_block(start_seq, end_seq);
        }
        self.handle_replicated_log_block(
            start_seq,
            end_seq,
            committed_seq,
            transmitter,
        )
    }

    // Primary side: a locally produced block enters the pipeline.
    fn handle_own_log_block(
        &mut self,
        start_seq: LogSeq,
        end_seq: LogSeq,
    ) -> i32 {
        if !self.is_primary() {
            return VR_STATUS_NOT_PRIMARY;
        }
        if end_seq.epoch != self.epoch || end_seq.view != self.view {
            // blocks of an older view must be re-proposed, never carried over
            return VR_STATUS_STALE_VIEW;
        }
        if self.last_log_seq.is_valid() && start_seq <= self.last_log_seq
            && end_seq <= self.last_log_seq
        {
            return VR_STATUS_OK; // retransmission of known records
        }

        self.last_log_seq = end_seq;
        self.block_acks.entry(end_seq).or_insert_with(|| BlockAck {
            start_seq,
            acks: BTreeSet::new(),
        });
        pf_trace!(
            "accepted own block [{}] - [{}] for replication",
            start_seq,
            end_seq
        );
        VR_STATUS_OK
    }

    // Backup side: a block replicated from the primary.
    fn handle_replicated_log_block(
        &mut self,
        start_seq: LogSeq,
        end_seq: LogSeq,
        committed_seq: LogSeq,
        transmitter: NodeId,
    ) -> i32 {
        match self.state {
            ReplicaState::BackupOperational | ReplicaState::LogSync => {}
            ReplicaState::ViewChange => return VR_STATUS_IN_VIEW_CHANGE,
            ReplicaState::Reconfiguration => {
                return VR_STATUS_RECONFIGURATION
            }
            ReplicaState::PrimaryOperational => {
                // a competing transmitter implies a view newer than ours
                // exists or the peer is stale; either way do not adopt
                return VR_STATUS_NOT_PRIMARY;
            }
            ReplicaState::Stopped => return VR_STATUS_STOPPED,
        }
        if end_seq.epoch < self.epoch
            || (end_seq.epoch == self.epoch && end_seq.view < self.view)
        {
            return VR_STATUS_STALE_VIEW;
        }
        if self.primary_id != NODE_ID_NONE && transmitter != self.primary_id
        {
            pf_warn!(
                "log block from {} but primary is {}",
                transmitter,
                self.primary_id
            );
            return VR_STATUS_NOT_PRIMARY;
        }

        if end_seq <= self.committed_seq {
            return VR_STATUS_OK; // retransmission of the committed prefix
        }
        if start_seq < self.committed_seq && end_seq > self.committed_seq {
            // retransmission overlapping the committed tail; adopt the rest
        } else if self.last_log_seq.is_valid()
            && start_seq > self.last_log_seq.next()
            && start_seq.in_same_view(&self.last_log_seq)
        {
            // a hole in the record stream
            let lag = self.last_log_seq.seq_distance(&start_seq);
            if lag > self.config.change_view_max_log_distance {
                self.enter_log_sync(end_seq);
                return VR_STATUS_LOG_SYNC;
            }
            return VR_STATUS_OUT_OF_ORDER;
        }

        self.last_log_seq = end_seq;
        self.progress_seen = true;
        if committed_seq.is_valid() {
            self.advance_committed(committed_seq);
        }
        pf_trace!(
            "adopted block [{}] - [{}] <- {}",
            start_seq,
            end_seq,
            transmitter
        );
        VR_STATUS_OK
    }

    /// Primary-side ingestion of one peer's durable-write acknowledgement
    /// for a block. Duplicate acks are idempotent, acks are reorder-safe
    /// across peers, and acks for blocks of older views are dropped (a
    /// block cannot commit outside its originating view). Returns the
    /// current primary id for ack validation on the caller's side.
    pub fn log_block_write_done(
        &mut self,
        node_id: NodeId,
        start_seq: LogSeq,
        end_seq: LogSeq,
        committed_seq: LogSeq,
        last_view_end_seq: LogSeq,
        write_ok: bool,
    ) -> NodeId {
        let _ = (start_seq, committed_seq);
        if !self.is_primary() {
            return self.primary_id;
        }
        if !write_ok {
            pf_debug!(
                "write-failed ack <- {} for block end [{}]",
                node_id,
                end_seq
            );
            return self.primary_id;
        }
        if end_seq.epoch != self.epoch || end_seq.view != self.view {
            // stale ack from a previous view
            return self.primary_id;
        }
        if !self.config.is_voting(node_id) {
            pf_warn!("ack from non-voting node {}", node_id);
            return self.primary_id;
        }
        if last_view_end_seq.is_valid()
            && self.last_view_end_seq.is_valid()
            && last_view_end_seq != self.last_view_end_seq
        {
            pf_warn!(
                "ack <- {} with divergent view end [{}], local [{}]",
                node_id,
                last_view_end_seq,
                self.last_view_end_seq
            );
            return self.primary_id;
        }

        let Some(tracker) = self.block_acks.get_mut(&end_seq) else {
            return self.primary_id; // already committed or never proposed
        };
        tracker.acks.insert(node_id);

        let quorum = self.config.quorum();
        if tracker.acks.len() >= quorum {
            pf_debug!(
                "block end [{}] reached quorum {} of {}",
                end_seq,
                tracker.acks.len(),
                quorum
            );
            self.advance_committed(end_seq);
        }
        self.primary_id
    }

    /// Terminal peer failure for a block transmission. Idempotent; the
    /// quorum computation simply never sees an ack from the peer.
    pub fn handle_log_block_failed(
        &mut self,
        node_id: NodeId,
        block_end_seq: LogSeq,
    ) {
        pf_debug!(
            "transmit failed -> {} for block end [{}]",
            node_id,
            block_end_seq
        );
    }

    /// External commit notice (e.g. the local log writer finished fsync of
    /// a prefix, or a commit rode in on a later block). Monotone.
    pub fn commit(&mut self, seq: LogSeq) {
        if seq.is_valid() {
            self.advance_committed(seq);
        }
    }

    // Advances the committed tail, clamped to the local log tail and
    // monotone; installs a staged config whose record got covered.
    pub(super) fn advance_committed(&mut self, seq: LogSeq) {
        let seq = seq.min(self.last_log_seq);
        if seq <= self.committed_seq {
            return;
        }
        self.committed_seq = seq;
        self.progress_seen = true;

        // forget ack state for everything now committed
        let done: Vec<LogSeq> = self
            .block_acks
            .range(..=seq)
            .map(|(end, _)| *end)
            .collect();
        for end in done {
            self.block_acks.remove(&end);
        }

        self.maybe_install_config();
    }

    // Leaves the serving states for LogSync until the log reaches `target`.
    pub(super) fn enter_log_sync(&mut self, target: LogSeq) {
        if self.state == ReplicaState::LogSync && self.sync_target >= target
        {
            return;
        }
        pf_info!(
            "entering log sync: local [{}], target [{}]",
            self.last_log_seq,
            target
        );
        self.state = ReplicaState::LogSync;
        self.sync_target = target;
        self.push_event(VrEvent::StartLogSync {
            target,
            primary: self.primary_id,
        });
    }
}

#[cfg(test)]
mod commit_tests {
    use crate::vr::testing::*;
    use super::*;

    // Brings a started replica into primary state directly.
    fn make_primary(sm: &mut VrStateMachine) {
        sm.state = ReplicaState::PrimaryOperational;
        sm.primary_id = sm.node_id;
        sm.view_start_seq = LogSeq::new(sm.epoch, sm.view, 0);
    }

    #[test]
    fn quorum_commit_on_primary() {
        let mut sm =
            started_sm(1, three_node_config(), LogSeq::new(0, 0, 10));
        make_primary(&mut sm);

        let start = LogSeq::new(0, 0, 11);
        let end = LogSeq::new(0, 0, 14);
        assert_eq!(
            sm.handle_log_block(start, end, LogSeq::new(0, 0, 10), 1),
            VR_STATUS_OK
        );
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 10));

        // local write done: 1 of 2 needed
        sm.log_block_write_done(1, start, end, sm.committed_seq(),
                                LogSeq::NONE, true);
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 10));

        // peer ack completes the quorum
        sm.log_block_write_done(2, start, end, sm.committed_seq(),
                                LogSeq::NONE, true);
        assert_eq!(sm.committed_seq(), end);
    }

    #[test]
    fn duplicate_and_unordered_acks() {
        let mut sm =
            started_sm(1, three_node_config(), LogSeq::new(0, 0, 0));
        make_primary(&mut sm);

        let b1 = (LogSeq::new(0, 0, 1), LogSeq::new(0, 0, 2));
        let b2 = (LogSeq::new(0, 0, 3), LogSeq::new(0, 0, 5));
        assert_eq!(
            sm.handle_log_block(b1.0, b1.1, LogSeq::new(0, 0, 0), 1),
            VR_STATUS_OK
        );
        assert_eq!(
            sm.handle_log_block(b2.0, b2.1, LogSeq::new(0, 0, 0), 1),
            VR_STATUS_OK
        );

        // acks for the second block arrive first; commit waits for it and
        // covers the first block when it lands
        sm.log_block_write_done(3, b2.0, b2.1, LogSeq::NONE, LogSeq::NONE,
                                true);
        sm.log_block_write_done(3, b2.0, b2.1, LogSeq::NONE, LogSeq::NONE,
                                true); // duplicate is idempotent
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 0));

        sm.log_block_write_done(1, b2.0, b2.1, LogSeq::NONE, LogSeq::NONE,
                                true);
        assert_eq!(sm.committed_seq(), b2.1);
        assert!(sm.block_acks.is_empty());
    }

    #[test]
    fn committed_seq_is_monotone() {
        let mut sm =
            started_sm(2, three_node_config(), LogSeq::new(0, 0, 20));
        sm.primary_id = 1;

        // adopting blocks never rolls the committed tail backwards
        assert_eq!(
            sm.handle_log_block(
                LogSeq::new(0, 0, 21),
                LogSeq::new(0, 0, 22),
                LogSeq::new(0, 0, 5),
                1
            ),
            VR_STATUS_OK
        );
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 20));

        sm.commit(LogSeq::new(0, 0, 22));
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 22));
        sm.commit(LogSeq::new(0, 0, 21));
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 22));

        // commit never outruns the local log tail
        sm.commit(LogSeq::new(0, 0, 99));
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 22));
    }

    #[test]
    fn no_commit_without_quorum_of_voters() {
        let mut sm =
            started_sm(1, three_node_config(), LogSeq::new(0, 0, 0));
        make_primary(&mut sm);

        let (start, end) = (LogSeq::new(0, 0, 1), LogSeq::new(0, 0, 1));
        sm.handle_log_block(start, end, LogSeq::new(0, 0, 0), 1);

        // an ack from an unknown node must not count
        sm.log_block_write_done(9, start, end, LogSeq::NONE, LogSeq::NONE,
                                true);
        // a failed write must not count
        sm.log_block_write_done(2, start, end, LogSeq::NONE, LogSeq::NONE,
                                false);
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 0));

        sm.log_block_write_done(1, start, end, LogSeq::NONE, LogSeq::NONE,
                                true);
        sm.log_block_write_done(2, start, end, LogSeq::NONE, LogSeq::NONE,
                                true);
        assert_eq!(sm.committed_seq(), end);
    }

    #[test]
    fn no_cross_view_commit() {
        let mut sm =
            started_sm(1, three_node_config(), LogSeq::new(0, 0, 0));
        make_primary(&mut sm);

        let (start, end) = (LogSeq::new(0, 0, 1), LogSeq::new(0, 0, 3));
        sm.handle_log_block(start, end, LogSeq::new(0, 0, 0), 1);
        sm.log_block_write_done(1, start, end, LogSeq::NONE, LogSeq::NONE,
                                true);

        // the view moves on before quorum; late acks for the old view's
        // block must not commit it
        sm.view = 1;
        sm.view_start_seq = LogSeq::new(0, 1, 0);
        sm.block_acks.clear();
        sm.log_block_write_done(2, start, end, LogSeq::NONE, LogSeq::NONE,
                                true);
        sm.log_block_write_done(3, start, end, LogSeq::NONE, LogSeq::NONE,
                                true);
        assert_eq!(sm.committed_seq(), LogSeq::new(0, 0, 0));
    }

    #[test]
    fn backup_rejects_stale_and_foreign_blocks() {
        let mut sm =
            started_sm(3, three_node_config(), LogSeq::new(1, 2, 7));
        sm.epoch = 1;
        sm.view = 2;
        sm.primary_id = 1;

        // older view
        assert_eq!(
            sm.handle_log_block(
                LogSeq::new(1, 1, 8),
                LogSeq::new(1, 1, 9),
                LogSeq::NONE,
                1
            ),
            VR_STATUS_STALE_VIEW
        );
        // not from the primary
        assert_eq!(
            sm.handle_log_block(
                LogSeq::new(1, 2, 8),
                LogSeq::new(1, 2, 9),
                LogSeq::NONE,
                2
            ),
            VR_STATUS_NOT_PRIMARY
        );
        assert_eq!(sm.last_log_seq(), LogSeq::new(1, 2, 7));
    }

    #[test]
    fn backup_gap_behavior() {
        let mut config = three_node_config();
        config.change_view_max_log_distance = 4;
        let mut sm = started_sm(3, config, LogSeq::new(0, 0, 10));
        sm.primary_id = 1;

        // small hole: transmitter must resend from earlier
        assert_eq!(
            sm.handle_log_block(
                LogSeq::new(0, 0, 13),
                LogSeq::new(0, 0, 14),
                LogSeq::NONE,
                1
            ),
            VR_STATUS_OUT_OF_ORDER
        );
        assert_eq!(sm.state(), ReplicaState::BackupOperational);

        // hole beyond the guard: checkpoint sync instead of catch-up
        assert_eq!(
            sm.handle_log_block(
                LogSeq::new(0, 0, 40),
                LogSeq::new(0, 0, 41),
                LogSeq::NONE,
                1
            ),
            VR_STATUS_LOG_SYNC
        );
        assert_eq!(sm.state(), ReplicaState::LogSync);
        let events = sm.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            VrEvent::StartLogSync { .. }
        )));
    }
}
