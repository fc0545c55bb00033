//! View-change protocol: `StartViewChange` / `DoViewChange` / `StartView`
//! handling and deterministic primary selection.

use super::*;

impl VrStateMachine {
    /// Dispatches an inbound VR control message from a peer.
    pub fn handle_msg(&mut self, from: NodeId, msg: VrMsg, now: i64) {
        if self.state == ReplicaState::Stopped {
            return;
        }

        // messages speaking for an older (epoch, view) are answered with a
        // hint carrying the current one; no transition happens
        if let Some((epoch, view)) = msg.epoch_view() {
            if (epoch, view) < (self.epoch, self.view) {
                pf_debug!(
                    "stale msg <- {} for epoch {} view {}; at {} {}",
                    from,
                    epoch,
                    view,
                    self.epoch,
                    self.view
                );
                self.push_msg(
                    Some(from),
                    VrMsg::StatusHint {
                        epoch: self.epoch,
                        view: self.view,
                        status: VR_STATUS_STALE_VIEW,
                    },
                );
                return;
            }
        }

        match msg {
            VrMsg::Hello {
                node_id,
                last_log_seq,
                config_hash,
            } => self.handle_hello(from, node_id, last_log_seq, config_hash),

            VrMsg::StartViewChange {
                epoch,
                view,
                node_id,
                last_log_seq,
                last_view_end_seq,
                config_hash,
            } => self.handle_start_view_change(
                epoch,
                view,
                node_id,
                last_log_seq,
                last_view_end_seq,
                config_hash,
                now,
            ),

            VrMsg::DoViewChange {
                epoch,
                view,
                node_id,
                primary_id,
                last_log_seq,
                last_view_end_seq,
            } => self.handle_do_view_change(
                epoch,
                view,
                node_id,
                primary_id,
                last_log_seq,
                last_view_end_seq,
                now,
            ),

            VrMsg::StartView {
                epoch,
                view,
                primary_id,
                start_seq,
                committed_seq,
                config,
            } => self.handle_start_view(
                epoch,
                view,
                primary_id,
                start_seq,
                committed_seq,
                config,
                now,
            ),

            VrMsg::StatusHint { epoch, view, .. } => {
                self.handle_status_hint(from, epoch, view, now)
            }
        }
    }

    // Transmitter-connection announcement: validate peer membership and
    // configuration agreement.
    fn handle_hello(
        &mut self,
        from: NodeId,
        node_id: NodeId,
        last_log_seq: LogSeq,
        config_hash: u64,
    ) {
        if !self.config.has_node(node_id) {
            pf_warn!("hello from unknown node {}", node_id);
            self.push_msg(
                Some(from),
                VrMsg::StatusHint {
                    epoch: self.epoch,
                    view: self.view,
                    status: VR_STATUS_CONFIG_ERROR,
                },
            );
            return;
        }
        if config_hash != self.config.config_hash() {
            pf_warn!("hello from {} with unknown config hash", node_id);
            self.push_event(VrEvent::ConfigMismatch { peer: node_id });
            return;
        }
        pf_debug!(
            "hello <- {} last log [{}]",
            node_id,
            last_log_seq
        );
    }

    // Phase 1. First receipt for a strictly newer (epoch, view) enters
    // ViewChange, clears the ballot, and echoes our own StartViewChange.
    #[allow(clippy::too_many_arguments)]
    fn handle_start_view_change(
        &mut self,
        epoch: i64,
        view: i64,
        node_id: NodeId,
        last_log_seq: LogSeq,
        last_view_end_seq: LogSeq,
        config_hash: u64,
        now: i64,
    ) {
        if self.state == ReplicaState::Reconfiguration {
            return;
        }
        if config_hash != self.config.config_hash() {
            // configuration disagreement: suspend the view change and let
            // the driver fetch current state first
            pf_warn!(
                "view change msg from {} with unknown config hash",
                node_id
            );
            self.push_event(VrEvent::ConfigMismatch { peer: node_id });
            return;
        }
        if !self.config.is_voting(node_id) {
            pf_warn!("view change msg from non-voting node {}", node_id);
            return;
        }

        let newer_than_ballot = match self.ballot {
            Some(ref b) => (epoch, view) > (b.epoch, b.view),
            None => true,
        };
        if self.state != ReplicaState::ViewChange || newer_than_ballot {
            if (epoch, view) <= (self.epoch, self.view)
                && self.state != ReplicaState::ViewChange
            {
                // not newer than the operating view; stale path already
                // answered strictly-older, equal means the sender lags our
                // StartView and will catch up from the primary
                return;
            }
            self.begin_view_change(epoch, view, now);
        }

        let Some(ref mut ballot) = self.ballot else {
            return;
        };
        if (epoch, view) < (ballot.epoch, ballot.view) {
            return; // vote for an attempt we already advanced past
        }
        ballot
            .start_votes
            .insert(node_id, (last_log_seq, last_view_end_seq));
        pf_debug!(
            "view change vote <- {} for epoch {} view {} ({} votes)",
            node_id,
            epoch,
            view,
            ballot.start_votes.len()
        );

        self.maybe_send_do_view_change();
    }

    // Phase 2. The proposed primary collects DoViewChange votes; quorum
    // forms the new view.
    #[allow(clippy::too_many_arguments)]
    fn handle_do_view_change(
        &mut self,
        epoch: i64,
        view: i64,
        node_id: NodeId,
        primary_id: NodeId,
        last_log_seq: LogSeq,
        last_view_end_seq: LogSeq,
        now: i64,
    ) {
        if self.state == ReplicaState::Reconfiguration {
            return;
        }
        if primary_id != self.node_id {
            pf_warn!(
                "do-view-change <- {} names primary {}, not me",
                node_id,
                primary_id
            );
            return;
        }
        if !self.config.is_voting(node_id) {
            return;
        }

        // a DoViewChange for a newer view also counts as evidence the view
        // change is on; join it
        let join = match self.ballot {
            Some(ref b) => (epoch, view) > (b.epoch, b.view),
            None => true,
        };
        if self.state != ReplicaState::ViewChange || join {
            if (epoch, view) <= (self.epoch, self.view) {
                return;
            }
            self.begin_view_change(epoch, view, now);
        }
        let Some(ref mut ballot) = self.ballot else {
            return;
        };
        if (epoch, view) != (ballot.epoch, ballot.view) {
            return;
        }
        ballot
            .do_votes
            .insert(node_id, (last_log_seq, last_view_end_seq));
        // my own log tail backs the election as well
        ballot
            .do_votes
            .entry(self.node_id)
            .or_insert((self.last_log_seq, self.last_view_end_seq));
        pf_debug!(
            "do-view-change <- {} for epoch {} view {} ({} votes)",
            node_id,
            epoch,
            view,
            ballot.do_votes.len()
        );

        if ballot.do_votes.len() >= self.config.quorum() {
            self.become_primary(now);
        }
    }

    // Phase 3. A backup adopts the announced view.
    #[allow(clippy::too_many_arguments)]
    fn handle_start_view(
        &mut self,
        epoch: i64,
        view: i64,
        primary_id: NodeId,
        start_seq: LogSeq,
        committed_seq: LogSeq,
        config: VrConfig,
        now: i64,
    ) {
        if self.state == ReplicaState::Reconfiguration {
            return;
        }
        if primary_id == self.node_id {
            return; // our own announcement reflected back
        }
        if !config.is_primary_eligible(primary_id) {
            pf_warn!(
                "start view names ineligible primary {}",
                primary_id
            );
            return;
        }
        if start_seq.epoch != epoch || start_seq.view != view {
            pf_warn!(
                "start view with inconsistent start seq [{}]",
                start_seq
            );
            return;
        }

        // the new view's base is a quorum maximum, so it can only sit below
        // our committed tail if the committed histories disagree
        if committed_seq.is_valid()
            && self.committed_seq.is_valid()
            && committed_seq < self.committed_seq
        {
            pf_error!(
                "FATAL log divergence: view base [{}] below committed [{}]",
                committed_seq,
                self.committed_seq
            );
            self.state = ReplicaState::Stopped;
            return;
        }

        pf_info!(
            "adopting view: epoch {} view {} primary {}",
            epoch,
            view,
            primary_id
        );
        self.epoch = epoch;
        self.view = view;
        self.primary_id = primary_id;
        self.view_start_seq = start_seq;
        self.config = config;
        self.ballot = None;
        self.block_acks.clear();
        self.last_up_time = now;

        // discard any local uncommitted suffix beyond the new view's base
        if committed_seq.is_valid() && self.last_log_seq > committed_seq {
            self.push_event(VrEvent::TruncateUncommitted {
                seq: committed_seq,
            });
            self.last_log_seq = committed_seq;
        }
        self.last_view_end_seq = committed_seq;
        if committed_seq.is_valid() {
            self.advance_committed(committed_seq);
        }

        // too far behind the view's base: pull a checkpoint instead of
        // blocking the view on in-view catch-up
        if self.last_log_seq < committed_seq {
            let lag = self.last_log_seq.seq_distance(&committed_seq);
            if lag > self.config.change_view_max_log_distance {
                self.state = ReplicaState::BackupOperational;
                self.enter_log_sync(committed_seq);
                return;
            }
        }
        self.state = ReplicaState::BackupOperational;
    }

    // A peer told us our view is behind. If we are mid-election for
    // something not newer than the hint, restart the attempt above it.
    fn handle_status_hint(
        &mut self,
        from: NodeId,
        epoch: i64,
        view: i64,
        now: i64,
    ) {
        if (epoch, view) <= (self.epoch, self.view) {
            return;
        }
        pf_debug!(
            "status hint <- {}: epoch {} view {} is current",
            from,
            epoch,
            view
        );
        if self.state == ReplicaState::ViewChange {
            let behind = match self.ballot {
                Some(ref b) => (b.epoch, b.view) <= (epoch, view),
                None => true,
            };
            if behind {
                self.begin_view_change(epoch, view + 1, now);
            }
        }
    }

    /// Opens (or restarts) a view-change attempt at `(epoch, view)`:
    /// clears the ballot, records our own vote, and broadcasts
    /// `StartViewChange`.
    pub(super) fn begin_view_change(
        &mut self,
        epoch: i64,
        view: i64,
        now: i64,
    ) {
        pf_info!(
            "starting view change: epoch {} view {} (from {} {})",
            epoch,
            view,
            self.epoch,
            self.view
        );
        self.state = ReplicaState::ViewChange;
        let mut ballot = ViewChangeBallot::new(epoch, view, now);
        ballot.start_votes.insert(
            self.node_id,
            (self.last_log_seq, self.last_view_end_seq),
        );
        self.ballot = Some(ballot);
        self.block_acks.clear();

        self.push_msg(
            None,
            VrMsg::StartViewChange {
                epoch,
                view,
                node_id: self.node_id,
                last_log_seq: self.last_log_seq,
                last_view_end_seq: self.last_view_end_seq,
                config_hash: self.config.config_hash(),
            },
        );
        self.maybe_send_do_view_change();
    }

    // Once quorum StartViewChange votes are in, send DoViewChange to the
    // ballot's computed primary.
    fn maybe_send_do_view_change(&mut self) {
        let Some(ref ballot) = self.ballot else {
            return;
        };
        if ballot.do_view_sent
            || ballot.start_votes.len() < self.config.quorum()
        {
            return;
        }
        let primary =
            Self::select_primary(&self.config, &ballot.start_votes);
        if primary == NODE_ID_NONE {
            pf_warn!("no eligible primary among view change votes");
            return;
        }

        let (epoch, view) = (ballot.epoch, ballot.view);
        let msg = VrMsg::DoViewChange {
            epoch,
            view,
            node_id: self.node_id,
            primary_id: primary,
            last_log_seq: self.last_log_seq,
            last_view_end_seq: self.last_view_end_seq,
        };
        if let Some(ref mut ballot) = self.ballot {
            ballot.do_view_sent = true;
        }
        if primary == self.node_id {
            // deliver to ourselves without a network hop
            let now = self.ballot.as_ref().map(|b| b.started_at).unwrap_or(0);
            self.handle_do_view_change(
                epoch,
                view,
                self.node_id,
                primary,
                self.last_log_seq,
                self.last_view_end_seq,
                now,
            );
        } else {
            self.push_msg(Some(primary), msg);
        }
    }

    /// Deterministic primary selection over a ballot: among the nodes that
    /// reported the maximal `last_log_seq`, the primary-eligible one with
    /// the lowest `primary_order`, ties broken by lowest node id. Pure: the
    /// same ballot always yields the same id.
    pub fn select_primary(
        config: &VrConfig,
        votes: &BTreeMap<NodeId, (LogSeq, LogSeq)>,
    ) -> NodeId {
        let Some(max_log) =
            votes.values().map(|(last, _)| *last).max()
        else {
            return NODE_ID_NONE;
        };
        let mut chosen = NODE_ID_NONE;
        let mut chosen_order = i32::MAX;
        for (&id, &(last, _)) in votes {
            if last != max_log || !config.is_primary_eligible(id) {
                continue;
            }
            let order = config
                .node(id)
                .map(|n| n.primary_order)
                .unwrap_or(i32::MAX);
            if order < chosen_order || (order == chosen_order && id < chosen)
            {
                chosen = id;
                chosen_order = order;
            }
        }
        chosen
    }

    // Quorum DoViewChange votes in hand: compute the new log base and
    // announce the view.
    fn become_primary(&mut self, now: i64) {
        let Some(ballot) = self.ballot.take() else {
            return;
        };
        let (epoch, view) = (ballot.epoch, ballot.view);

        // new log base: the maximal tail among responders whose previous
        // view ended where ours did (divergent responders resync later)
        let log_base = ballot
            .do_votes
            .values()
            .filter(|(_, view_end)| {
                !view_end.is_valid()
                    || !self.last_view_end_seq.is_valid()
                    || *view_end == self.last_view_end_seq
            })
            .map(|(last, _)| *last)
            .max()
            .unwrap_or(self.last_log_seq);
        if log_base > self.last_log_seq {
            // selection should have preferred the longer log; do not serve
            // records we do not hold
            pf_warn!(
                "elected with log [{}] behind base [{}]",
                self.last_log_seq,
                log_base
            );
        }
        let log_base = log_base.min(self.last_log_seq);

        pf_info!(
            "becoming primary: epoch {} view {} base [{}]",
            epoch,
            view,
            log_base
        );
        self.epoch = epoch;
        self.view = view;
        self.primary_id = self.node_id;
        self.view_start_seq = LogSeq::new(epoch, view, 0);
        self.last_view_end_seq = log_base;
        self.state = ReplicaState::PrimaryOperational;
        self.block_acks.clear();
        self.last_up_time = now;
        self.start_view_record_pending = true;

        // records up to the base carried quorum support through the
        // election itself
        self.advance_committed(log_base);

        self.push_msg(
            None,
            VrMsg::StartView {
                epoch,
                view,
                primary_id: self.node_id,
                start_seq: self.view_start_seq,
                committed_seq: self.committed_seq,
                config: self.config.clone(),
            },
        );
    }
}

#[cfg(test)]
mod viewchange_tests {
    use crate::vr::testing::*;
    use super::*;

    fn svc_msg(
        epoch: i64,
        view: i64,
        node_id: NodeId,
        last: LogSeq,
        config: &VrConfig,
    ) -> VrMsg {
        VrMsg::StartViewChange {
            epoch,
            view,
            node_id,
            last_log_seq: last,
            last_view_end_seq: LogSeq::NONE,
            config_hash: config.config_hash(),
        }
    }

    #[test]
    fn clean_election_three_nodes() {
        // ids 1/2/3 with orders 0/1/2; node 1 is down. Node 2 times out,
        // starts the view change, and with node 3's vote wins the election.
        let config = three_node_config();
        let tail = LogSeq::new(0, 0, 50);
        let mut sm2 = started_sm(2, config.clone(), tail);
        let mut sm3 = started_sm(3, config.clone(), tail);

        sm2.begin_view_change(0, 1, 10);
        let out = sm2.drain_msgs();
        assert_eq!(out.len(), 1);
        let (target, svc) = &out[0];
        assert!(target.is_none()); // broadcast
        assert_eq!(svc.epoch_view(), Some((0, 1)));

        // node 3 receives node 2's StartViewChange, echoes its own, and
        // with two votes in hand sends DoViewChange to node 2
        sm3.handle_msg(2, svc.clone(), 11);
        assert_eq!(sm3.state(), ReplicaState::ViewChange);
        let out3 = sm3.drain_msgs();
        let echo = out3
            .iter()
            .find(|(t, m)| {
                t.is_none() && matches!(m, VrMsg::StartViewChange { .. })
            })
            .expect("echoed StartViewChange");
        let dvc = out3
            .iter()
            .find(|(t, _)| *t == Some(2))
            .expect("DoViewChange to node 2");
        assert!(matches!(
            dvc.1,
            VrMsg::DoViewChange { primary_id: 2, .. }
        ));

        // node 2 sees node 3's echo (now has quorum itself) and node 3's
        // DoViewChange; that makes a quorum of DoViewChanges -> StartView
        sm2.handle_msg(3, echo.1.clone(), 11);
        sm2.handle_msg(3, dvc.1.clone(), 11);
        assert_eq!(sm2.state(), ReplicaState::PrimaryOperational);
        assert!(sm2.is_primary());
        assert_eq!(sm2.get_primary_node_id(), 2);
        assert_eq!(sm2.get_status(), VR_STATUS_OK);

        let sv = sm2
            .drain_msgs()
            .into_iter()
            .find(|(t, m)| {
                t.is_none() && matches!(m, VrMsg::StartView { .. })
            })
            .expect("StartView broadcast");

        // node 3 adopts the view
        sm3.handle_msg(2, sv.1, 12);
        assert_eq!(sm3.state(), ReplicaState::BackupOperational);
        assert_eq!(sm3.get_primary_node_id(), 2);
        assert_eq!(sm3.get_status(), VR_STATUS_OK);
        assert_eq!(sm3.epoch_view(), (0, 1));
    }

    #[test]
    fn split_vote_tie_break_by_node_id() {
        // nodes 2 and 3 share primary_order; the lower id must win
        let mut config = three_node_config();
        config.nodes.get_mut(&2).unwrap().primary_order = 1;
        config.nodes.get_mut(&3).unwrap().primary_order = 1;

        let tail = LogSeq::new(0, 0, 9);
        let mut votes = BTreeMap::new();
        votes.insert(2, (tail, LogSeq::NONE));
        votes.insert(3, (tail, LogSeq::NONE));
        assert_eq!(VrStateMachine::select_primary(&config, &votes), 2);
    }

    #[test]
    fn primary_selection_is_pure() {
        let config = three_node_config();
        let mut votes = BTreeMap::new();
        votes.insert(1, (LogSeq::new(0, 0, 10), LogSeq::NONE));
        votes.insert(2, (LogSeq::new(0, 0, 50), LogSeq::NONE));
        votes.insert(3, (LogSeq::new(0, 0, 50), LogSeq::NONE));
        let first = VrStateMachine::select_primary(&config, &votes);
        for _ in 0..10 {
            assert_eq!(
                VrStateMachine::select_primary(&config, &votes),
                first
            );
        }
        // max log wins even though node 1 has the best primary order
        assert_eq!(first, 2);
    }

    #[test]
    fn selection_skips_witnesses_and_may_fail() {
        let mut config = three_node_config();
        config.nodes.get_mut(&2).unwrap().flags = NodeFlags::WITNESS;
        let mut votes = BTreeMap::new();
        votes.insert(2, (LogSeq::new(0, 0, 80), LogSeq::NONE));
        votes.insert(3, (LogSeq::new(0, 0, 50), LogSeq::NONE));
        // only the witness has the maximal log: nobody qualifies
        assert_eq!(
            VrStateMachine::select_primary(&config, &votes),
            NODE_ID_NONE
        );
    }

    #[test]
    fn stale_message_dropped_with_hint() {
        let config = three_node_config();
        let mut sm = started_sm(1, config.clone(), LogSeq::new(2, 3, 5));
        sm.epoch = 2;
        sm.view = 3;
        sm.primary_id = 1;
        sm.state = ReplicaState::PrimaryOperational;

        sm.handle_msg(
            2,
            svc_msg(2, 2, 2, LogSeq::new(2, 2, 1), &config),
            50,
        );
        // state unchanged, reply hints the current view
        assert_eq!(sm.state(), ReplicaState::PrimaryOperational);
        assert_eq!(sm.epoch_view(), (2, 3));
        let out = sm.drain_msgs();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Some(2));
        assert!(matches!(
            out[0].1,
            VrMsg::StatusHint {
                epoch: 2,
                view: 3,
                ..
            }
        ));
    }

    #[test]
    fn unique_primary_within_view() {
        let config = three_node_config();
        let tail = LogSeq::new(0, 0, 4);
        let mut sm2 = started_sm(2, config.clone(), tail);
        let mut sm3 = started_sm(3, config, tail);

        sm2.begin_view_change(0, 1, 0);
        let svc = sm2.drain_msgs().remove(0).1;
        sm3.handle_msg(2, svc, 0);
        let msgs = sm3.drain_msgs();
        let dvc = msgs.iter().find(|(t, _)| *t == Some(2)).unwrap();
        let echo = msgs
            .iter()
            .find(|(t, m)| {
                t.is_none() && matches!(m, VrMsg::StartViewChange { .. })
            })
            .unwrap();
        sm2.handle_msg(3, echo.1.clone(), 0);
        sm2.handle_msg(3, dvc.1.clone(), 0);
        let sv = sm2
            .drain_msgs()
            .into_iter()
            .find_map(|(_, m)| {
                matches!(m, VrMsg::StartView { .. }).then_some(m)
            })
            .unwrap();
        sm3.handle_msg(2, sv, 1);

        // both replicas agree on the primary for every seq of the view
        for seq in 0..5 {
            let pos = LogSeq::new(0, 1, seq);
            assert_eq!(sm2.get_primary_node_id_at(pos), 2);
            assert_eq!(sm3.get_primary_node_id_at(pos), 2);
        }
        // positions outside the tracked view do not answer
        assert_eq!(
            sm2.get_primary_node_id_at(LogSeq::new(0, 0, 1)),
            NODE_ID_NONE
        );
    }

    #[test]
    fn divergent_view_base_is_fatal() {
        let config = three_node_config();
        let mut sm = started_sm(3, config.clone(), LogSeq::new(0, 0, 60));

        // a view announcement whose base contradicts our committed prefix
        sm.handle_msg(
            2,
            VrMsg::StartView {
                epoch: 0,
                view: 1,
                primary_id: 2,
                start_seq: LogSeq::new(0, 1, 0),
                committed_seq: LogSeq::new(0, 0, 40),
                config,
            },
            7,
        );
        assert_eq!(sm.state(), ReplicaState::Stopped);
        assert!(sm.get_status() < 0);
    }

    #[test]
    fn config_mismatch_suspends_view_change() {
        let config = three_node_config();
        let mut sm = started_sm(3, config.clone(), LogSeq::new(0, 0, 2));
        let mut msg = svc_msg(0, 1, 2, LogSeq::new(0, 0, 2), &config);
        if let VrMsg::StartViewChange {
            ref mut config_hash,
            ..
        } = msg
        {
            *config_hash ^= 0xdead;
        }
        sm.handle_msg(2, msg, 5);
        assert_ne!(sm.state(), ReplicaState::ViewChange);
        assert!(sm
            .drain_events()
            .iter()
            .any(|e| matches!(e, VrEvent::ConfigMismatch { peer: 2 })));
    }
}
