//! Reconfiguration: config changes ride the log and take effect exactly at
//! their commit boundary.

use super::*;

impl VrStateMachine {
    /// Stages a reconfiguration record observed at `record_seq`. The new
    /// configuration is validated here but installed only when the record
    /// commits; until then quorum is computed under the old configuration.
    /// Returns 0 when staged, a status code otherwise.
    pub fn handle_reconfiguration(
        &mut self,
        record_seq: LogSeq,
        new_config: VrConfig,
    ) -> i32 {
        if self.state == ReplicaState::Stopped {
            return VR_STATUS_STOPPED;
        }
        if new_config.validate().is_err() {
            pf_error!(
                "rejecting invalid reconfiguration at [{}]",
                record_seq
            );
            return VR_STATUS_CONFIG_ERROR;
        }
        if let Some((pending_seq, _)) = self.pending_config {
            pf_warn!(
                "reconfiguration at [{}] while [{}] still pending",
                record_seq,
                pending_seq
            );
            return VR_STATUS_OUT_OF_ORDER;
        }

        pf_info!(
            "staged reconfiguration at [{}]: {} nodes, quorum {}",
            record_seq,
            new_config.nodes.len(),
            new_config.quorum()
        );
        self.pending_config = Some((record_seq, new_config));
        VR_STATUS_OK
    }

    // Called whenever the committed tail advances: if the staged record is
    // now covered, the new configuration takes force atomically. The epoch
    // is bumped and the view counter resets; no in-flight operation sees a
    // half-installed config.
    pub(super) fn maybe_install_config(&mut self) {
        let Some(record_seq) =
            self.pending_config.as_ref().map(|(seq, _)| *seq)
        else {
            return;
        };
        if self.committed_seq < record_seq {
            return;
        }
        let (_, new_config) = self.pending_config.take().unwrap();

        self.epoch += 1;
        self.view = 0;
        self.config = new_config;
        self.view_start_seq = LogSeq::new(self.epoch, 0, 0);
        self.last_view_end_seq = self.committed_seq;
        self.ballot = None;
        pf_info!(
            "installed configuration at [{}]: epoch {} quorum {}",
            self.committed_seq,
            self.epoch,
            self.config.quorum()
        );
        self.push_event(VrEvent::ConfigInstalled { epoch: self.epoch });

        if !self.config.has_node(self.node_id)
            || !self.config.is_voting(self.node_id)
        {
            pf_warn!(
                "node {} left the replica set; shutting down",
                self.node_id
            );
            self.state = ReplicaState::Stopped;
            self.push_event(VrEvent::Shutdown);
        }
    }
}

#[cfg(test)]
mod reconfig_tests {
    use crate::vr::testing::*;
    use super::*;
    use crate::utils::ServerLocation;

    fn four_node_config_with_witness() -> VrConfig {
        let mut config = three_node_config();
        config.add_node(
            4,
            NodeInfo::new(
                NodeFlags::WITNESS,
                9,
                vec![ServerLocation::new("127.0.0.1", 20004)],
            ),
        );
        config
    }

    #[test]
    fn config_installs_at_commit_boundary() {
        let mut sm =
            started_sm(1, three_node_config(), LogSeq::new(0, 0, 90));
        sm.state = ReplicaState::PrimaryOperational;
        sm.primary_id = 1;

        let record_seq = LogSeq::new(0, 0, 100);
        assert_eq!(
            sm.handle_reconfiguration(
                record_seq,
                four_node_config_with_witness()
            ),
            VR_STATUS_OK
        );
        // the record is staged, not yet in force
        assert_eq!(sm.get_config().nodes.len(), 3);
        assert_eq!(sm.get_quorum(), 2);

        // commits short of the record do not install
        sm.last_log_seq = LogSeq::new(0, 0, 99);
        sm.commit(LogSeq::new(0, 0, 99));
        assert_eq!(sm.get_config().nodes.len(), 3);

        // the covering commit installs atomically and bumps the epoch
        sm.last_log_seq = record_seq;
        sm.commit(record_seq);
        assert_eq!(sm.get_config().nodes.len(), 4);
        assert_eq!(sm.epoch_view(), (1, 0));
        // a witness does not change the Active set, so quorum is unchanged
        assert_eq!(sm.get_quorum(), 2);
        assert!(sm
            .drain_events()
            .iter()
            .any(|e| matches!(e, VrEvent::ConfigInstalled { epoch: 1 })));
    }

    #[test]
    fn invalid_reconfiguration_rejected() {
        let mut sm =
            started_sm(1, three_node_config(), LogSeq::new(0, 0, 9));
        let mut bad = three_node_config();
        for node in bad.nodes.values_mut() {
            node.flags = NodeFlags::WITNESS;
        }
        assert_eq!(
            sm.handle_reconfiguration(LogSeq::new(0, 0, 10), bad),
            VR_STATUS_CONFIG_ERROR
        );
        assert!(sm.pending_config.is_none());
    }

    #[test]
    fn removed_node_stops() {
        let mut sm =
            started_sm(3, three_node_config(), LogSeq::new(0, 0, 10));
        let mut shrunk = three_node_config();
        shrunk.remove_node(3);

        let record_seq = LogSeq::new(0, 0, 11);
        assert_eq!(
            sm.handle_reconfiguration(record_seq, shrunk),
            VR_STATUS_OK
        );
        sm.last_log_seq = record_seq;
        sm.commit(record_seq);
        assert_eq!(sm.state(), ReplicaState::Stopped);
        assert!(sm
            .drain_events()
            .iter()
            .any(|e| matches!(e, VrEvent::Shutdown)));
        assert!(sm.get_status() < 0);
    }
}
