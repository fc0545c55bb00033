//! Persisted-state restore and checkpoint emit, startup replay handling.

use std::io::Write;

use super::*;
use crate::utils::MetaError;

// Checkpoint entry tags.
const TAG_CONFIG: &str = "vrconfig";
const TAG_VIEW: &str = "vrview";
const TAG_COMMITTED: &str = "vrcommitted";
const TAG_LASTLOG: &str = "vrlastlog";
const TAG_VIEWEND: &str = "vrviewend";
const TAG_COUNTERS: &str = "vrcounters";

impl VrStateMachine {
    /// Emits the replication state into a checkpoint stream: the serialized
    /// configuration, the current `(epoch, view)`, the committed and last
    /// log sequences, the previous view's end, and the carried collaborator
    /// counters. One tagged entry per line.
    pub fn checkpoint(&self, out: &mut impl Write) -> Result<(), MetaError> {
        writeln!(out, "{} {}", TAG_CONFIG, self.config.encode())?;
        writeln!(out, "{} {} {}", TAG_VIEW, self.epoch, self.view)?;
        writeln!(out, "{} {}", TAG_COMMITTED, self.committed_seq)?;
        writeln!(out, "{} {}", TAG_LASTLOG, self.last_log_seq)?;
        writeln!(out, "{} {}", TAG_VIEWEND, self.last_view_end_seq)?;
        writeln!(
            out,
            "{} {} {} {}",
            TAG_COUNTERS,
            self.err_checksum,
            self.committed_fid_seed,
            self.committed_status
        )?;
        Ok(())
    }

    /// Restores replication state from checkpoint text. All-or-nothing: on
    /// any malformed entry the state machine is left untouched. The replica
    /// lands in `Reconfiguration` awaiting replay and `start`.
    pub fn restore(&mut self, text: &str) -> Result<(), MetaError> {
        let mut config: Option<VrConfig> = None;
        let mut epoch_view: Option<(i64, i64)> = None;
        let mut committed = LogSeq::NONE;
        let mut last_log = LogSeq::NONE;
        let mut view_end = LogSeq::NONE;
        let mut counters = (0i64, 0i64, 0i32);

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (tag, rest) = line.split_once(' ').ok_or_else(|| {
                MetaError(format!("malformed checkpoint entry '{}'", line))
            })?;
            match tag {
                TAG_CONFIG => {
                    let mut c = VrConfig::default();
                    c.decode(rest)?;
                    config = Some(c);
                }
                TAG_VIEW => {
                    let mut tokens = rest.split_ascii_whitespace();
                    let epoch = tokens
                        .next()
                        .ok_or_else(|| {
                            MetaError::msg("checkpoint view missing epoch")
                        })?
                        .parse()?;
                    let view = tokens
                        .next()
                        .ok_or_else(|| {
                            MetaError::msg("checkpoint view missing view")
                        })?
                        .parse()?;
                    epoch_view = Some((epoch, view));
                }
                TAG_COMMITTED => committed = rest.parse()?,
                TAG_LASTLOG => last_log = rest.parse()?,
                TAG_VIEWEND => view_end = rest.parse()?,
                TAG_COUNTERS => {
                    let mut tokens = rest.split_ascii_whitespace();
                    let mut next = || -> Result<i64, MetaError> {
                        Ok(tokens
                            .next()
                            .ok_or_else(|| {
                                MetaError::msg(
                                    "checkpoint counters truncated",
                                )
                            })?
                            .parse()?)
                    };
                    counters = (next()?, next()?, next()? as i32);
                }
                _ => {
                    return Err(MetaError(format!(
                        "unknown checkpoint entry tag '{}'",
                        tag
                    )));
                }
            }
        }

        let config = config.ok_or_else(|| {
            MetaError::msg("checkpoint missing configuration entry")
        })?;
        let (epoch, view) = epoch_view.ok_or_else(|| {
            MetaError::msg("checkpoint missing view entry")
        })?;

        self.config = config;
        self.epoch = epoch;
        self.view = view;
        self.committed_seq = committed;
        self.last_log_seq = last_log;
        self.last_view_end_seq = view_end;
        (self.err_checksum, self.committed_fid_seed, self.committed_status) =
            counters;
        self.state = ReplicaState::Reconfiguration;
        self.primary_id = NODE_ID_NONE;
        self.ballot = None;
        self.block_acks.clear();
        pf_info!(
            "restored vr state: epoch {} view {} committed [{}]",
            self.epoch,
            self.view,
            self.committed_seq
        );
        Ok(())
    }

    /// Installs the bootstrap configuration on a replica that has no
    /// checkpoint to restore from. Only legal before `start`.
    pub fn install_initial_config(
        &mut self,
        config: VrConfig,
    ) -> Result<(), MetaError> {
        if self.state != ReplicaState::Reconfiguration {
            return logged_err!(
                "cannot install bootstrap config in state {}",
                self.state.name()
            );
        }
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Startup replay progress notice; only meaningful while restoring.
    pub fn process_replay(&mut self, now: i64, replay_last_log_seq: LogSeq) {
        let _ = now;
        if self.state != ReplicaState::Reconfiguration {
            return;
        }
        if replay_last_log_seq.is_valid()
            && replay_last_log_seq > self.last_log_seq
        {
            self.last_log_seq = replay_last_log_seq;
        }
    }

    /// Finishes startup once replay has reached the committed tail: checks
    /// the configuration and membership, then joins the replica set as a
    /// backup (or as the primary of a single-node set). Returns the
    /// resulting status code.
    pub fn start(&mut self, now: i64) -> i32 {
        if self.state != ReplicaState::Reconfiguration {
            return self.get_status();
        }
        if self.config.validate().is_err()
            || !self.config.has_node(self.node_id)
        {
            pf_error!(
                "cannot start: unusable configuration for node {}",
                self.node_id
            );
            self.config_error = true;
            return VR_STATUS_CONFIG_ERROR;
        }
        if self.committed_seq.is_valid()
            && self.last_log_seq < self.committed_seq
        {
            // replay has not reached the committed tail yet
            return VR_STATUS_RECONFIGURATION;
        }

        self.config_error = false;
        self.last_up_time = now;
        if self.config.active_count() == 1
            && self.config.is_primary_eligible(self.node_id)
        {
            // a single-node replica set has nobody to elect with
            self.primary_id = self.node_id;
            self.view_start_seq = LogSeq::new(self.epoch, self.view, 0);
            self.state = ReplicaState::PrimaryOperational;
        } else {
            self.state = ReplicaState::BackupOperational;
        }
        pf_info!(
            "vr started as {} at epoch {} view {}",
            self.state.name(),
            self.epoch,
            self.view
        );
        self.get_status()
    }
}

#[cfg(test)]
mod recovery_tests {
    use crate::vr::testing::*;
    use super::*;

    #[test]
    fn checkpoint_restore_roundtrip() -> Result<(), crate::utils::MetaError>
    {
        let mut sm =
            started_sm(2, three_node_config(), LogSeq::new(1, 2, 34));
        sm.epoch = 1;
        sm.view = 2;
        sm.last_view_end_seq = LogSeq::new(1, 1, 30);
        sm.err_checksum = -7;
        sm.committed_fid_seed = 1000;

        let mut blob = Vec::new();
        sm.checkpoint(&mut blob)?;
        let text = String::from_utf8(blob).unwrap();

        let mut restored = VrStateMachine::new(2);
        restored.restore(&text)?;
        assert_eq!(restored.state(), ReplicaState::Reconfiguration);
        assert_eq!(restored.epoch_view(), (1, 2));
        assert_eq!(restored.committed_seq(), LogSeq::new(1, 2, 34));
        assert_eq!(restored.last_log_seq(), LogSeq::new(1, 2, 34));
        assert_eq!(restored.last_view_end_seq, LogSeq::new(1, 1, 30));
        assert_eq!(restored.err_checksum, -7);
        assert_eq!(restored.get_config(), sm.get_config());

        // replay already at the tail: start brings it online
        assert_eq!(restored.start(5), VR_STATUS_OK);
        assert_eq!(restored.state(), ReplicaState::BackupOperational);
        Ok(())
    }

    #[test]
    fn restore_rejects_malformed() {
        let mut sm = VrStateMachine::new(1);
        assert!(sm.restore("vrview 0 0\n").is_err()); // no config entry
        assert!(sm.restore("nonsense 1 2 3\n").is_err());
        assert!(sm
            .restore("vrconfig garbage\nvrview 0 0\n")
            .is_err());
        // untouched: still awaiting a good checkpoint
        assert_eq!(sm.state(), ReplicaState::Reconfiguration);
        assert!(sm.get_config().is_empty());
    }

    #[test]
    fn start_requires_membership_and_replay() {
        // not a member of the restored config
        let mut sm = VrStateMachine::new(9);
        sm.config = three_node_config();
        assert_eq!(sm.start(0), VR_STATUS_CONFIG_ERROR);
        assert_eq!(sm.get_status(), VR_STATUS_CONFIG_ERROR);

        // member, but replay lags the committed tail
        let mut sm = VrStateMachine::new(1);
        sm.config = three_node_config();
        sm.committed_seq = LogSeq::new(0, 0, 10);
        sm.last_log_seq = LogSeq::new(0, 0, 4);
        assert_eq!(sm.start(0), VR_STATUS_RECONFIGURATION);

        // replay progress is folded in while restoring
        sm.process_replay(1, LogSeq::new(0, 0, 10));
        assert_eq!(sm.start(2), VR_STATUS_OK);
        assert_eq!(sm.state(), ReplicaState::BackupOperational);
    }

    #[test]
    fn single_node_starts_as_primary() {
        let mut config = three_node_config();
        config.remove_node(2);
        config.remove_node(3);
        let sm = started_sm(1, config, LogSeq::NONE);
        assert!(sm.is_primary());
        assert_eq!(sm.get_primary_node_id(), 1);
    }
}
