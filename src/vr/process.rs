//! The periodic `process` tick: timer checks, state-transition deadlines,
//! and generated control records.

use super::*;
use crate::rpc::OpRequest;

/// Outcome of one `process` tick.
#[derive(Debug)]
pub struct ProcessResult {
    /// Current status code (0 healthy, positive transient, negative fatal).
    pub vr_status: i32,

    /// Absolute monotonic second by which `process` must run again.
    pub next_deadline: i64,

    /// A generated VR control record to inject into the log pipeline, if
    /// any (e.g. the view-start record of a freshly elected primary).
    pub out_request: Option<OpRequest>,
}

impl VrStateMachine {
    /// Drives timers and deferred work. Must be called at least every
    /// `min(primary_timeout, backup_timeout) / 4` seconds; the returned
    /// deadline says when the next call is due. `committed_seq` is the
    /// driving layer's committed tail, `replay_last_log_seq` the replayed
    /// log position (used to detect `LogSync` completion).
    pub fn process(
        &mut self,
        now: i64,
        committed_seq: LogSeq,
        err_checksum: i64,
        committed_fid_seed: i64,
        committed_status: i32,
        replay_last_log_seq: LogSeq,
    ) -> ProcessResult {
        self.err_checksum = err_checksum;
        self.committed_fid_seed = committed_fid_seed;
        self.committed_status = committed_status;

        let next_deadline = now + self.tick_interval();
        match self.state {
            ReplicaState::Stopped => {
                return ProcessResult {
                    vr_status: self.get_status(),
                    next_deadline,
                    out_request: None,
                };
            }
            ReplicaState::Reconfiguration => {
                self.process_replay(now, replay_last_log_seq);
                return ProcessResult {
                    vr_status: self.get_status(),
                    next_deadline,
                    out_request: None,
                };
            }
            _ => {}
        }

        if committed_seq.is_valid() {
            self.commit(committed_seq);
        }

        // log sync completion is pushed by the sync collaborator, but the
        // replayed position is authoritative either way
        if self.state == ReplicaState::LogSync
            && replay_last_log_seq.is_valid()
            && replay_last_log_seq >= self.sync_target
        {
            if replay_last_log_seq > self.last_log_seq {
                self.last_log_seq = replay_last_log_seq;
            }
            self.sync_target = LogSeq::NONE;
            self.state = ReplicaState::BackupOperational;
            self.last_up_time = now;
            pf_info!(
                "log sync complete at [{}]; back to {}",
                self.last_log_seq,
                self.state.name()
            );
        }

        if self.progress_seen {
            self.progress_seen = false;
            self.last_up_time = now;
        }

        match self.state {
            ReplicaState::BackupOperational => {
                if now - self.last_up_time
                    >= i64::from(self.config.primary_timeout)
                {
                    pf_warn!(
                        "no primary progress for {}s; calling view change",
                        now - self.last_up_time
                    );
                    self.begin_view_change(self.epoch, self.view + 1, now);
                }
            }
            ReplicaState::PrimaryOperational => {
                if !self.block_acks.is_empty()
                    && now - self.last_up_time
                        >= i64::from(self.config.backup_timeout)
                {
                    pf_warn!(
                        "no quorum acks for {}s; stepping down",
                        now - self.last_up_time
                    );
                    self.begin_view_change(self.epoch, self.view + 1, now);
                }
            }
            ReplicaState::ViewChange => {
                let expired = self
                    .ballot
                    .as_ref()
                    .is_some_and(|b| {
                        now - b.started_at
                            >= i64::from(self.config.primary_timeout)
                    });
                if expired {
                    let view = self
                        .ballot
                        .as_ref()
                        .map(|b| b.view)
                        .unwrap_or(self.view);
                    pf_warn!("view change attempt expired; bumping view");
                    self.begin_view_change(self.epoch, view + 1, now);
                }
            }
            ReplicaState::LogSync => {
                if now - self.last_up_time
                    >= i64::from(self.config.backup_timeout)
                {
                    // the sync run stalled or failed; ask for another
                    pf_warn!("log sync stalled; restarting fetch");
                    self.last_up_time = now;
                    self.push_event(VrEvent::StartLogSync {
                        target: self.sync_target,
                        primary: self.primary_id,
                    });
                }
            }
            _ => {}
        }

        let out_request = if self.start_view_record_pending
            && self.is_primary()
        {
            self.start_view_record_pending = false;
            Some(OpRequest::VrStartView {
                epoch: self.epoch,
                view: self.view,
                primary_id: self.primary_id,
                start_seq: self.view_start_seq,
                committed_seq: self.committed_seq,
            })
        } else {
            None
        };

        ProcessResult {
            vr_status: self.get_status(),
            next_deadline,
            out_request,
        }
    }

    /// Seconds between mandatory `process` calls.
    pub fn tick_interval(&self) -> i64 {
        let base = i64::from(
            self.config.primary_timeout.min(self.config.backup_timeout),
        );
        (base / 4).max(1)
    }
}
