//! The replica driving loop: owns the state machine and its collaborator
//! modules, and pumps events between them on a single task.

use std::path::Path;
use std::sync::Arc;

use crate::rpc::{MetaOp, OpRequest};
use crate::utils::{MetaError, Timer};
use crate::vr::transmit::TransmitEvent;
use crate::vr::{
    CheckpointHub, LogBlock, LogSeq, LogTransmitterHub, MetaDataSync,
    NodeId, SyncOutcome, TransmitMsg, VrConfig, VrEvent, VrMsg,
    VrStateMachine,
};

use serde::Deserialize;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigVr {
    /// Path to the replication-state checkpoint file.
    pub ckpt_path: String,

    /// Whether to `fsync()` checkpoint writes.
    pub sync_write: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigVr {
    fn default() -> Self {
        ReplicaConfigVr {
            ckpt_path: "/tmp/vrmeta.vr.ckpt".into(),
            sync_write: false,
        }
    }
}

/// VR replica driver module.
pub struct VrReplica {
    /// Replica node ID in the replica set.
    id: NodeId,

    /// Configuration parameters struct.
    _config: ReplicaConfigVr,

    /// The replication state machine.
    vr: VrStateMachine,

    /// Transmitter hub module.
    transmitter: LogTransmitterHub,

    /// Checkpoint storage module.
    ckpt_hub: CheckpointHub,

    /// Data-sync collaborator, shared with in-flight sync tasks.
    sync: Arc<Mutex<Box<dyn MetaDataSync>>>,

    /// Sender side of the sync completion channel.
    tx_sync: mpsc::UnboundedSender<SyncOutcome>,

    /// Receiver side of the sync completion channel.
    rx_sync: mpsc::UnboundedReceiver<SyncOutcome>,

    /// Timer driving the mandatory `process` cadence.
    process_timer: Timer,

    /// Monotonic base instant; state machine time is seconds since this.
    start_instant: Instant,

    /// Latest locally replayed/synced log position.
    replay_last: LogSeq,

    /// `(epoch, view, committed)` of the last persisted checkpoint.
    ckpt_stamp: (i64, i64, LogSeq),
}

impl VrReplica {
    /// Creates the replica driver: restores (or bootstraps) the state
    /// machine, sets up the transmitter, and connects to configured peers.
    pub async fn new_and_setup(
        id: NodeId,
        vr_config: VrConfig,
        sync: Box<dyn MetaDataSync>,
        config_str: Option<&str>,
    ) -> Result<Self, MetaError> {
        let config = parsed_config!(config_str => ReplicaConfigVr;
                                    ckpt_path, sync_write)?;

        let ckpt_hub = CheckpointHub::new_and_setup(
            Path::new(&config.ckpt_path),
            config.sync_write,
        )
        .await?;

        let mut vr = VrStateMachine::new(id);
        match ckpt_hub.load().await? {
            Some(blob) => vr.restore(&blob)?,
            None => vr.install_initial_config(vr_config)?,
        }

        let Some(node) = vr.get_config().node(id) else {
            return logged_err!("node {} not in replica set config", id);
        };
        let p2p_addr = node.locations[0].to_socket_addr()?;
        let mut transmitter =
            LogTransmitterHub::new_and_setup(id, p2p_addr).await?;

        // proactively connect to all other configured peers; unreachable
        // ones will connect back to us when they come up
        let peers: Vec<(NodeId, crate::utils::ServerLocation)> = vr
            .get_config()
            .nodes
            .iter()
            .filter(|(&peer, _)| peer != id)
            .map(|(&peer, info)| (peer, info.locations[0].clone()))
            .collect();
        for (peer, loc) in peers {
            match loc.to_socket_addr() {
                Ok(addr) => {
                    if let Err(e) =
                        transmitter.connect_to_peer(peer, addr).await
                    {
                        pf_warn!(
                            "could not connect to peer {} '{}': {}",
                            peer,
                            loc,
                            e
                        );
                    }
                }
                Err(e) => {
                    pf_warn!("peer {} location '{}': {}", peer, loc, e)
                }
            }
        }

        let (tx_sync, rx_sync) = mpsc::unbounded_channel();

        Ok(VrReplica {
            id,
            _config: config,
            vr,
            transmitter,
            ckpt_hub,
            sync: Arc::new(Mutex::new(sync)),
            tx_sync,
            rx_sync,
            process_timer: Timer::new(),
            start_instant: Instant::now(),
            replay_last: LogSeq::NONE,
            ckpt_stamp: (-1, -1, LogSeq::NONE),
        })
    }

    /// Read access to the state machine (status surfaces, tests).
    pub fn state_machine(&self) -> &VrStateMachine {
        &self.vr
    }

    /// This replica's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    // Seconds of monotonic time since startup.
    fn now(&self) -> i64 {
        self.start_instant.elapsed().as_secs() as i64
    }

    /// Main event loop of the replica. Returns when the state machine asks
    /// for shutdown or the termination signal fires.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), MetaError> {
        let status = self.vr.start(self.now());
        if status < 0 {
            return logged_err!("vr start failed with status {}", status);
        }
        self.announce_hello()?;
        self.process_timer
            .kickoff(Duration::from_secs(self.vr.tick_interval() as u64))?;

        loop {
            let shutdown = self.dispatch_outbound().await?;
            if shutdown {
                break;
            }

            tokio::select! {
                // message or failure notice from the transmitter
                event = self.transmitter.recv_event() => {
                    match event {
                        Ok(event) => self.handle_transmit_event(event)?,
                        Err(e) => {
                            pf_error!("error receiving transmit event: {}", e);
                            continue;
                        }
                    }
                },

                // a sync run completed
                outcome = self.rx_sync.recv() => {
                    let Some(outcome) = outcome else {
                        return logged_err!("sync channel has been closed");
                    };
                    self.handle_sync_outcome(outcome).await?;
                },

                // mandatory process tick
                () = self.process_timer.timeout() => {
                    self.tick().await?;
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("replica caught termination signal");
                    break;
                },
            }
        }

        self.save_checkpoint().await?;
        Ok(())
    }

    // Announces this node to every connected peer.
    fn announce_hello(&mut self) -> Result<(), MetaError> {
        let hello = VrMsg::Hello {
            node_id: self.id,
            last_log_seq: self.vr.last_log_seq(),
            config_hash: self.vr.get_config().config_hash(),
        };
        self.transmitter.bcast_msg(TransmitMsg::Vr(hello), None)
    }

    // Feeds one transmitter event into the state machine.
    fn handle_transmit_event(
        &mut self,
        event: TransmitEvent,
    ) -> Result<(), MetaError> {
        let now = self.now();
        match event {
            TransmitEvent::Msg(peer, TransmitMsg::Vr(msg)) => {
                self.vr.handle_msg(peer, msg, now);
            }

            TransmitEvent::Msg(peer, TransmitMsg::Block { block, payload }) => {
                let status = self.vr.handle_log_block(
                    block.start_seq,
                    block.end_seq,
                    block.committed_seq,
                    block.transmitter,
                );
                pf_trace!(
                    "block [{}] - [{}] ({}B) <- {} status {}",
                    block.start_seq,
                    block.end_seq,
                    payload.len(),
                    peer,
                    status
                );
                // the record payload itself is handed to the external log
                // writer; the ack here covers protocol acceptance
                self.transmitter.send_msg(
                    TransmitMsg::WriteDone {
                        start_seq: block.start_seq,
                        end_seq: block.end_seq,
                        committed_seq: self.vr.committed_seq(),
                        last_view_end_seq: LogSeq::NONE,
                        primary_id: self.vr.get_primary_node_id(),
                        write_ok: status == 0,
                    },
                    peer,
                )?;
            }

            TransmitEvent::Msg(
                peer,
                TransmitMsg::WriteDone {
                    start_seq,
                    end_seq,
                    committed_seq,
                    last_view_end_seq,
                    primary_id,
                    write_ok,
                },
            ) => {
                if self.vr.validate_ack_primary_id(peer, primary_id) {
                    self.vr.log_block_write_done(
                        peer,
                        start_seq,
                        end_seq,
                        committed_seq,
                        last_view_end_seq,
                        write_ok,
                    );
                } else {
                    pf_debug!(
                        "dropping ack <- {} naming primary {}",
                        peer,
                        primary_id
                    );
                }
            }

            TransmitEvent::PeerFailed(peer) => {
                self.vr
                    .handle_log_block_failed(peer, self.vr.last_log_seq());
            }
        }
        Ok(())
    }

    // Folds a completed sync run back into the state machine's view of
    // replay progress, then ticks immediately so the transition happens
    // without waiting out the timer.
    async fn handle_sync_outcome(
        &mut self,
        outcome: SyncOutcome,
    ) -> Result<(), MetaError> {
        match outcome.result {
            Ok(reached) => {
                pf_info!(
                    "sync run reached [{}] (target [{}])",
                    reached,
                    outcome.target
                );
                if reached > self.replay_last {
                    self.replay_last = reached;
                }
            }
            Err(e) => {
                pf_error!(
                    "sync run for target [{}] failed: {}",
                    outcome.target,
                    e
                );
            }
        }
        self.tick().await
    }

    // One mandatory process tick: timers, deferred work, checkpointing.
    async fn tick(&mut self) -> Result<(), MetaError> {
        let now = self.now();
        let result = self.vr.process(
            now,
            LogSeq::NONE,
            0,
            0,
            0,
            self.replay_last,
        );
        if let Some(req) = result.out_request {
            self.append_control_record(req)?;
        }
        let delay = (result.next_deadline - now).max(1);
        self.process_timer
            .kickoff(Duration::from_secs(delay as u64))?;

        let stamp = {
            let (epoch, view) = self.vr.epoch_view();
            (epoch, view, self.vr.committed_seq())
        };
        if stamp != self.ckpt_stamp {
            self.save_checkpoint().await?;
        }
        Ok(())
    }

    // Injects a state-machine-generated VR control record into the log
    // pipeline: assign it the next sequence, accept it locally, and fan it
    // out to peers.
    fn append_control_record(
        &mut self,
        req: OpRequest,
    ) -> Result<(), MetaError> {
        let (epoch, view) = self.vr.epoch_view();
        let last = self.vr.last_log_seq();
        let seq = if last.is_valid() && last.epoch == epoch
            && last.view == view
        {
            last.next()
        } else {
            LogSeq::new(epoch, view, 0)
        };

        let op = MetaOp::new(seq.seq, req);
        let payload = op.emit_request().into_bytes();
        let status = self.vr.handle_log_block(
            seq,
            seq,
            self.vr.committed_seq(),
            self.id,
        );
        if status != 0 {
            return logged_err!(
                "control record [{}] rejected with status {}",
                seq,
                status
            );
        }
        pf_debug!("appended control record [{}]: {}", seq, op);
        self.transmitter.bcast_msg(
            TransmitMsg::Block {
                block: LogBlock {
                    start_seq: seq,
                    end_seq: seq,
                    committed_seq: self.vr.committed_seq(),
                    transmitter: self.id,
                },
                payload,
            },
            None,
        )?;
        // the local durable write is the external log writer's business;
        // count our own acceptance toward the quorum
        self.vr.log_block_write_done(
            self.id,
            seq,
            seq,
            self.vr.committed_seq(),
            LogSeq::NONE,
            true,
        );
        Ok(())
    }

    // Sends queued protocol messages and performs requested side effects.
    // Returns true when the state machine asked to shut down.
    async fn dispatch_outbound(&mut self) -> Result<bool, MetaError> {
        for (target, msg) in self.vr.drain_msgs() {
            let msg = TransmitMsg::Vr(msg);
            match target {
                Some(peer) => self.transmitter.send_msg(msg, peer)?,
                None => self.transmitter.bcast_msg(msg, None)?,
            }
        }

        let mut shutdown = false;
        for event in self.vr.drain_events() {
            match event {
                VrEvent::TruncateUncommitted { seq } => {
                    // the log files belong to the external log writer; it
                    // observes the same view adoption and truncates
                    pf_warn!(
                        "uncommitted log suffix beyond [{}] discarded",
                        seq
                    );
                    if self.replay_last > seq {
                        self.replay_last = seq;
                    }
                }

                VrEvent::StartLogSync { target, primary } => {
                    self.spawn_sync_run(target, primary);
                }

                VrEvent::ConfigMismatch { peer } => {
                    // fetch current state from the disagreeing peer before
                    // resuming the view change
                    self.spawn_sync_run(self.vr.last_log_seq(), peer);
                }

                VrEvent::ConfigInstalled { epoch } => {
                    pf_info!("configuration installed at epoch {}", epoch);
                    self.save_checkpoint().await?;
                }

                VrEvent::Shutdown => {
                    shutdown = true;
                }
            }
        }
        Ok(shutdown)
    }

    // Spawns one sync run against `source`; its completion is pushed onto
    // the sync channel.
    fn spawn_sync_run(&mut self, target: LogSeq, source: NodeId) {
        let Some(info) = self.vr.get_config().node(source) else {
            pf_error!("sync source {} not in config", source);
            return;
        };
        let location = info.locations[0].clone();
        let sync = self.sync.clone();
        let tx_sync = self.tx_sync.clone();
        tokio::spawn(async move {
            let result =
                sync.lock().await.fetch(location, target).await;
            if let Err(e) = tx_sync.send(SyncOutcome { target, result }) {
                pf_error!("error sending sync outcome: {}", e);
            }
        });
    }

    // Persists the current replication state.
    async fn save_checkpoint(&mut self) -> Result<(), MetaError> {
        let mut blob = Vec::new();
        self.vr.checkpoint(&mut blob)?;
        self.ckpt_hub.save(&blob).await?;
        let (epoch, view) = self.vr.epoch_view();
        self.ckpt_stamp = (epoch, view, self.vr.committed_seq());
        pf_debug!(
            "checkpointed vr state: epoch {} view {} committed [{}]",
            epoch,
            view,
            self.vr.committed_seq()
        );
        Ok(())
    }
}
