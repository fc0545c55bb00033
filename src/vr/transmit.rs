//! Log transmitter: fans locally-accepted log blocks and VR control
//! messages out to peer replicas over TCP, and feeds inbound messages and
//! per-peer write acknowledgements back to the driving loop.
//!
//! NOTE: In concept the protocol tolerates unstable channels; TCP gives us
//! "every message a sender wants to send will be retried until eventually
//! delivered" per connection, and terminal connection failure is surfaced
//! as a peer-failed event so the state machine can account for it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, MetaError,
};
use crate::vr::{NodeId, TransmitMsg};

use get_size::GetSize;

use bytes::BytesMut;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the driving loop receives from the transmitter.
#[derive(Debug)]
pub(crate) enum TransmitEvent {
    /// A message arrived from a connected peer.
    Msg(NodeId, TransmitMsg),

    /// A peer connection terminally failed (socket closed or errored).
    PeerFailed(NodeId),
}

/// TCP fan-out hub for peer replication traffic.
pub(crate) struct LogTransmitterHub {
    /// My node ID.
    me: NodeId,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<TransmitEvent>,

    /// Map from peer ID -> sender side of the send channel, shared with the
    /// peer acceptor task.
    tx_sends:
        flashmap::ReadHandle<NodeId, mpsc::UnboundedSender<TransmitMsg>>,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(NodeId, SocketAddr)>,

    /// Receiver side of the connack channel.
    rx_connack: mpsc::UnboundedReceiver<NodeId>,

    /// Total payload bytes received from peers.
    recv_bytes: Arc<AtomicUsize>,

    /// Map from peer ID -> peer messenger task join handles, shared with
    /// the peer acceptor task.
    _peer_messenger_handles: flashmap::ReadHandle<NodeId, JoinHandle<()>>,
}

impl LogTransmitterHub {
    /// Creates the transmitter hub listening on `p2p_addr` and spawns the
    /// peer acceptor task.
    pub(crate) async fn new_and_setup(
        me: NodeId,
        p2p_addr: SocketAddr,
    ) -> Result<Self, MetaError> {
        if me < 0 {
            return logged_err!("invalid transmitter node id {}", me);
        }

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<NodeId, mpsc::UnboundedSender<TransmitMsg>>();
        let (peer_messenger_handles_write, peer_messenger_handles_read) =
            flashmap::new::<NodeId, JoinHandle<()>>();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();
        let recv_bytes = Arc::new(AtomicUsize::new(0));

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = TransmitterAcceptorTask::new(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            peer_messenger_handles_write,
            rx_connect,
            tx_connack,
            recv_bytes.clone(),
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(LogTransmitterHub {
            me,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
            recv_bytes,
            _peer_messenger_handles: peer_messenger_handles_read,
        })
    }

    /// Connects to a peer replica proactively, and spawns the corresponding
    /// messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: NodeId,
        peer_addr: SocketAddr,
    ) -> Result<(), MetaError> {
        self.tx_connect
            .send((id, peer_addr))
            .map_err(MetaError::msg)?;
        match self.rx_connack.recv().await {
            Some(ack_id) if ack_id == id => Ok(()),
            Some(ack_id) => logged_err!(
                "peer ID mismatch: expected {}, got {}",
                id,
                ack_id
            ),
            None => logged_err!("connack channel closed"),
        }
    }

    /// IDs of currently connected peers.
    pub(crate) fn current_peers(&self) -> Vec<NodeId> {
        let tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.keys().copied().collect()
    }

    /// Sends a message to a specified peer. Unknown/disconnected peers are
    /// silently skipped; the protocol recovers via retransmission.
    pub(crate) fn send_msg(
        &mut self,
        msg: TransmitMsg,
        peer: NodeId,
    ) -> Result<(), MetaError> {
        let tx_sends_guard = self.tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(&peer) {
            tx_send.send(msg).map_err(MetaError::msg)?;
        }
        Ok(())
    }

    /// Broadcasts a message to all currently connected peers, or to
    /// `targets` only when given.
    pub(crate) fn bcast_msg(
        &mut self,
        msg: TransmitMsg,
        targets: Option<&[NodeId]>,
    ) -> Result<(), MetaError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            if let Some(targets) = targets {
                if !targets.contains(&peer) {
                    continue;
                }
            }

            // not skipped
            tx_sends_guard
                .get(&peer)
                .unwrap()
                .send(msg.clone())
                .map_err(MetaError::msg)?;
        }
        Ok(())
    }

    /// Receives the next transmitter event (peer message or peer failure).
    pub(crate) async fn recv_event(
        &mut self,
    ) -> Result<TransmitEvent, MetaError> {
        match self.rx_recv.recv().await {
            Some(event) => Ok(event),
            None => logged_err!("transmitter recv channel has been closed"),
        }
    }

    /// Total payload bytes received from peers so far.
    pub(crate) fn recv_bytes_total(&self) -> usize {
        self.recv_bytes.load(Ordering::Relaxed)
    }
}

/// Transmitter peer acceptor task.
struct TransmitterAcceptorTask {
    me: NodeId,

    tx_recv: mpsc::UnboundedSender<TransmitEvent>,
    tx_sends:
        flashmap::WriteHandle<NodeId, mpsc::UnboundedSender<TransmitMsg>>,

    peer_listener: TcpListener,
    peer_messenger_handles: flashmap::WriteHandle<NodeId, JoinHandle<()>>,

    rx_connect: mpsc::UnboundedReceiver<(NodeId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<NodeId>,

    recv_bytes: Arc<AtomicUsize>,

    tx_exit: mpsc::UnboundedSender<NodeId>,
    rx_exit: mpsc::UnboundedReceiver<NodeId>,
}

impl TransmitterAcceptorTask {
    #[allow(clippy::too_many_arguments)]
    fn new(
        me: NodeId,
        tx_recv: mpsc::UnboundedSender<TransmitEvent>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            NodeId,
            mpsc::UnboundedSender<TransmitMsg>,
        >,
        peer_messenger_handles: flashmap::WriteHandle<NodeId, JoinHandle<()>>,
        rx_connect: mpsc::UnboundedReceiver<(NodeId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<NodeId>,
        recv_bytes: Arc<AtomicUsize>,
    ) -> Self {
        // exit channel for getting notified about termination of peer
        // messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        TransmitterAcceptorTask {
            me,
            tx_recv,
            tx_sends,
            peer_listener,
            peer_messenger_handles,
            rx_connect,
            tx_connack,
            recv_bytes,
            tx_exit,
            rx_exit,
        }
    }

    // Registers a connected peer stream and spawns its messenger task.
    fn register_peer(&mut self, id: NodeId, stream: TcpStream) {
        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);
        drop(tx_sends_guard);

        let mut messenger = TransmitterMessengerTask::new(
            id,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.recv_bytes.clone(),
            self.tx_exit.clone(),
        );
        let handle = tokio::spawn(async move { messenger.run().await });
        let mut handles_guard = self.peer_messenger_handles.guard();
        handles_guard.insert(id, handle);
    }

    /// Connects to a peer proactively; node ids are exchanged as the
    /// connection handshake.
    async fn connect_new_peer(
        &mut self,
        id: NodeId,
        conn_addr: SocketAddr,
    ) -> Result<(), MetaError> {
        pf_debug!("connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = tcp_connect_with_retry(conn_addr, 10).await?;
        stream.write_i64(self.me).await?; // send my ID

        let handles_guard = self.peer_messenger_handles.guard();
        if handles_guard.contains_key(&id) {
            return logged_err!("duplicate peer ID to connect: {}", id);
        }
        drop(handles_guard);

        self.register_peer(id, stream);
        pf_debug!("connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new inbound peer connection.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), MetaError> {
        let id = match stream.read_i64().await {
            Ok(id) if id >= 0 => id,
            Ok(id) => {
                return logged_err!("invalid peer ID listened: {}", id);
            }
            Err(e) => {
                return logged_err!("error receiving new peer ID: {}", e);
            }
        };

        let handles_guard = self.peer_messenger_handles.guard();
        if handles_guard.contains_key(&id) {
            return logged_err!("duplicate peer ID listened: {}", id);
        }
        drop(handles_guard);

        self.register_peer(id, stream);
        pf_debug!("waited on peer {} '{}'", id, addr);
        Ok(())
    }

    // Removes handles of a failed/closed peer connection and surfaces the
    // failure to the driving loop.
    fn remove_left_peer(&mut self, id: NodeId) {
        let mut tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.remove(id);
        drop(tx_sends_guard);
        let mut handles_guard = self.peer_messenger_handles.guard();
        handles_guard.remove(id);
        drop(handles_guard);

        if let Err(e) = self.tx_recv.send(TransmitEvent::PeerFailed(id)) {
            pf_error!("error sending peer-failed event for {}: {}", id, e);
        }
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!("peer_acceptor task spawned");

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    let Some((peer, conn_addr)) = to_connect else {
                        break; // channel closed and no messages remain
                    };
                    if let Err(e) = self.connect_new_peer(
                        peer,
                        conn_addr,
                    ).await {
                        pf_error!("error connecting to new peer: {}", e);
                    } else if let Err(e) = self.tx_connack.send(peer) {
                        pf_error!("error sending to tx_connack: {}", e);
                    }
                },

                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("error accepting peer connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.accept_new_peer(
                        stream,
                        addr,
                    ).await {
                        pf_error!("error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                id = self.rx_exit.recv() => {
                    if let Some(id) = id {
                        self.remove_left_peer(id);
                    }
                },
            }
        }

        pf_debug!("peer_acceptor task exited");
    }
}

/// Transmitter per-peer messenger task.
struct TransmitterMessengerTask {
    /// Corresponding peer's ID.
    id: NodeId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<TransmitMsg>,
    read_buf: BytesMut,

    tx_recv: mpsc::UnboundedSender<TransmitEvent>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    recv_bytes: Arc<AtomicUsize>,

    tx_exit: mpsc::UnboundedSender<NodeId>,
}

impl TransmitterMessengerTask {
    fn new(
        id: NodeId,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<TransmitMsg>,
        tx_recv: mpsc::UnboundedSender<TransmitEvent>,
        recv_bytes: Arc<AtomicUsize>,
        tx_exit: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        TransmitterMessengerTask {
            id,
            conn_read,
            conn_write,
            rx_send,
            read_buf: BytesMut::with_capacity(8 + 1024),
            tx_recv,
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            recv_bytes,
            tx_exit,
        }
    }

    /// Writes a message through the TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    fn write_msg(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&TransmitMsg>,
    ) -> Result<bool, MetaError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }

    /// Reads a message from the TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    async fn read_msg(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<TransmitMsg, MetaError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts the per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!("peer_messenger task for {} spawned", self.id);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(msg) => {
                            match Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {}
                                Ok(false) => {
                                    pf_debug!(
                                        "should start retrying msg send -> {}",
                                        self.id
                                    );
                                    self.retrying = true;
                                }
                                Err(_e) => break,
                            }
                        },

                        None => break, // channel closed, no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_msg(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!(
                                "finished retrying last msg send -> {}",
                                self.id
                            );
                            self.retrying = false;
                        }
                        Ok(false) => {}
                        Err(_e) => break,
                    }
                },

                // receives new message from peer
                msg = Self::read_msg(&mut self.read_buf, &mut self.conn_read) => {
                    match msg {
                        Ok(msg) => {
                            self.recv_bytes
                                .fetch_add(msg.get_size(), Ordering::Relaxed);
                            if let Err(e) = self.tx_recv.send(
                                TransmitEvent::Msg(self.id, msg),
                            ) {
                                pf_error!(
                                    "error sending to tx_recv for {}: {}",
                                    self.id,
                                    e
                                );
                            }
                        },

                        Err(_e) => break, // peer probably exited ungracefully
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!("error sending exit signal for {}: {}", self.id, e);
        }
        pf_debug!("peer_messenger task for {} exited", self.id);
    }
}

#[cfg(test)]
mod transmit_tests {
    use super::*;
    use crate::vr::{LogBlock, LogSeq, VrMsg};
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn hello(node_id: NodeId) -> TransmitMsg {
        TransmitMsg::Vr(VrMsg::Hello {
            node_id,
            last_log_seq: LogSeq::new(0, 0, 3),
            config_hash: 7,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn send_recv_and_failure() -> Result<(), MetaError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // node 2
            let mut hub =
                LogTransmitterHub::new_and_setup(2, "127.0.0.1:31012".parse()?)
                    .await?;
            barrier2.wait().await;
            // recv a block from 1
            let event = hub.recv_event().await?;
            let TransmitEvent::Msg(peer, TransmitMsg::Block { block, payload }) =
                event
            else {
                return logged_err!("unexpected transmit event");
            };
            assert_eq!(peer, 1);
            assert_eq!(block.start_seq, LogSeq::new(0, 0, 4));
            assert_eq!(payload, vec![9, 9]);
            // ack it back
            hub.send_msg(
                TransmitMsg::WriteDone {
                    start_seq: block.start_seq,
                    end_seq: block.end_seq,
                    committed_seq: block.committed_seq,
                    last_view_end_seq: LogSeq::NONE,
                    primary_id: 1,
                    write_ok: true,
                },
                1,
            )?;
            assert!(hub.recv_bytes_total() > 0);
            // then drop the hub: node 1 must observe the failure
            Ok::<(), MetaError>(())
        });

        // node 1
        let mut hub =
            LogTransmitterHub::new_and_setup(1, "127.0.0.1:31011".parse()?)
                .await?;
        barrier.wait().await;
        hub.connect_to_peer(2, "127.0.0.1:31012".parse()?).await?;
        assert_eq!(hub.current_peers(), vec![2]);

        hub.bcast_msg(
            TransmitMsg::Block {
                block: LogBlock {
                    start_seq: LogSeq::new(0, 0, 4),
                    end_seq: LogSeq::new(0, 0, 5),
                    committed_seq: LogSeq::new(0, 0, 3),
                    transmitter: 1,
                },
                payload: vec![9, 9],
            },
            None,
        )?;

        let event = hub.recv_event().await?;
        let TransmitEvent::Msg(peer, TransmitMsg::WriteDone { write_ok, .. }) =
            event
        else {
            return logged_err!("unexpected transmit event");
        };
        assert_eq!(peer, 2);
        assert!(write_ok);

        // peer side exits; expect a failure notice
        loop {
            match hub.recv_event().await? {
                TransmitEvent::PeerFailed(2) => break,
                TransmitEvent::Msg(..) => continue,
                TransmitEvent::PeerFailed(id) => {
                    return logged_err!("unexpected failed peer {}", id);
                }
            }
        }
        assert!(hub.current_peers().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn targeted_broadcast_skips_others() -> Result<(), MetaError> {
        let barrier = Arc::new(Barrier::new(3));
        for id in [2i64, 3i64] {
            let barrier_ref = barrier.clone();
            tokio::spawn(async move {
                let mut hub = LogTransmitterHub::new_and_setup(
                    id,
                    format!("127.0.0.1:3102{}", id).parse()?,
                )
                .await?;
                barrier_ref.wait().await;
                if id == 2 {
                    // only node 2 must see the targeted message
                    let event = hub.recv_event().await?;
                    assert!(matches!(
                        event,
                        TransmitEvent::Msg(1, TransmitMsg::Vr(_))
                    ));
                    hub.send_msg(hello(2), 1)?;
                } else {
                    // node 3 just answers the final broadcast
                    let event = hub.recv_event().await?;
                    assert!(matches!(
                        event,
                        TransmitEvent::Msg(1, TransmitMsg::Vr(_))
                    ));
                    hub.send_msg(hello(3), 1)?;
                }
                Ok::<(), MetaError>(())
            });
        }

        let mut hub =
            LogTransmitterHub::new_and_setup(1, "127.0.0.1:31021".parse()?)
                .await?;
        barrier.wait().await;
        hub.connect_to_peer(2, "127.0.0.1:31022".parse()?).await?;
        hub.connect_to_peer(3, "127.0.0.1:31023".parse()?).await?;

        hub.bcast_msg(hello(1), Some(&[2]))?;
        let event = hub.recv_event().await?;
        let TransmitEvent::Msg(peer, _) = event else {
            return logged_err!("unexpected transmit event");
        };
        assert_eq!(peer, 2);

        hub.bcast_msg(hello(1), Some(&[3]))?;
        // node 2's task may have exited already; skip its failure notice
        let peer = loop {
            match hub.recv_event().await? {
                TransmitEvent::Msg(peer, _) => break peer,
                TransmitEvent::PeerFailed(_) => continue,
            }
        };
        assert_eq!(peer, 3);
        Ok(())
    }
}
