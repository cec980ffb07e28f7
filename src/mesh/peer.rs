use crate::buffer::jitter::JitterBuffer;
use crate::buffer::packet::PacketBuffer;
use crate::buffer::pool::PacketPool;
use crate::codec::errors::TransportError;
use crate::codec::wire;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// First sequence number assigned in each direction; 0 means "nothing yet"
pub(crate) const INITIAL_SEQUENCE: u32 = 1;

/// Depth of the per-peer outbound queue
///
/// Audio frames arrive on a fixed cadence, so a full queue means the sender
/// has been stuck for seconds; newer frames are dropped rather than queued.
const OUTBOUND_QUEUE_LEN: usize = 256;

/// Grace period granted to a sender task during teardown
///
/// A peer wedged in a socket write must not block the whole mesh from
/// stopping.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(1);

/// One remote member of the call
///
/// Owns the inbound jitter buffer, the outbound send queue and its sender
/// task, and the two recycling pools. Control connections are opened per
/// exchange by the mesh and never stored here.
pub struct Peer {
    /// Mesh-unique numeric id, assigned at admission
    id: u32,
    /// Fixed UDP/TCP address for the lifetime of the peer
    addr: SocketAddr,
    /// Display name; placeholder until the name exchange completes
    name: RwLock<String>,
    /// Local-only playback suppression flag
    muted: AtomicBool,
    /// Next outbound sequence number
    next_sequence: AtomicU32,
    /// Producer side of the outbound queue
    outbound_tx: mpsc::Sender<PacketBuffer>,
    /// Consumer side, parked here until the sender task takes it
    outbound_rx: Mutex<Option<mpsc::Receiver<PacketBuffer>>>,
    out_pool: Arc<PacketPool>,
    in_pool: Arc<PacketPool>,
    jitter: Mutex<JitterBuffer>,
    sender: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Peer {
    pub(crate) fn new(id: u32, addr: SocketAddr) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        Peer {
            id,
            addr,
            name: RwLock::new(format!("peer-{}", id)),
            muted: AtomicBool::new(false),
            next_sequence: AtomicU32::new(INITIAL_SEQUENCE),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            out_pool: Arc::new(PacketPool::new()),
            in_pool: Arc::new(PacketPool::new()),
            jitter: Mutex::new(JitterBuffer::new()),
            sender: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut slot = self.name.write().unwrap_or_else(|e| e.into_inner());
        *slot = name.to_string();
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    // ---- outbound path, called by the audio producer ----

    /// Get an empty buffer to fill with an encoded frame
    pub fn checkout_outbound(&self) -> PacketBuffer {
        self.out_pool.checkout()
    }

    /// Queue a filled buffer for transmission
    ///
    /// Stamps the next outbound sequence number and hands the buffer to the
    /// sender task. Fails with `EmptyPayload` for an unfilled buffer. When
    /// the queue is full the frame is dropped and the buffer recycled; the
    /// consumed sequence number shows up as loss on the far side.
    pub fn enqueue_outbound(&self, mut packet: PacketBuffer) -> crate::Result<()> {
        if packet.is_empty() {
            return Err(TransportError::EmptyPayload.into());
        }
        packet.set_sequence(self.next_sequence.fetch_add(1, Ordering::Relaxed));
        match self.outbound_tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                tracing::warn!(peer = self.id, "outbound queue full, dropping frame");
                self.out_pool.retire(packet);
            }
            Err(TrySendError::Closed(packet)) => {
                self.out_pool.retire(packet);
            }
        }
        Ok(())
    }

    // ---- inbound path ----

    /// Next in-order frame from this peer, once it has aged past the dwell
    /// time; `None` when nothing is ready
    pub fn dequeue_inbound(&self) -> Option<PacketBuffer> {
        let mut jitter = self.jitter.lock().unwrap_or_else(|e| e.into_inner());
        jitter.try_release()
    }

    /// Return a consumed inbound buffer for reuse
    pub fn retire_inbound(&self, packet: PacketBuffer) {
        self.in_pool.retire(packet);
    }

    /// Sequence number of the last frame handed out by `dequeue_inbound`
    ///
    /// Gaps between consecutive values are lost frames.
    pub fn last_delivered(&self) -> u32 {
        self.jitter.lock().unwrap_or_else(|e| e.into_inner()).last_delivered()
    }

    pub(crate) fn checkout_inbound(&self) -> PacketBuffer {
        self.in_pool.checkout()
    }

    pub(crate) fn admit(&self, packet: PacketBuffer) -> crate::Result<()> {
        let mut jitter = self.jitter.lock().unwrap_or_else(|e| e.into_inner());
        jitter.admit(packet)
    }

    // ---- sender task ----

    /// Spawn the sender task draining the outbound queue onto the shared
    /// UDP socket; idempotent
    pub(crate) fn start_sending(&self, udp: Arc<UdpSocket>) {
        let mut parked = self.outbound_rx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = parked.take() else {
            return;
        };
        drop(parked);

        let handle = tokio::spawn(run_sender(
            self.id,
            self.addr,
            udp,
            queue,
            self.out_pool.clone(),
            self.cancel.clone(),
        ));
        let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        *sender = Some(handle);
    }

    /// Stop the sender task, waiting at most `STOP_GRACE` for it to finish
    pub(crate) async fn stop_sending(&self) {
        self.cancel.cancel();
        let handle = {
            let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            sender.take()
        };
        if let Some(handle) = handle {
            if timeout(STOP_GRACE, handle).await.is_err() {
                tracing::warn!(peer = self.id, "sender task did not stop within grace period");
            }
        }
    }
}

/// Sender loop: dequeue, frame, transmit, recycle
///
/// Framing and the socket write happen with no lock held. On shutdown the
/// remaining queued buffers are parked back into the pool.
async fn run_sender(
    id: u32,
    addr: SocketAddr,
    udp: Arc<UdpSocket>,
    mut queue: mpsc::Receiver<PacketBuffer>,
    pool: Arc<PacketPool>,
    cancel: CancellationToken,
) {
    let mut frame = Vec::with_capacity(wire::MAX_DATAGRAM_LEN);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => {
                let Some(packet) = next else { break };
                wire::encode_voice(packet.sequence(), packet.payload(), &mut frame);
                if let Err(e) = udp.send_to(&frame, addr).await {
                    tracing::warn!(peer = id, "voice send to {} failed: {}", addr, e);
                }
                pool.retire(packet);
            }
        }
    }
    while let Ok(packet) = queue.try_recv() {
        pool.retire(packet);
    }
    tracing::debug!(peer = id, "sender task stopped");
}
