//! Mesh coordinator
//!
//! Owns the peer collection, the shared UDP socket, the TCP control
//! listener, and the two background tasks: the UDP receiver routing voice
//! datagrams into per-peer jitter buffers, and the TCP acceptor serving
//! inbound control exchanges one at a time.
//!
//! Admission is by unanimous consent. The member a candidate connects to
//! proposes the candidate to every other member, collects all votes, and
//! only then broadcasts the aggregate verdict, so no member ever acts on a
//! partial result and everyone's roster stays consistent.

pub mod config;
mod control;
pub mod events;
pub mod peer;

pub use config::NodeConfig;
pub use events::RosterEvent;
pub use peer::Peer;

use crate::codec::errors::TransportError;
use crate::codec::opcode::Opcode;
use crate::codec::wire;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Upper bound on call size; the design targets small meshes
pub const MAX_PEERS: usize = 64;

/// Listen backlog for the control socket
const LISTEN_BACKLOG: i32 = 16;

/// The full-mesh call: peer collection, sockets, and protocol state
pub struct Mesh {
    /// Own display name, sent in answer to REQN
    self_name: RwLock<String>,
    /// Port shared by the TCP control listener and the UDP audio socket
    listen_port: u16,
    accept_direct: AtomicBool,
    accept_indirect: AtomicBool,
    control_timeout: Duration,
    /// Current members, in admission order
    peers: RwLock<Vec<Arc<Peer>>>,
    next_peer_id: AtomicU32,
    running: AtomicBool,
    /// Shared UDP socket, present while running
    udp: Mutex<Option<Arc<UdpSocket>>>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Roster-change subscriber, at most one
    events: Mutex<Option<mpsc::UnboundedSender<RosterEvent>>>,
}

impl Mesh {
    pub fn new(config: &NodeConfig) -> Arc<Self> {
        let name = if wire::valid_display_name(&config.display_name) {
            config.display_name.clone()
        } else {
            tracing::warn!("invalid display name {:?}, using default", config.display_name);
            "guest".to_string()
        };
        Arc::new(Mesh {
            self_name: RwLock::new(name),
            listen_port: config.listen_port,
            accept_direct: AtomicBool::new(config.accept_direct_join),
            accept_indirect: AtomicBool::new(config.accept_indirect_join),
            control_timeout: config.control_timeout(),
            peers: RwLock::new(Vec::new()),
            next_peer_id: AtomicU32::new(1),
            running: AtomicBool::new(false),
            udp: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        })
    }

    // ---- GUI/CLI surface ----

    /// Receive roster-change notifications; replaces any prior subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RosterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        *events = Some(tx);
        rx
    }

    pub fn name(&self) -> String {
        self.self_name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_name(&self, name: &str) -> bool {
        if !wire::valid_display_name(name) {
            return false;
        }
        let mut slot = self.self_name.write().unwrap_or_else(|e| e.into_inner());
        *slot = name.to_string();
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_accept_direct_join(&self, accept: bool) {
        self.accept_direct.store(accept, Ordering::Relaxed);
    }

    pub fn set_accept_indirect_join(&self, accept: bool) {
        self.accept_indirect.store(accept, Ordering::Relaxed);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn peer_at(&self, index: usize) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .cloned()
    }

    pub fn peer_by_addr(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.addr() == addr)
            .cloned()
    }

    /// Look up a peer by display name; `None` unless the name is currently
    /// unique in the roster
    pub fn peer_by_name(&self, name: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut matching = peers.iter().filter(|p| p.name() == name);
        let first = matching.next()?;
        if matching.next().is_some() {
            return None;
        }
        Some(first.clone())
    }

    /// Start a new call: bind the sockets and launch the background tasks
    pub async fn host(self: &Arc<Self>) -> bool {
        match self.start_listening().await {
            Ok(()) => {
                tracing::info!("hosting a call as {}", self.name());
                true
            }
            Err(e) => {
                tracing::warn!("host failed: {}", e);
                false
            }
        }
    }

    /// Join the call a member of which listens at `target`
    ///
    /// On any failure, denial included, the mesh is left stopped and empty.
    pub async fn join(self: &Arc<Self>, target: SocketAddr) -> bool {
        match self.join_call(target).await {
            Ok(()) => {
                tracing::info!("joined the call at {}", target);
                true
            }
            Err(e) => {
                tracing::warn!("join of {} failed: {}", target, e);
                false
            }
        }
    }

    /// Leave the call: notify every member, then tear down
    pub async fn disconnect(&self) {
        if !self.is_running() {
            return;
        }
        for peer in self.snapshot() {
            match timeout(self.control_timeout, TcpStream::connect(peer.addr())).await {
                Ok(Ok(mut stream)) => {
                    if let Err(e) =
                        control::send_disconnect(&mut stream, self.control_timeout, self.listen_port)
                            .await
                    {
                        tracing::debug!("disconnect notice to {} failed: {}", peer.addr(), e);
                    }
                }
                _ => tracing::debug!("could not reach {} with disconnect notice", peer.addr()),
            }
        }
        self.stop().await;
        tracing::info!("left the call");
    }

    /// Remove a peer, telling it to drop us first; local mute stays local
    pub async fn kick(&self, addr: SocketAddr) -> bool {
        let Some(peer) = self.peer_by_addr(addr) else {
            return false;
        };
        if let Ok(Ok(mut stream)) =
            timeout(self.control_timeout, TcpStream::connect(peer.addr())).await
        {
            let _ = control::send_disconnect(&mut stream, self.control_timeout, self.listen_port)
                .await;
        }
        self.remove_peer(addr).await
    }

    // ---- lifecycle ----

    async fn start_listening(self: &Arc<Self>) -> crate::Result<()> {
        if self.is_running() {
            return Err("mesh is already running".into());
        }
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let udp = Arc::new(UdpSocket::bind(bind_addr).await?);
        let listener = bind_control_listener(bind_addr)?;

        let cancel = CancellationToken::new();
        {
            let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            *slot = cancel.clone();
        }
        {
            let mut slot = self.udp.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(udp.clone());
        }
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(tokio::spawn(Mesh::run_udp_receive(
                self.clone(),
                udp,
                cancel.clone(),
            )));
            tasks.push(tokio::spawn(Mesh::run_accept(self.clone(), listener, cancel)));
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("listening on port {}", self.listen_port);
        Ok(())
    }

    /// Tear down tasks and peers; safe to host or join again afterwards
    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            cancel.cancel();
        }
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if timeout(peer::STOP_GRACE, handle).await.is_err() {
                tracing::warn!("background task did not stop within grace period");
            }
        }
        let peers: Vec<_> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.drain(..).collect()
        };
        for peer in peers {
            peer.stop_sending().await;
        }
        let mut udp = self.udp.lock().unwrap_or_else(|e| e.into_inner());
        *udp = None;
    }

    async fn join_call(self: &Arc<Self>, target: SocketAddr) -> crate::Result<()> {
        if self.is_running() {
            return Err("already in a call".into());
        }
        // The listener must be up before the handshake: members fetch our
        // display name the moment the admission verdict lands.
        self.start_listening().await?;
        match self.negotiate_join(target).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn negotiate_join(self: &Arc<Self>, target: SocketAddr) -> crate::Result<()> {
        let limit = self.control_timeout;
        let mut stream = match timeout(limit, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::Timeout.into()),
        };

        control::send_connect(&mut stream, limit, self.listen_port).await?;
        if !control::read_verdict(&mut stream, limit).await? {
            return Err("join denied".into());
        }

        let records = control::request_peer_list(&mut stream, limit).await?;
        drop(stream);
        if records.is_empty() {
            return Err(TransportError::ProtocolViolation("empty peer list").into());
        }
        if records.len() > MAX_PEERS {
            return Err(TransportError::PeerLimit.into());
        }

        let udp = self.shared_udp().ok_or("udp socket not bound")?;
        for record in records {
            let peer = self.add_peer(SocketAddr::V4(record))?;
            peer.start_sending(udp.clone());
        }
        for peer in self.snapshot() {
            self.fetch_peer_name(&peer).await;
        }
        Ok(())
    }

    // ---- background tasks ----

    async fn run_udp_receive(mesh: Arc<Mesh>, udp: Arc<UdpSocket>, cancel: CancellationToken) {
        let mut buf = vec![0u8; wire::MAX_DATAGRAM_LEN];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = udp.recv_from(&mut buf) => match received {
                    Ok((len, from)) => mesh.route_datagram(&buf[..len], from),
                    Err(e) => {
                        tracing::error!("udp receive failed: {}", e);
                        break;
                    }
                }
            }
        }
        tracing::debug!("udp receive task stopped");
    }

    /// Classify a datagram by source address and feed the peer's jitter
    /// buffer; malformed or unattributable datagrams are dropped
    fn route_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let (sequence, payload) = match wire::decode_voice(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("dropping datagram from {}: {}", from, e);
                return;
            }
        };
        let Some(peer) = self.peer_by_addr(from) else {
            tracing::debug!("voice frame from unknown address {}", from);
            return;
        };
        let mut packet = peer.checkout_inbound();
        packet.set_sequence(sequence);
        if let Err(e) = packet.set_payload(payload) {
            tracing::debug!("dropping frame from {}: {}", from, e);
            peer.retire_inbound(packet);
            return;
        }
        if let Err(e) = peer.admit(packet) {
            tracing::debug!("dropping frame from {}: {}", from, e);
        }
    }

    async fn run_accept(mesh: Arc<Mesh>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((mut stream, remote)) => {
                        // Control exchanges are served one at a time; every
                        // read and write inside is timeout-bounded.
                        if let Err(e) = mesh.handle_control(&mut stream, remote).await {
                            tracing::warn!("control exchange with {} failed: {}", remote, e);
                        }
                    }
                    Err(e) => tracing::warn!("accept failed: {}", e),
                }
            }
        }
        tracing::debug!("control accept task stopped");
    }

    async fn handle_control(&self, stream: &mut TcpStream, remote: SocketAddr) -> crate::Result<()> {
        let limit = self.control_timeout;
        match control::read_opcode(stream, limit).await? {
            Opcode::Connect => {
                let port = control::read_port(stream, limit).await?;
                let candidate = v4_from(remote.ip(), port)?;
                self.connect_fulfill(candidate, stream).await
            }
            Opcode::Propose => {
                let candidate = control::read_address(stream, limit).await?;
                self.propose_fulfill(candidate, stream).await
            }
            Opcode::Disconnect => {
                let port = control::read_port(stream, limit).await?;
                self.remove_peer(SocketAddr::new(remote.ip(), port)).await;
                Ok(())
            }
            Opcode::RequestName => {
                let _asker_port = control::read_port(stream, limit).await?;
                control::send_name(stream, limit, &self.name()).await
            }
            Opcode::Close => Ok(()),
            _ => Err(TransportError::ProtocolViolation("unexpected opcode on control connection").into()),
        }
    }

    // ---- admission protocol ----

    /// Mediate a direct join request from `candidate`
    ///
    /// Proposes the candidate to every current member, collects all votes,
    /// and relays the aggregate, the logical AND, to members and candidate
    /// alike. A member that cannot be reached aborts the vote with CLOSE.
    async fn connect_fulfill(
        &self,
        candidate: SocketAddrV4,
        stream: &mut TcpStream,
    ) -> crate::Result<()> {
        let limit = self.control_timeout;
        if !self.accept_direct.load(Ordering::Relaxed) || self.peer_count() >= MAX_PEERS {
            tracing::info!("denying direct join from {}", candidate);
            return control::write_verdict(stream, limit, false).await;
        }

        let members = self.snapshot();
        let mut ballots = Vec::with_capacity(members.len());
        for member in &members {
            match timeout(limit, TcpStream::connect(member.addr())).await {
                Ok(Ok(conn)) => ballots.push(conn),
                _ => {
                    tracing::warn!(
                        "cannot reach {} to hold a vote, denying {}",
                        member.addr(),
                        candidate
                    );
                    for mut conn in ballots.drain(..) {
                        let _ = control::send_close(&mut conn, limit).await;
                    }
                    return control::write_verdict(stream, limit, false).await;
                }
            }
        }

        let mut admitted = true;
        for conn in ballots.iter_mut() {
            let vote = async {
                control::send_propose(conn, limit, candidate).await?;
                control::read_verdict(conn, limit).await
            }
            .await;
            match vote {
                Ok(true) => {}
                Ok(false) | Err(_) => admitted = false,
            }
        }

        // Every member learns the aggregate before the candidate does.
        for conn in ballots.iter_mut() {
            if let Err(e) = control::write_verdict(conn, limit, admitted).await {
                tracing::warn!("verdict relay failed: {}", e);
            }
        }
        control::write_verdict(stream, limit, admitted).await?;
        if !admitted {
            tracing::info!("join of {} denied by vote", candidate);
            return Ok(());
        }

        control::expect_opcode(stream, limit, Opcode::RequestPeers).await?;
        let mut roster = Vec::with_capacity(members.len() + 1);
        roster.push(self.advertised_addr(stream)?);
        for member in &members {
            roster.push(as_v4(member.addr())?);
        }
        control::send_peer_list(stream, limit, &roster).await?;

        let peer = self.add_peer(SocketAddr::V4(candidate))?;
        if let Some(udp) = self.shared_udp() {
            peer.start_sending(udp);
        }
        self.fetch_peer_name(&peer).await;
        tracing::info!("admitted {} as peer {}", candidate, peer.id());
        Ok(())
    }

    /// Vote on another member's candidate
    ///
    /// The local vote alone is not authoritative; the candidate is added
    /// only when the initiator's aggregate verdict and the local vote both
    /// say yes.
    async fn propose_fulfill(
        &self,
        candidate: SocketAddrV4,
        stream: &mut TcpStream,
    ) -> crate::Result<()> {
        let limit = self.control_timeout;
        let vote = self.accept_indirect.load(Ordering::Relaxed) && self.peer_count() < MAX_PEERS;
        control::write_verdict(stream, limit, vote).await?;

        let admitted = control::read_verdict(stream, limit).await?;
        if admitted && vote {
            let peer = self.add_peer(SocketAddr::V4(candidate))?;
            if let Some(udp) = self.shared_udp() {
                peer.start_sending(udp);
            }
            self.fetch_peer_name(&peer).await;
            tracing::info!("admitted proposed peer {}", candidate);
        }
        Ok(())
    }

    // ---- roster bookkeeping ----

    fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn shared_udp(&self) -> Option<Arc<UdpSocket>> {
        self.udp.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn add_peer(&self, addr: SocketAddr) -> crate::Result<Arc<Peer>> {
        let peer = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            if peers.len() >= MAX_PEERS {
                return Err(TransportError::PeerLimit.into());
            }
            if peers.iter().any(|p| p.addr() == addr) {
                return Err("peer already present".into());
            }
            let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
            let peer = Arc::new(Peer::new(id, addr));
            peers.push(peer.clone());
            peer
        };
        self.emit(RosterEvent::PeerJoined {
            id: peer.id(),
            addr: peer.addr(),
        });
        Ok(peer)
    }

    async fn remove_peer(&self, addr: SocketAddr) -> bool {
        let removed = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers
                .iter()
                .position(|p| p.addr() == addr)
                .map(|index| peers.remove(index))
        };
        match removed {
            Some(peer) => {
                peer.stop_sending().await;
                self.emit(RosterEvent::PeerLeft {
                    id: peer.id(),
                    addr: peer.addr(),
                });
                tracing::info!("peer {} at {} removed", peer.id(), addr);
                true
            }
            None => false,
        }
    }

    /// Fetch a peer's display name over a fresh control connection
    ///
    /// Best effort: on failure the placeholder name stays.
    async fn fetch_peer_name(&self, peer: &Arc<Peer>) {
        let limit = self.control_timeout;
        let fetched = async {
            let mut stream = match timeout(limit, TcpStream::connect(peer.addr())).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err::<String, crate::Error>(TransportError::Timeout.into()),
            };
            control::request_name(&mut stream, limit, self.listen_port).await
        }
        .await;
        match fetched {
            Ok(name) => {
                peer.set_name(&name);
                self.emit(RosterEvent::PeerNamed {
                    id: peer.id(),
                    name,
                });
            }
            Err(e) => tracing::debug!("name exchange with {} failed: {}", peer.addr(), e),
        }
    }

    fn emit(&self, event: RosterEvent) {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Our own address as the remote end of `stream` sees it
    fn advertised_addr(&self, stream: &TcpStream) -> crate::Result<SocketAddrV4> {
        v4_from(stream.local_addr()?.ip(), self.listen_port)
    }
}

fn v4_from(ip: IpAddr, port: u16) -> crate::Result<SocketAddrV4> {
    match ip {
        IpAddr::V4(ip) => Ok(SocketAddrV4::new(ip, port)),
        IpAddr::V6(_) => Err(TransportError::MalformedAddress.into()),
    }
}

fn as_v4(addr: SocketAddr) -> crate::Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(_) => Err(TransportError::MalformedAddress.into()),
    }
}

/// Bind the control listener with SO_REUSEADDR so a node can host again
/// right after leaving a call
fn bind_control_listener(addr: SocketAddr) -> crate::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into()).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh() -> Arc<Mesh> {
        Mesh::new(&NodeConfig::default())
    }

    fn addr(host: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, host], port))
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let mesh = mesh();
        for i in 0..MAX_PEERS {
            mesh.add_peer(addr((i + 1) as u8, 8421)).unwrap();
        }
        assert_eq!(mesh.peer_count(), MAX_PEERS);
        assert!(mesh.add_peer(addr(200, 8421)).is_err());
        assert_eq!(mesh.peer_count(), MAX_PEERS);
    }

    #[tokio::test]
    async fn test_duplicate_address_rejected() {
        let mesh = mesh();
        mesh.add_peer(addr(1, 8421)).unwrap();
        assert!(mesh.add_peer(addr(1, 8421)).is_err());
        assert_eq!(mesh.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_lookup_by_index_addr_and_name() {
        let mesh = mesh();
        let first = mesh.add_peer(addr(1, 8421)).unwrap();
        let second = mesh.add_peer(addr(2, 8421)).unwrap();
        first.set_name("alice");
        second.set_name("bob");

        assert_eq!(mesh.peer_at(0).unwrap().id(), first.id());
        assert_eq!(mesh.peer_by_addr(addr(2, 8421)).unwrap().id(), second.id());
        assert_eq!(mesh.peer_by_name("alice").unwrap().id(), first.id());
        assert!(mesh.peer_by_name("carol").is_none());
    }

    #[tokio::test]
    async fn test_name_lookup_requires_uniqueness() {
        let mesh = mesh();
        let first = mesh.add_peer(addr(1, 8421)).unwrap();
        let second = mesh.add_peer(addr(2, 8421)).unwrap();
        first.set_name("twin");
        second.set_name("twin");
        assert!(mesh.peer_by_name("twin").is_none());
    }

    #[tokio::test]
    async fn test_set_name_validates() {
        let mesh = mesh();
        assert!(mesh.set_name("alice-2"));
        assert_eq!(mesh.name(), "alice-2");
        assert!(!mesh.set_name("bad name!"));
        assert_eq!(mesh.name(), "alice-2");
        assert!(!mesh.set_name(""));
    }

    #[tokio::test]
    async fn test_peer_ids_are_unique() {
        let mesh = mesh();
        let a = mesh.add_peer(addr(1, 8421)).unwrap();
        let b = mesh.add_peer(addr(2, 8421)).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
