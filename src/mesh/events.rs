use std::net::SocketAddr;

/// Roster change notification delivered to the GUI/CLI subscriber
///
/// Fired from the admission and removal paths. Events describe what already
/// happened; the peer collection is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    /// A peer was admitted to the call
    PeerJoined { id: u32, addr: SocketAddr },
    /// A peer left, was kicked, or the call was torn down around it
    PeerLeft { id: u32, addr: SocketAddr },
    /// A peer's display name arrived over the name exchange
    PeerNamed { id: u32, name: String },
}
