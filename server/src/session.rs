//! Per-peer session state and input queuing on the simulation thread
//!
//! This module tracks everything the simulation knows about a connected peer:
//! - Login state and the player account behind the connection
//! - The ship entity the peer controls, stored as an id into the world arena
//! - Inputs buffered in timestamp order for deterministic processing
//!
//! Sessions are created when the transport reports a connection and removed
//! exactly once when it reports the disconnect. The simulation thread is the
//! only writer, so no locking is involved.

use crate::world::{EntityId, PlayerId};
use log::{debug, info};
use shared::protocol::PlayerInput;
use shared::PeerId;
use std::collections::HashMap;

/// Inputs buffered per session before the oldest are dropped.
pub const MAX_PENDING_INPUTS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    /// Connected but not yet authenticated
    Connected,
    /// A login request is waiting on the database
    LoggingIn,
    LoggedIn { player_id: PlayerId, username: String },
}

/// Represents one connected peer and its simulation-side state
///
/// Each session maintains:
/// - The login state and, once logged in, the owning player
/// - The controlled ship, if one has been spawned
/// - Buffered inputs waiting to be applied in chronological order
#[derive(Debug)]
pub struct Session {
    /// Transport peer this session belongs to
    pub peer: PeerId,
    pub state: LoginState,
    /// Ship steered by this peer's inputs
    pub ship: Option<EntityId>,
    /// Client timestamp of the newest input applied to the simulation
    pub last_processed_input: u64,
    /// Buffered inputs waiting to be processed
    pub pending_inputs: Vec<PlayerInput>,
    /// Smoothed round-trip time reported by the transport, in milliseconds
    pub ping: u32,
    /// Set once the peer was kicked; its packets are ignored until the
    /// disconnect arrives
    pub kicked: bool,
    /// Distinguishes this connection from earlier ones that held the same
    /// peer id
    pub generation: u64,
}

impl Session {
    /// Creates a new session for a freshly connected peer
    ///
    /// The session starts unauthenticated, without a ship and with an
    /// empty input buffer.
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            state: LoginState::Connected,
            ship: None,
            last_processed_input: 0,
            pending_inputs: Vec::new(),
            ping: 0,
            kicked: false,
            generation: 0,
        }
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        match &self.state {
            LoginState::LoggedIn { player_id, .. } => Some(*player_id),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match &self.state {
            LoginState::LoggedIn { username, .. } => Some(username),
            _ => None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(self.state, LoginState::LoggedIn { .. })
    }

    /// Adds a new input to the session's pending queue
    ///
    /// Inputs are kept sorted by timestamp so they are processed in the
    /// correct order even when unreliable packets arrive out of order.
    /// Inputs no newer than the last processed one are stale and rejected,
    /// as are duplicates. When the buffer is full the oldest input is
    /// dropped.
    pub fn add_input(&mut self, input: PlayerInput) -> bool {
        if input.timestamp <= self.last_processed_input {
            return false;
        }
        let position = match self
            .pending_inputs
            .binary_search_by_key(&input.timestamp, |i| i.timestamp)
        {
            Ok(_) => return false,
            Err(position) => position,
        };
        self.pending_inputs.insert(position, input);
        if self.pending_inputs.len() > MAX_PENDING_INPUTS {
            self.pending_inputs.remove(0);
        }
        true
    }
}

/// Manages every session and their input processing
///
/// The SessionManager indexes sessions by peer id, answers lookups by
/// player account, and collects buffered inputs across all sessions in
/// chronological order so the simulation applies them deterministically.
#[derive(Default)]
pub struct SessionManager {
    /// Sessions indexed by the transport peer id
    sessions: HashMap<PeerId, Session>,
    /// Generation handed to the next opened session
    next_generation: u64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for a newly connected peer
    ///
    /// Returns false if the peer already has one; the transport reports
    /// each connection once, so that indicates a bookkeeping error upstream.
    pub fn add_session(&mut self, peer: PeerId) -> bool {
        if self.sessions.contains_key(&peer) {
            return false;
        }
        info!("Session opened for {}", peer);
        self.next_generation += 1;
        let mut session = Session::new(peer);
        session.generation = self.next_generation;
        self.sessions.insert(peer, session);
        true
    }

    /// Looks up a session only if it is still the connection identified by
    /// `generation`
    ///
    /// Peer ids are reused once a slot frees up, so work started on behalf
    /// of one connection must use this to find its way back.
    pub fn get_current_mut(&mut self, peer: PeerId, generation: u64) -> Option<&mut Session> {
        self.sessions
            .get_mut(&peer)
            .filter(|session| session.generation == generation)
    }

    /// Removes a session, returning it so the caller can release the ship
    /// and any other resources tied to it
    pub fn remove_session(&mut self, peer: PeerId) -> Option<Session> {
        let session = self.sessions.remove(&peer)?;
        info!("Session closed for {}", peer);
        Some(session)
    }

    pub fn get(&self, peer: PeerId) -> Option<&Session> {
        self.sessions.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut Session> {
        self.sessions.get_mut(&peer)
    }

    /// Finds the peer currently logged in as `player_id`
    pub fn find_by_player(&self, player_id: PlayerId) -> Option<PeerId> {
        self.sessions
            .values()
            .find(|s| s.player_id() == Some(player_id))
            .map(|s| s.peer)
    }

    /// Finds the session controlling the given entity
    pub fn find_by_ship(&self, ship: EntityId) -> Option<PeerId> {
        self.sessions
            .values()
            .find(|s| s.ship == Some(ship))
            .map(|s| s.peer)
    }

    /// Buffers an input for a logged-in session with a ship
    ///
    /// Returns false if the session is unknown, cannot steer anything, or
    /// the input is stale.
    pub fn add_input(&mut self, peer: PeerId, input: PlayerInput) -> bool {
        match self.sessions.get_mut(&peer) {
            Some(session) if session.ship.is_some() && !session.kicked => session.add_input(input),
            _ => false,
        }
    }

    /// Gets all unprocessed inputs sorted chronologically
    ///
    /// Collects buffered inputs from every session and sorts them by
    /// timestamp, breaking ties by peer id so the order is deterministic.
    pub fn get_chronological_inputs(&self) -> Vec<(PeerId, PlayerInput)> {
        let mut all_inputs: Vec<(PeerId, PlayerInput)> = self
            .sessions
            .values()
            .flat_map(|s| {
                s.pending_inputs
                    .iter()
                    .filter(|i| i.timestamp > s.last_processed_input)
                    .map(|i| (s.peer, i.clone()))
            })
            .collect();

        all_inputs.sort_by_key(|(peer, input)| (input.timestamp, *peer));
        all_inputs
    }

    /// Records that an input has been applied to the simulation
    ///
    /// The timestamp is echoed back in snapshots so clients can discard the
    /// predictions it covers.
    pub fn mark_input_processed(&mut self, peer: PeerId, timestamp: u64) {
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.last_processed_input = session.last_processed_input.max(timestamp);
        }
    }

    /// Drops inputs that have already been applied from every buffer
    pub fn cleanup_processed_inputs(&mut self) {
        for session in self.sessions.values_mut() {
            let last = session.last_processed_input;
            session.pending_inputs.retain(|input| input.timestamp > last);
        }
    }

    /// Last processed input timestamp of every session
    pub fn get_last_processed_inputs(&self) -> HashMap<PeerId, u64> {
        self.sessions
            .iter()
            .map(|(peer, session)| (*peer, session.last_processed_input))
            .collect()
    }

    pub fn update_ping(&mut self, peer: PeerId, ping: u32) {
        if let Some(session) = self.sessions.get_mut(&peer) {
            debug!("{} ping {}ms", peer, ping);
            session.ping = ping;
        }
    }

    /// Peers of every logged-in session that has not been kicked
    pub fn logged_in_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.is_logged_in() && !s.kicked)
            .map(|s| s.peer)
            .collect();
        peers.sort();
        peers
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Vec3;

    fn input(timestamp: u64) -> PlayerInput {
        PlayerInput {
            timestamp,
            thrust: Vec3::new(0.0, 0.0, 1.0),
            torque: Vec3::ZERO,
        }
    }

    fn logged_in(manager: &mut SessionManager, peer: u32, player: u64, ship: EntityId) -> PeerId {
        let peer = PeerId(peer);
        manager.add_session(peer);
        let session = manager.get_mut(peer).unwrap();
        session.state = LoginState::LoggedIn {
            player_id: player,
            username: format!("pilot{}", player),
        };
        session.ship = Some(ship);
        peer
    }

    #[test]
    fn test_session_creation() {
        let session = Session::new(PeerId(3));
        assert_eq!(session.state, LoginState::Connected);
        assert_eq!(session.ship, None);
        assert_eq!(session.last_processed_input, 0);
        assert!(session.pending_inputs.is_empty());
        assert!(!session.is_logged_in());
    }

    #[test]
    fn test_reused_peer_gets_new_generation() {
        let mut manager = SessionManager::new();
        let peer = PeerId(5);
        manager.add_session(peer);
        let first = manager.get(peer).unwrap().generation;
        assert!(manager.get_current_mut(peer, first).is_some());

        manager.remove_session(peer);
        manager.add_session(peer);
        let second = manager.get(peer).unwrap().generation;
        assert_ne!(first, second);
        assert!(manager.get_current_mut(peer, first).is_none());
        assert!(manager.get_current_mut(peer, second).is_some());
    }

    #[test]
    fn test_session_add_input_orders_by_timestamp() {
        let mut session = Session::new(PeerId(1));
        assert!(session.add_input(input(200)));
        assert!(session.add_input(input(100)));
        assert!(!session.add_input(input(100)));

        let timestamps: Vec<u64> = session.pending_inputs.iter().map(|i| i.timestamp).collect();
        assert_eq!(timestamps, vec![100, 200]);
    }

    #[test]
    fn test_stale_input_rejected() {
        let mut session = Session::new(PeerId(1));
        session.last_processed_input = 500;
        assert!(!session.add_input(input(500)));
        assert!(!session.add_input(input(10)));
        assert!(session.add_input(input(501)));
    }

    #[test]
    fn test_input_buffer_bounded() {
        let mut session = Session::new(PeerId(1));
        for t in 1..=(MAX_PENDING_INPUTS as u64 + 10) {
            session.add_input(input(t));
        }
        assert_eq!(session.pending_inputs.len(), MAX_PENDING_INPUTS);
        assert_eq!(session.pending_inputs[0].timestamp, 11);
    }

    #[test]
    fn test_add_and_remove_session() {
        let mut manager = SessionManager::new();
        assert!(manager.add_session(PeerId(1)));
        assert!(!manager.add_session(PeerId(1)));
        assert_eq!(manager.len(), 1);

        assert!(manager.remove_session(PeerId(1)).is_some());
        assert!(manager.remove_session(PeerId(1)).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_input_requires_ship() {
        let mut manager = SessionManager::new();
        manager.add_session(PeerId(1));
        assert!(!manager.add_input(PeerId(1), input(1)));
        assert!(!manager.add_input(PeerId(99), input(1)));

        let peer = logged_in(&mut manager, 2, 7, 0);
        assert!(manager.add_input(peer, input(1)));
    }

    #[test]
    fn test_get_chronological_inputs() {
        let mut manager = SessionManager::new();
        let a = logged_in(&mut manager, 1, 10, 0);
        let b = logged_in(&mut manager, 2, 20, 1);

        manager.add_input(a, input(100));
        manager.add_input(b, input(50));
        manager.add_input(a, input(200));
        manager.add_input(b, input(100));

        let inputs = manager.get_chronological_inputs();
        let order: Vec<(PeerId, u64)> = inputs.iter().map(|(p, i)| (*p, i.timestamp)).collect();
        assert_eq!(order, vec![(b, 50), (a, 100), (b, 100), (a, 200)]);
    }

    #[test]
    fn test_mark_and_cleanup_processed() {
        let mut manager = SessionManager::new();
        let peer = logged_in(&mut manager, 1, 10, 0);
        manager.add_input(peer, input(100));
        manager.add_input(peer, input(200));

        manager.mark_input_processed(peer, 100);
        manager.mark_input_processed(peer, 50);
        manager.cleanup_processed_inputs();

        let session = manager.get(peer).unwrap();
        assert_eq!(session.last_processed_input, 100);
        assert_eq!(session.pending_inputs.len(), 1);
        assert_eq!(manager.get_last_processed_inputs()[&peer], 100);
    }

    #[test]
    fn test_lookups() {
        let mut manager = SessionManager::new();
        let peer = logged_in(&mut manager, 4, 77, 9);
        manager.add_session(PeerId(5));

        assert_eq!(manager.find_by_player(77), Some(peer));
        assert_eq!(manager.find_by_player(78), None);
        assert_eq!(manager.find_by_ship(9), Some(peer));
        assert_eq!(manager.logged_in_peers(), vec![peer]);
        assert_eq!(manager.get(peer).unwrap().username(), Some("pilot77"));
    }
}
