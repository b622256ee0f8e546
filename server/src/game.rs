//! Game glue: sessions, accounts, chat and replication on the simulation thread
//!
//! [`Game`] owns every piece of mutable game state. Transport events reach it
//! through [`TransportHandler`], decoded client commands through the
//! [`Handler`] implementations the command registry dispatches to, and
//! database results through continuations run by the pipeline's poll. All
//! three happen on the thread that drives the tick, so nothing here locks.

use crate::broadcast::BroadcastScheduler;
use crate::credentials;
use crate::database::{DatabaseHandle, QueryResult, TransactionResult, Value};
use crate::error::DbError;
use crate::session::{LoginState, SessionManager};
use crate::store::{self, AccountRecord};
use crate::transport::{DisconnectKind, ReactorHandle, TransportHandler};
use crate::world::{EntityId, PlayerId, World};
use log::{debug, error, info, warn};
use shared::command::RegistryError;
use shared::protocol::*;
use shared::{CommandRegistry, Handler, Message, PeerId, RegistryBuilder, Vec3};
use std::sync::Arc;
use std::time::Instant;

/// Distance from the origin at which ships enter the world.
const SPAWN_RADIUS: f32 = 50.0;
const SPAWN_SLOTS: u64 = 16;
const MIN_NAME_LEN: usize = 3;

/// Builds the server's command tables: client commands in, server
/// commands out.
pub fn build_registry() -> Result<CommandRegistry<Game>, RegistryError> {
    let builder = RegistryBuilder::new(CLIENT_COMMAND_COUNT, SERVER_COMMAND_COUNT)
        .register_incoming::<Login>("Login")
        .register_incoming::<CreateAccount>("CreateAccount")
        .register_incoming::<PlayerInput>("PlayerInput")
        .register_incoming::<ChatSend>("ChatSend");
    register_server_outgoing(builder).build()
}

/// Deterministic spawn point on a ring around the origin.
pub fn spawn_point(player_id: PlayerId) -> Vec3 {
    let angle = (player_id % SPAWN_SLOTS) as f32 * std::f32::consts::TAU / SPAWN_SLOTS as f32;
    Vec3::new(angle.cos() * SPAWN_RADIUS, 0.0, angle.sin() * SPAWN_RADIUS)
}

pub fn is_valid_username(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub struct Game {
    registry: Arc<CommandRegistry<Game>>,
    reactor: ReactorHandle,
    database: DatabaseHandle<Game>,
    pub world: World,
    pub sessions: SessionManager,
    pub scheduler: BroadcastScheduler,
    started: Instant,
    tick: u64,
}

impl Game {
    pub fn new(
        registry: Arc<CommandRegistry<Game>>,
        reactor: ReactorHandle,
        database: DatabaseHandle<Game>,
        world: World,
    ) -> Self {
        Self {
            registry,
            reactor,
            database,
            world,
            sessions: SessionManager::new(),
            scheduler: BroadcastScheduler::new(),
            started: Instant::now(),
            tick: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Milliseconds since the game started.
    pub fn server_time(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn database(&self) -> &DatabaseHandle<Game> {
        &self.database
    }

    pub fn send<M: Message>(&self, peer: PeerId, message: &M) {
        match self.registry.encode(message) {
            Ok(packet) => self.reactor.send_packet(peer, packet),
            Err(e) => error!("Failed to encode command {} for {}: {}", M::ID, peer, e),
        }
    }

    /// Encodes once and queues a copy for every peer.
    pub fn send_to_all<M: Message>(&self, peers: &[PeerId], message: &M) {
        if peers.is_empty() {
            return;
        }
        match self.registry.encode(message) {
            Ok(packet) => {
                for &peer in peers {
                    self.reactor.send_packet(peer, packet.clone());
                }
            }
            Err(e) => error!("Failed to encode command {}: {}", M::ID, e),
        }
    }

    /// Drops a peer for a protocol violation. Its remaining packets are
    /// ignored until the transport reports the disconnect.
    pub fn kick(&mut self, peer: PeerId, reason: u32) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.kicked = true;
        }
        self.reactor.disconnect(peer, reason, DisconnectKind::Kick);
    }

    /// Sends a chat line to every logged-in session.
    pub fn send_chat(&self, sender: &str, text: &str) {
        let message = ChatBroadcast {
            sender: sender.to_string(),
            text: text.to_string(),
        };
        self.send_to_all(&self.sessions.logged_in_peers(), &message);
    }

    /// Loads the prefab catalog; the result lands on the next database poll.
    pub fn load_prefabs(&self) {
        self.database.execute(store::SELECT_PREFABS, Vec::new(), |game: &mut Game, result| {
            match store::parse_prefabs(&result) {
                Ok(prefabs) => {
                    info!("Loaded {} prefabs", prefabs.len());
                    for prefab in prefabs {
                        game.world.prefabs.insert(prefab);
                    }
                }
                Err(e) => error!("Failed to load prefabs: {}", e),
            }
        });
    }

    fn release_ship(&mut self, ship: Option<EntityId>) {
        if let Some(ship) = ship {
            if self.world.despawn(ship).is_some() {
                self.scheduler.mark_deleted(ship);
            }
        }
    }

    fn finish_login(
        &mut self,
        peer: PeerId,
        generation: u64,
        username: &str,
        password: &str,
        result: QueryResult,
    ) {
        let reason = match self.resolve_login(peer, generation, username, password, &result) {
            Ok(()) => return,
            Err(reason) => reason,
        };
        let Some(session) = self.sessions.get_current_mut(peer, generation) else {
            return;
        };
        session.state = LoginState::Connected;
        self.send(peer, &LoginResult { reason, player_id: 0 });
    }

    fn resolve_login(
        &mut self,
        peer: PeerId,
        generation: u64,
        username: &str,
        password: &str,
        result: &QueryResult,
    ) -> Result<(), LoginReason> {
        match self.sessions.get_current_mut(peer, generation) {
            Some(session) if session.state == LoginState::LoggingIn && !session.kicked => {}
            _ => {
                debug!("Dropping login result for departed {}", peer);
                return Ok(());
            }
        }
        if let Some(e) = &result.error {
            error!("Login lookup for {} failed: {}", peer, e);
            return Err(LoginReason::DatabaseError);
        }
        let Some(row) = result.first() else {
            return Err(LoginReason::InvalidCredentials);
        };
        let record = AccountRecord::from_row(row).map_err(|e| {
            error!("Malformed account row: {}", e);
            LoginReason::DatabaseError
        })?;
        if !credentials::verify_password(password, &record.password_hash, &record.salt) {
            return Err(LoginReason::InvalidCredentials);
        }
        if self.sessions.find_by_player(record.account_id).is_some() {
            return Err(LoginReason::AlreadyLoggedIn);
        }

        let prefab = record.prefab_id.unwrap_or(store::STARTER_PREFAB);
        let ship = self
            .world
            .spawn(prefab, Some(record.account_id), spawn_point(record.account_id))
            .ok_or(LoginReason::ServerFull)?;
        self.scheduler.mark_created(ship);

        let Some(session) = self.sessions.get_mut(peer) else {
            return Ok(());
        };
        session.ship = Some(ship);
        session.state = LoginState::LoggedIn {
            player_id: record.account_id,
            username: username.to_string(),
        };
        info!("{} logged in as {} with ship {}", peer, username, ship);

        self.send(
            peer,
            &LoginResult {
                reason: LoginReason::Success,
                player_id: record.account_id,
            },
        );
        self.send(peer, &ControlEntity { entity_id: ship });
        let batch = self.scheduler.full_creation_batch(&self.world);
        if !batch.entries.is_empty() {
            self.send(peer, &batch);
        }
        Ok(())
    }

    fn finish_create_account(
        &mut self,
        peer: PeerId,
        generation: u64,
        username: &str,
        result: TransactionResult,
    ) {
        let reason = if result.committed {
            info!("Account {} created", username);
            CreateAccountReason::Success
        } else {
            match (result.failed_at(), result.error()) {
                // Position 1 is the account insert itself.
                (Some(1), Some(DbError::Constraint(_))) => CreateAccountReason::NameTaken,
                (_, error) => {
                    error!("Creating account {} failed: {:?}", username, error);
                    CreateAccountReason::DatabaseError
                }
            }
        };
        if self.sessions.get_current_mut(peer, generation).is_some() {
            self.send(peer, &CreateAccountResult { reason });
        }
    }

    /// Applies buffered inputs in timestamp order.
    pub fn apply_inputs(&mut self) {
        for (peer, input) in self.sessions.get_chronological_inputs() {
            let Some(ship) = self
                .sessions
                .get(peer)
                .filter(|s| !s.kicked)
                .and_then(|s| s.ship)
            else {
                continue;
            };
            if !(input.thrust.is_finite() && input.torque.is_finite()) {
                warn!("Non-finite input from {}", peer);
                self.kick(peer, DISCONNECT_PROTOCOL_VIOLATION);
                continue;
            }
            self.world.set_controls(ship, input.thrust, input.torque);
            self.sessions.mark_input_processed(peer, input.timestamp);
        }
        self.sessions.cleanup_processed_inputs();
    }

    pub fn simulate(&mut self, dt: f32) {
        self.world.step(dt);
        self.tick += 1;
    }

    /// Flushes creations, deletions and this tick's snapshot to every
    /// logged-in session.
    pub fn replicate(&mut self) {
        let tick = self.scheduler.build(&self.world);
        let peers = self.sessions.logged_in_peers();
        if peers.is_empty() {
            return;
        }

        if let Some(deletions) = &tick.deletions {
            self.send_to_all(&peers, deletions);
        }
        if let Some(creations) = &tick.creations {
            self.send_to_all(&peers, creations);
        }

        let server_time = self.server_time();
        for peer in peers {
            let last_input = self.sessions.get(peer).map_or(0, |s| s.last_processed_input);
            self.send(peer, &tick.snapshot_for(server_time, last_input));
        }
    }

    /// Asks the transport for fresh round-trip times.
    pub fn refresh_peer_info(&self) {
        for peer in self.sessions.logged_in_peers() {
            self.reactor.query_info(peer);
        }
    }
}

impl TransportHandler for Game {
    fn on_connect(&mut self, peer: PeerId, _outgoing: bool, data: u32) {
        if data != PROTOCOL_VERSION {
            warn!(
                "{} speaks protocol {}, expected {}",
                peer, data, PROTOCOL_VERSION
            );
            self.reactor
                .disconnect(peer, DISCONNECT_VERSION_MISMATCH, DisconnectKind::Kick);
            return;
        }
        if !self.sessions.add_session(peer) {
            warn!("{} connected twice", peer);
        }
    }

    fn on_disconnect(&mut self, peer: PeerId, data: u32) {
        let Some(session) = self.sessions.remove_session(peer) else {
            debug!("Disconnect from {} without a session ({})", peer, data);
            return;
        };
        if let Some(username) = session.username() {
            info!("{} ({}) left", username, peer);
        }
        self.release_ship(session.ship);
    }

    fn on_packet(&mut self, peer: PeerId, channel: u8, bytes: Vec<u8>) {
        match self.sessions.get(peer) {
            Some(session) if !session.kicked => {}
            _ => return,
        }
        let registry = Arc::clone(&self.registry);
        if let Err(e) = registry.dispatch(self, peer, &bytes) {
            warn!(
                "Protocol violation from {} on channel {}: {}",
                peer, channel, e
            );
            self.kick(peer, DISCONNECT_PROTOCOL_VIOLATION);
        }
    }

    fn on_peer_info(&mut self, peer: PeerId, ping: u32, _idle: u32) {
        self.sessions.update_ping(peer, ping);
    }
}

impl Handler<Login> for Game {
    fn handle(&mut self, peer: PeerId, message: Login) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.state != LoginState::Connected {
            let player_id = session.player_id().unwrap_or(0);
            self.send(
                peer,
                &LoginResult {
                    reason: LoginReason::AlreadyLoggedIn,
                    player_id,
                },
            );
            return;
        }
        session.state = LoginState::LoggingIn;
        let generation = session.generation;

        let Login { username, password } = message;
        self.database.execute(
            store::ACCOUNT_BY_NAME,
            vec![Value::from(username.as_str())],
            move |game: &mut Game, result| {
                game.finish_login(peer, generation, &username, &password, result)
            },
        );
    }
}

impl Handler<CreateAccount> for Game {
    fn handle(&mut self, peer: PeerId, message: CreateAccount) {
        let Some(generation) = self.sessions.get(peer).map(|s| s.generation) else {
            return;
        };
        if !is_valid_username(&message.username) || message.password.is_empty() {
            self.send(
                peer,
                &CreateAccountResult {
                    reason: CreateAccountReason::InvalidName,
                },
            );
            return;
        }

        let password = credentials::hash_password(&message.password);
        let username = message.username;
        self.database.execute_transaction(
            store::create_account(&username, &password),
            move |game: &mut Game, result| {
                game.finish_create_account(peer, generation, &username, result)
            },
        );
    }
}

impl Handler<PlayerInput> for Game {
    fn handle(&mut self, peer: PeerId, message: PlayerInput) {
        if !self.sessions.add_input(peer, message) {
            debug!("Ignored input from {}", peer);
        }
    }
}

impl Handler<ChatSend> for Game {
    fn handle(&mut self, peer: PeerId, message: ChatSend) {
        let Some(sender) = self.sessions.get(peer).and_then(|s| s.username()).map(str::to_string) else {
            debug!("Chat from {} before login", peer);
            return;
        };
        let text = message.text.trim();
        if text.is_empty() {
            return;
        }
        self.send_chat(&sender, text);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::TestGame;
    use super::*;

    #[test]
    fn test_registry_covers_catalog() {
        let registry = build_registry().unwrap();
        assert_eq!(registry.incoming_capacity(), CLIENT_COMMAND_COUNT);
        assert_eq!(registry.incoming_name(Login::ID), Some("Login"));
        assert!(registry.encode(&Snapshot::default()).is_ok());
    }

    #[test]
    fn test_username_rules() {
        assert!(is_valid_username("ada_99"));
        assert!(!is_valid_username("ab"));
        assert!(!is_valid_username("white space"));
        assert!(!is_valid_username(&"x".repeat(MAX_NAME_LEN + 1)));
    }

    #[test]
    fn test_spawn_points_on_ring() {
        let a = spawn_point(1);
        let b = spawn_point(2);
        assert!((a.magnitude() - SPAWN_RADIUS).abs() < 1e-3);
        assert!(a.distance(&b) > 1.0);
    }

    #[test]
    fn test_prefabs_loaded() {
        let t = TestGame::new();
        assert_eq!(t.game.world.prefabs.len(), 3);
    }

    #[test]
    fn test_version_mismatch_opens_no_session() {
        let mut t = TestGame::new();
        t.game.on_connect(PeerId(1), false, PROTOCOL_VERSION + 1);
        assert!(t.game.sessions.is_empty());
    }

    #[test]
    fn test_create_account_and_login_spawns_ship() {
        let mut t = TestGame::new();
        let peer = PeerId(2);
        let ship = t.login(peer, "ada");

        let session = t.game.sessions.get(peer).unwrap();
        assert!(session.is_logged_in());
        assert_eq!(session.username(), Some("ada"));
        let entity = t.game.world.get(ship).unwrap();
        assert_eq!(entity.prefab, store::STARTER_PREFAB);
        assert_eq!(entity.owner, session.player_id());
        assert!(t.game.scheduler.is_pending_creation(ship));
    }

    #[test]
    fn test_wrong_password_resets_state() {
        let mut t = TestGame::new();
        let peer = PeerId(2);
        t.login(peer, "ada");

        let other = PeerId(3);
        t.game.on_connect(other, false, PROTOCOL_VERSION);
        t.game.handle(
            other,
            Login {
                username: "ada".to_string(),
                password: "wrong".to_string(),
            },
        );
        t.settle();
        assert_eq!(t.game.sessions.get(other).unwrap().state, LoginState::Connected);
        assert_eq!(t.game.world.len(), 1);
    }

    #[test]
    fn test_second_login_of_same_account_refused() {
        let mut t = TestGame::new();
        t.login(PeerId(2), "ada");

        let other = PeerId(3);
        t.game.on_connect(other, false, PROTOCOL_VERSION);
        t.game.handle(
            other,
            Login {
                username: "ada".to_string(),
                password: "secret".to_string(),
            },
        );
        t.settle();
        assert!(!t.game.sessions.get(other).unwrap().is_logged_in());
        assert_eq!(t.game.world.len(), 1);
    }

    #[test]
    fn test_login_result_after_disconnect_is_dropped() {
        let mut t = TestGame::new();
        let peer = PeerId(2);
        t.login(peer, "ada");
        t.game.on_disconnect(peer, 0);

        let late = PeerId(4);
        t.game.on_connect(late, false, PROTOCOL_VERSION);
        t.game.handle(
            late,
            Login {
                username: "ada".to_string(),
                password: "secret".to_string(),
            },
        );
        t.game.on_disconnect(late, 0);
        t.settle();
        assert!(t.game.world.is_empty());
    }

    #[test]
    fn test_login_result_not_applied_to_reused_peer_id() {
        let mut t = TestGame::new();
        t.login(PeerId(2), "ada");
        t.game.on_disconnect(PeerId(2), 0);

        // The first occupant asks with valid credentials and leaves before
        // the lookup returns; the next occupant of the slot sends bad ones.
        let peer = PeerId(5);
        t.game.on_connect(peer, false, PROTOCOL_VERSION);
        t.game.handle(
            peer,
            Login {
                username: "ada".to_string(),
                password: "secret".to_string(),
            },
        );
        t.game.on_disconnect(peer, 0);
        t.game.on_connect(peer, false, PROTOCOL_VERSION);
        t.game.handle(
            peer,
            Login {
                username: "mallory".to_string(),
                password: "wrong".to_string(),
            },
        );
        t.settle();

        let session = t.game.sessions.get(peer).unwrap();
        assert_eq!(session.state, LoginState::Connected);
        assert_eq!(session.username(), None);
        assert_eq!(session.ship, None);
        assert!(t.game.world.is_empty());
    }

    #[test]
    fn test_disconnect_releases_ship_once() {
        let mut t = TestGame::new();
        let peer = PeerId(2);
        let ship = t.login(peer, "ada");
        t.game.replicate();

        t.game.on_disconnect(peer, 0);
        t.game.on_disconnect(peer, 0);
        assert!(t.game.world.get(ship).is_none());

        let tick = t.game.scheduler.build(&t.game.world);
        assert_eq!(tick.deletions.unwrap().ids, vec![ship]);
    }

    #[test]
    fn test_malformed_packet_kicks() {
        let mut t = TestGame::new();
        let peer = PeerId(2);
        t.game.on_connect(peer, false, PROTOCOL_VERSION);
        t.game.on_packet(peer, CHANNEL_SESSION, vec![200]);
        assert!(t.game.sessions.get(peer).unwrap().kicked);

        // Further packets are ignored until the disconnect arrives.
        let bytes = shared::command::encode_message(&ChatSend { text: "hi".into() }).unwrap();
        t.game.on_packet(peer, CHANNEL_SESSION, bytes);
        t.game.on_disconnect(peer, DISCONNECT_PROTOCOL_VIOLATION);
        assert!(t.game.sessions.is_empty());
    }

    #[test]
    fn test_inputs_steer_ship() {
        let mut t = TestGame::new();
        let peer = PeerId(2);
        let ship = t.login(peer, "ada");

        let bytes = shared::command::encode_message(&PlayerInput {
            timestamp: 10,
            thrust: Vec3::new(1.0, 0.0, 0.0),
            torque: Vec3::ZERO,
        })
        .unwrap();
        t.game.on_packet(peer, CHANNEL_SNAPSHOT, bytes);
        t.game.apply_inputs();
        t.game.simulate(0.1);

        let body = t.game.world.get(ship).unwrap().body.as_ref().unwrap();
        assert!(body.velocity.x > 0.0);
        assert_eq!(t.game.sessions.get(peer).unwrap().last_processed_input, 10);
        assert!(t.game.sessions.get(peer).unwrap().pending_inputs.is_empty());
    }

    #[test]
    fn test_non_finite_input_kicks() {
        let mut t = TestGame::new();
        let peer = PeerId(2);
        t.login(peer, "ada");
        t.game.handle(
            peer,
            PlayerInput {
                timestamp: 1,
                thrust: Vec3::new(f32::NAN, 0.0, 0.0),
                torque: Vec3::ZERO,
            },
        );
        t.game.apply_inputs();
        assert!(t.game.sessions.get(peer).unwrap().kicked);
    }

    #[test]
    fn test_inputs_after_kick_are_not_applied() {
        let mut t = TestGame::new();
        let peer = PeerId(2);
        let ship = t.login(peer, "ada");
        t.game.handle(
            peer,
            PlayerInput {
                timestamp: 1,
                thrust: Vec3::new(f32::INFINITY, 0.0, 0.0),
                torque: Vec3::ZERO,
            },
        );
        t.game.handle(
            peer,
            PlayerInput {
                timestamp: 2,
                thrust: Vec3::new(1.0, 0.0, 0.0),
                torque: Vec3::ZERO,
            },
        );
        t.game.apply_inputs();

        let session = t.game.sessions.get(peer).unwrap();
        assert!(session.kicked);
        assert_eq!(session.last_processed_input, 0);
        let body = t.game.world.get(ship).unwrap().body.as_ref().unwrap();
        assert_eq!(body.thrust, Vec3::ZERO);
    }

    #[test]
    fn test_duplicate_account_keeps_first() {
        let mut t = TestGame::new();
        t.login(PeerId(2), "ada");
        let other = PeerId(3);
        t.game.on_connect(other, false, PROTOCOL_VERSION);
        t.game.handle(
            other,
            CreateAccount {
                username: "ada".to_string(),
                password: "other".to_string(),
            },
        );
        t.settle();
        t.game.handle(
            other,
            Login {
                username: "ada".to_string(),
                password: "other".to_string(),
            },
        );
        t.settle();
        assert!(!t.game.sessions.get(other).unwrap().is_logged_in());
    }
}
