//! Server assembly and the fixed-rate tick loop

use crate::config::ServerConfig;
use crate::database::{Database, DatabaseConfig};
use crate::error::ServerError;
use crate::game::{self, Game};
use crate::store;
use crate::transport::{Reactor, ReactorConfig};
use crate::world::World;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cap the maximum delta time to 50ms
const MAX_DELTA_TIME: f32 = 1.0 / 20.0;
/// Ticks between peer info refreshes and statistics lines.
const STATS_INTERVAL: u64 = 60;

/// Transport, database and game state driven by one thread.
pub struct Server {
    game: Game,
    reactor: Reactor,
    database: Database<Game>,
    tick_duration: Duration,
}

impl Server {
    /// Starts every component and waits for the database to become ready
    /// and the prefab catalog to load before returning.
    pub fn start(config: &ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let registry = Arc::new(game::build_registry()?);

        let database = Database::start(
            store::connector(&config.database.path),
            store::statements(),
            DatabaseConfig {
                workers: config.database.workers,
                queue_capacity: config.database.queue_capacity,
                reconnect_backoff: config.database.reconnect_backoff(),
                ..DatabaseConfig::default()
            },
        )?;

        let reactor = Reactor::new(ReactorConfig::new(
            config.bind_addr()?,
            config.peer_base_id,
            config.max_peers,
        ))?;
        info!("Server listening on {}", reactor.local_addr());

        let mut game = Game::new(
            registry,
            reactor.handle(),
            database.handle(),
            World::new(config.max_entities),
        );

        let timeout = config.database.startup_timeout();
        if !database.wait_idle(&mut game, timeout) {
            return Err(ServerError::Startup(format!(
                "{} of {} database workers connected after {:?}",
                database.connected_workers(),
                config.database.workers,
                timeout
            )));
        }
        game.load_prefabs();
        if !database.wait_idle(&mut game, timeout) || game.world.prefabs.is_empty() {
            return Err(ServerError::Startup("prefab catalog did not load".to_string()));
        }

        Ok(Self {
            game,
            reactor,
            database,
            tick_duration: config.tick_duration(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.reactor.local_addr()
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut Game {
        &mut self.game
    }

    /// One simulation step: network events, database results, inputs,
    /// physics, replication.
    pub fn tick(&mut self, dt: f32) {
        self.reactor.poll(&mut self.game);
        self.database.poll(&mut self.game);
        self.game.apply_inputs();
        self.game.simulate(dt);
        self.game.replicate();

        let tick = self.game.tick();
        if tick % STATS_INTERVAL == 0 {
            self.game.refresh_peer_info();
            if !self.game.sessions.is_empty() {
                debug!(
                    "Tick {}: {} sessions, {} entities, {:.1}Hz, {} database requests outstanding",
                    tick,
                    self.game.sessions.len(),
                    self.game.world.len(),
                    1.0 / dt.max(f32::EPSILON),
                    self.database.outstanding()
                );
            }
        }
    }

    /// Ticks at the configured rate until `running` is cleared.
    pub fn run(&mut self, running: &AtomicBool) {
        info!("Server started successfully");
        let mut last_update = Instant::now();
        let mut next_tick = last_update + self.tick_duration;

        while running.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < next_tick {
                std::thread::sleep(next_tick - now);
            }
            next_tick += self.tick_duration;
            // Skip missed ticks instead of bursting to catch up.
            let now = Instant::now();
            if next_tick < now {
                next_tick = now + self.tick_duration;
            }

            let mut delta_time = (now - last_update).as_secs_f32();
            last_update = now;
            if delta_time > MAX_DELTA_TIME {
                warn!(
                    "Large delta time detected ({:.3}s), capping to {:.3}s",
                    delta_time, MAX_DELTA_TIME
                );
                delta_time = MAX_DELTA_TIME;
            }

            self.tick(delta_time);
        }
        info!("Server shutting down after {} ticks", self.game.tick());
    }

    /// Stops the reactor (notifying peers) and then the database workers.
    pub fn shutdown(self) {
        let Server {
            game,
            reactor,
            database,
            ..
        } = self;
        reactor.shutdown();
        drop(game);
        drop(database);
    }
}
