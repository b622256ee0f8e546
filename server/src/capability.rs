//! Capabilities exposed to ship modules
//!
//! Scripted modules never touch the world directly. Every action they can
//! take goes through [`ModuleCapabilities`], which the game implements on the
//! simulation thread and validates like any other untrusted input.

use crate::game::Game;
use crate::world::{EntityId, PlayerId, WORLD_RADIUS};
use shared::protocol::MAX_CHAT_LEN;
use shared::Vec3;
use thiserror::Error;

pub const MAX_SCAN_RADIUS: f32 = 1000.0;
pub const MAX_IMPULSE: f32 = 10_000.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    #[error("entity {0} does not exist")]
    NoSuchEntity(EntityId),

    #[error("entity {0} has no body")]
    NoBody(EntityId),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("message longer than {} bytes", MAX_CHAT_LEN)]
    MessageTooLong,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanHit {
    pub entity: EntityId,
    pub prefab: u32,
    pub owner: Option<PlayerId>,
    pub distance: f32,
}

pub trait ModuleCapabilities {
    /// Applies an instant change of momentum to `entity`.
    fn impulse(&mut self, entity: EntityId, force: Vec3) -> Result<(), CapabilityError>;

    /// Engages the autopilot toward `target`.
    fn move_to_position(&mut self, entity: EntityId, target: Vec3) -> Result<(), CapabilityError>;

    /// Bodies within `radius` of `entity`, nearest first.
    fn scan(&self, entity: EntityId, radius: f32) -> Result<Vec<ScanHit>, CapabilityError>;

    /// Sends a chat line on behalf of `entity`.
    fn broadcast(&mut self, entity: EntityId, text: &str) -> Result<(), CapabilityError>;
}

fn finite(v: &Vec3) -> Result<(), CapabilityError> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(CapabilityError::InvalidArgument("non-finite vector"))
    }
}

impl ModuleCapabilities for Game {
    fn impulse(&mut self, entity: EntityId, force: Vec3) -> Result<(), CapabilityError> {
        finite(&force)?;
        let entity_ref = self.world.get_mut(entity).ok_or(CapabilityError::NoSuchEntity(entity))?;
        let body = entity_ref.body.as_mut().ok_or(CapabilityError::NoBody(entity))?;
        body.apply_impulse(&force.clamp_magnitude(MAX_IMPULSE));
        Ok(())
    }

    fn move_to_position(&mut self, entity: EntityId, target: Vec3) -> Result<(), CapabilityError> {
        finite(&target)?;
        if target.magnitude() > WORLD_RADIUS {
            return Err(CapabilityError::InvalidArgument("target outside the world"));
        }
        let entity_ref = self.world.get_mut(entity).ok_or(CapabilityError::NoSuchEntity(entity))?;
        let body = entity_ref.body.as_mut().ok_or(CapabilityError::NoBody(entity))?;
        body.autopilot = Some(target);
        Ok(())
    }

    fn scan(&self, entity: EntityId, radius: f32) -> Result<Vec<ScanHit>, CapabilityError> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(CapabilityError::InvalidArgument("radius"));
        }
        let origin = self
            .world
            .get(entity)
            .ok_or(CapabilityError::NoSuchEntity(entity))?
            .body
            .as_ref()
            .ok_or(CapabilityError::NoBody(entity))?
            .position;

        Ok(self
            .world
            .scan(origin, radius.min(MAX_SCAN_RADIUS), Some(entity))
            .into_iter()
            .filter_map(|(id, distance)| {
                let hit = self.world.get(id)?;
                Some(ScanHit {
                    entity: id,
                    prefab: hit.prefab,
                    owner: hit.owner,
                    distance,
                })
            })
            .collect())
    }

    fn broadcast(&mut self, entity: EntityId, text: &str) -> Result<(), CapabilityError> {
        if text.len() > MAX_CHAT_LEN {
            return Err(CapabilityError::MessageTooLong);
        }
        let owner = self.world.get(entity).ok_or(CapabilityError::NoSuchEntity(entity))?.owner;
        let sender = owner
            .and_then(|player| self.sessions.find_by_player(player))
            .and_then(|peer| self.sessions.get(peer))
            .and_then(|session| session.username())
            .map(str::to_string)
            .unwrap_or_else(|| format!("entity#{}", entity));
        self.send_chat(&sender, text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::test_support::TestGame;
    use assert_approx_eq::assert_approx_eq;
    use shared::PeerId;

    #[test]
    fn test_impulse_changes_velocity() {
        let mut t = TestGame::new();
        let ship = t.login(PeerId(1), "ada");
        let mass = t.game.world.get(ship).unwrap().body.as_ref().unwrap().mass;

        t.game.impulse(ship, Vec3::new(0.0, mass, 0.0)).unwrap();
        let body = t.game.world.get(ship).unwrap().body.as_ref().unwrap();
        assert_approx_eq!(body.velocity.y, 1.0, 1e-5);
    }

    #[test]
    fn test_invalid_targets_rejected() {
        let mut t = TestGame::new();
        let ship = t.login(PeerId(1), "ada");
        let marker = t.game.world.spawn_static(1, None).unwrap();

        assert_eq!(
            t.game.impulse(999, Vec3::ZERO),
            Err(CapabilityError::NoSuchEntity(999))
        );
        assert_eq!(t.game.impulse(marker, Vec3::ZERO), Err(CapabilityError::NoBody(marker)));
        assert!(t.game.impulse(ship, Vec3::new(f32::INFINITY, 0.0, 0.0)).is_err());
        assert!(t
            .game
            .move_to_position(ship, Vec3::new(WORLD_RADIUS * 2.0, 0.0, 0.0))
            .is_err());
        assert!(t.game.scan(ship, -1.0).is_err());
    }

    #[test]
    fn test_move_to_position_engages_autopilot() {
        let mut t = TestGame::new();
        let ship = t.login(PeerId(1), "ada");
        let target = Vec3::new(10.0, 0.0, 0.0);
        t.game.move_to_position(ship, target).unwrap();
        let body = t.game.world.get(ship).unwrap().body.as_ref().unwrap();
        assert_eq!(body.autopilot, Some(target));
    }

    #[test]
    fn test_scan_excludes_self() {
        let mut t = TestGame::new();
        let ship = t.login(PeerId(1), "ada");
        let origin = t.game.world.get(ship).unwrap().body.as_ref().unwrap().position;
        let near = t.game.world.spawn(1, None, origin.add(&Vec3::new(3.0, 0.0, 0.0))).unwrap();
        t.game.world.spawn(1, None, origin.add(&Vec3::new(900.0, 0.0, 0.0))).unwrap();

        let hits = t.game.scan(ship, 100.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity, near);
        assert_approx_eq!(hits[0].distance, 3.0, 1e-3);
    }

    #[test]
    fn test_broadcast_checks_length() {
        let mut t = TestGame::new();
        let ship = t.login(PeerId(1), "ada");
        assert!(t.game.broadcast(ship, "contact bearing 090").is_ok());
        assert_eq!(
            t.game.broadcast(ship, &"x".repeat(MAX_CHAT_LEN + 1)),
            Err(CapabilityError::MessageTooLong)
        );
    }
}
