//! Entity arena and the minimal rigid-body integrator
//!
//! Entities live in an index-addressed arena; an entity's id is its slot
//! index, so ids stay dense and are reused after despawn. Relations such as
//! ownership are stored as ids, never references.

use log::{debug, info};
use shared::{Quat, Vec3};
use std::collections::HashMap;

pub type EntityId = u32;
pub type PlayerId = u64;

/// Ships never leave this sphere around the origin.
pub const WORLD_RADIUS: f32 = 10_000.0;
/// Autopilot considers a target reached within this distance.
pub const ARRIVAL_RADIUS: f32 = 1.0;
const LINEAR_DAMPING: f32 = 0.1;
const ANGULAR_DAMPING: f32 = 0.5;

/// A ship class loaded from reference data.
#[derive(Debug, Clone, PartialEq)]
pub struct Prefab {
    pub id: u32,
    pub name: String,
    pub mass: f32,
    pub max_thrust: f32,
}

impl Prefab {
    /// Used when an entity references a prefab missing from the catalog.
    pub fn fallback(id: u32) -> Self {
        Self {
            id,
            name: format!("prefab#{}", id),
            mass: 1.0,
            max_thrust: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrefabCatalog {
    prefabs: HashMap<u32, Prefab>,
}

impl PrefabCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prefab: Prefab) {
        self.prefabs.insert(prefab.id, prefab);
    }

    pub fn get(&self, id: u32) -> Option<&Prefab> {
        self.prefabs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.prefabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefabs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub mass: f32,
    pub max_thrust: f32,
    /// Thrust requested for the next step, in units of `max_thrust`.
    pub thrust: Vec3,
    /// Angular acceleration requested for the next step.
    pub torque: Vec3,
    pub autopilot: Option<Vec3>,
}

impl Body {
    pub fn new(position: Vec3, prefab: &Prefab) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            mass: prefab.mass.max(f32::EPSILON),
            max_thrust: prefab.max_thrust,
            thrust: Vec3::ZERO,
            torque: Vec3::ZERO,
            autopilot: None,
        }
    }

    /// Instant change of momentum.
    pub fn apply_impulse(&mut self, impulse: &Vec3) {
        self.velocity = self.velocity.add(&impulse.scale(1.0 / self.mass));
    }

    /// Advances the body by `dt` seconds.
    pub fn integrate(&mut self, dt: f32) {
        if let Some(target) = self.autopilot {
            let offset = target.sub(&self.position);
            if offset.magnitude() <= ARRIVAL_RADIUS {
                self.autopilot = None;
                self.velocity = Vec3::ZERO;
                self.thrust = Vec3::ZERO;
            } else {
                // Full thrust toward the target, minus the current drift.
                let desired = offset.normalize().scale(self.max_thrust / self.mass);
                self.thrust = desired.sub(&self.velocity).clamp_magnitude(1.0);
            }
        }

        let acceleration = self.thrust.clamp_magnitude(1.0).scale(self.max_thrust / self.mass);
        self.velocity = self.velocity.add(&acceleration.scale(dt));
        self.velocity = self.velocity.scale((1.0 - LINEAR_DAMPING * dt).max(0.0));
        self.position = self.position.add(&self.velocity.scale(dt));

        self.angular_velocity = self.angular_velocity.add(&self.torque.scale(dt));
        self.angular_velocity = self.angular_velocity.scale((1.0 - ANGULAR_DAMPING * dt).max(0.0));
        self.rotation = self.rotation.integrate(&self.angular_velocity, dt);

        // Keep ships inside the world bounds
        if self.position.magnitude() > WORLD_RADIUS {
            self.position = self.position.clamp_magnitude(WORLD_RADIUS);
            self.velocity = Vec3::ZERO;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub prefab: u32,
    pub owner: Option<PlayerId>,
    pub body: Option<Body>,
}

/// Arena of entities with a free list for slot reuse.
pub struct World {
    entities: Vec<Option<Entity>>,
    free: Vec<EntityId>,
    live: usize,
    max_entities: usize,
    pub prefabs: PrefabCatalog,
}

impl World {
    pub fn new(max_entities: usize) -> Self {
        Self {
            entities: Vec::new(),
            free: Vec::new(),
            live: 0,
            max_entities,
            prefabs: PrefabCatalog::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn max_entities(&self) -> usize {
        self.max_entities
    }

    /// Spawns an entity with a physical body. `None` when the arena is full.
    pub fn spawn(&mut self, prefab: u32, owner: Option<PlayerId>, position: Vec3) -> Option<EntityId> {
        let body = match self.prefabs.get(prefab) {
            Some(p) => Body::new(position, p),
            None => Body::new(position, &Prefab::fallback(prefab)),
        };
        self.insert(prefab, owner, Some(body))
    }

    /// Spawns an entity without a body, e.g. a marker that never moves.
    pub fn spawn_static(&mut self, prefab: u32, owner: Option<PlayerId>) -> Option<EntityId> {
        self.insert(prefab, owner, None)
    }

    fn insert(&mut self, prefab: u32, owner: Option<PlayerId>, body: Option<Body>) -> Option<EntityId> {
        let id = match self.free.pop() {
            Some(id) => id,
            None if self.entities.len() < self.max_entities => {
                self.entities.push(None);
                (self.entities.len() - 1) as EntityId
            }
            None => {
                info!("World full, cannot spawn prefab {}", prefab);
                return None;
            }
        };
        self.entities[id as usize] = Some(Entity {
            id,
            prefab,
            owner,
            body,
        });
        self.live += 1;
        debug!("Spawned entity {} (prefab {})", id, prefab);
        Some(id)
    }

    pub fn despawn(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.get_mut(id as usize)?.take()?;
        self.free.push(id);
        self.live -= 1;
        debug!("Despawned entity {}", id);
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id as usize)?.as_mut()
    }

    pub fn body_mut(&mut self, id: EntityId) -> Option<&mut Body> {
        self.get_mut(id)?.body.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().flatten()
    }

    /// Sets the pilot controls of a ship and cancels any autopilot.
    pub fn set_controls(&mut self, id: EntityId, thrust: Vec3, torque: Vec3) -> bool {
        match self.body_mut(id) {
            Some(body) => {
                body.thrust = thrust.clamp_magnitude(1.0);
                body.torque = torque;
                body.autopilot = None;
                true
            }
            None => false,
        }
    }

    pub fn step(&mut self, dt: f32) {
        for body in self.entities.iter_mut().flatten().filter_map(|e| e.body.as_mut()) {
            body.integrate(dt);
        }
    }

    /// Bodies within `radius` of `origin`, nearest first, excluding `exclude`.
    pub fn scan(&self, origin: Vec3, radius: f32, exclude: Option<EntityId>) -> Vec<(EntityId, f32)> {
        let mut hits: Vec<(EntityId, f32)> = self
            .iter()
            .filter(|e| Some(e.id) != exclude)
            .filter_map(|e| {
                let body = e.body.as_ref()?;
                let distance = body.position.distance(&origin);
                (distance <= radius).then_some((e.id, distance))
            })
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits
    }
}
