//! State broadcast scheduler
//!
//! Tracks which entities were created and deleted since the last flush and
//! how long each body has gone without being replicated. Once per tick
//! [`BroadcastScheduler::build`] turns that into at most one deletion batch,
//! at most one creation batch and a bandwidth-bounded list of deltas that
//! every connection's snapshot shares.

use crate::world::{Entity, EntityId, World};
use fixedbitset::FixedBitSet;
use log::debug;
use shared::protocol::{
    EntityCreate, EntityCreateBatch, EntityDelta, EntityDeleteBatch, Snapshot, MAX_SNAPSHOT_DELTAS,
    SNAPSHOT_PAYLOAD_CEILING,
};
use shared::{Quat, Vec3};
use std::cmp::Reverse;

/// Everything replicated for one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickBroadcast {
    pub deletions: Option<EntityDeleteBatch>,
    pub creations: Option<EntityCreateBatch>,
    pub deltas: Vec<EntityDelta>,
    pub sequence: u32,
}

impl TickBroadcast {
    /// Snapshot for one connection, stamped with its own input acknowledgement.
    pub fn snapshot_for(&self, server_time: u64, last_input_time: u64) -> Snapshot {
        Snapshot {
            sequence: self.sequence,
            server_time,
            last_input_time,
            deltas: self.deltas.clone(),
        }
    }
}

pub struct BroadcastScheduler {
    created: FixedBitSet,
    deleted: FixedBitSet,
    /// Ticks each entity has been withheld from a snapshot, indexed by id
    priorities: Vec<u32>,
    sequence: u32,
    max_deltas: usize,
}

impl Default for BroadcastScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_bit(set: &mut FixedBitSet, index: usize) {
    if index >= set.len() {
        set.grow(index + 1);
    }
    set.insert(index);
}

impl BroadcastScheduler {
    pub fn new() -> Self {
        Self {
            created: FixedBitSet::with_capacity(1024),
            deleted: FixedBitSet::with_capacity(1024),
            priorities: Vec::new(),
            sequence: 0,
            max_deltas: (SNAPSHOT_PAYLOAD_CEILING / EntityDelta::ENCODED_SIZE).min(MAX_SNAPSHOT_DELTAS),
        }
    }

    /// Deltas that fit in one snapshot.
    pub fn max_deltas(&self) -> usize {
        self.max_deltas
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn mark_created(&mut self, id: EntityId) {
        insert_bit(&mut self.created, id as usize);
        self.reset_priority(id);
    }

    /// An id created and deleted before the next flush is simply forgotten.
    pub fn mark_deleted(&mut self, id: EntityId) {
        let index = id as usize;
        if self.created.contains(index) {
            self.created.set(index, false);
        } else {
            insert_bit(&mut self.deleted, index);
        }
        self.reset_priority(id);
    }

    pub fn is_pending_creation(&self, id: EntityId) -> bool {
        self.created.contains(id as usize)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.created.count_ones(..) > 0 || self.deleted.count_ones(..) > 0
    }

    fn reset_priority(&mut self, id: EntityId) {
        if let Some(priority) = self.priorities.get_mut(id as usize) {
            *priority = 0;
        }
    }

    /// Flushes pending creations and deletions and picks this tick's deltas.
    pub fn build(&mut self, world: &World) -> TickBroadcast {
        let deletions = if self.deleted.count_ones(..) > 0 {
            let ids: Vec<u32> = self.deleted.ones().map(|i| i as u32).collect();
            self.deleted.clear();
            Some(EntityDeleteBatch { ids })
        } else {
            None
        };

        let creations = if self.created.count_ones(..) > 0 {
            let entries: Vec<EntityCreate> = self
                .created
                .ones()
                .filter_map(|i| world.get(i as EntityId))
                .map(create_entry)
                .collect();
            self.created.clear();
            (!entries.is_empty()).then_some(EntityCreateBatch { entries })
        } else {
            None
        };

        let mut candidates: Vec<(EntityId, u32)> = Vec::with_capacity(world.len());
        for entity in world.iter().filter(|e| e.body.is_some()) {
            let index = entity.id as usize;
            if index >= self.priorities.len() {
                self.priorities.resize(index + 1, 0);
            }
            let priority = &mut self.priorities[index];
            *priority = priority.saturating_add(1);
            candidates.push((entity.id, *priority));
        }
        candidates.sort_unstable_by_key(|&(id, priority)| (Reverse(priority), id));

        let mut deltas = Vec::with_capacity(self.max_deltas.min(candidates.len()));
        let mut bytes = 0;
        for &(id, _) in &candidates {
            if bytes + EntityDelta::ENCODED_SIZE > SNAPSHOT_PAYLOAD_CEILING || deltas.len() >= self.max_deltas {
                break;
            }
            if let Some(delta) = world.get(id).and_then(delta_entry) {
                bytes += EntityDelta::ENCODED_SIZE;
                deltas.push(delta);
                self.priorities[id as usize] = 0;
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        if deltas.len() < candidates.len() {
            debug!(
                "Snapshot {} carries {} of {} bodies",
                self.sequence,
                deltas.len(),
                candidates.len()
            );
        }

        TickBroadcast {
            deletions,
            creations,
            deltas,
            sequence: self.sequence,
        }
    }

    /// Creation entries for every live entity, for a client joining late.
    /// Entities still pending creation are left to the next flush.
    pub fn full_creation_batch(&self, world: &World) -> EntityCreateBatch {
        EntityCreateBatch {
            entries: world
                .iter()
                .filter(|e| !self.is_pending_creation(e.id))
                .map(create_entry)
                .collect(),
        }
    }
}

fn create_entry(entity: &Entity) -> EntityCreate {
    match &entity.body {
        Some(body) => EntityCreate {
            id: entity.id,
            prefab: entity.prefab,
            position: body.position,
            rotation: body.rotation,
            velocity: body.velocity,
            angular_velocity: body.angular_velocity,
        },
        None => EntityCreate {
            id: entity.id,
            prefab: entity.prefab,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
        },
    }
}

fn delta_entry(entity: &Entity) -> Option<EntityDelta> {
    let body = entity.body.as_ref()?;
    Some(EntityDelta {
        id: entity.id,
        position: body.position,
        rotation: body.rotation,
        velocity: body.velocity,
    })
}
