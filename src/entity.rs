// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entity identifiers and location metadata.

use serde::{Deserialize, Serialize};

use crate::archetype::ArchetypeId;

/// Entity handle: slot index plus the version the slot held when the handle was issued.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    bytemuck::Pod,
    bytemuck::Zeroable,
)]
#[repr(C)]
pub struct Entity {
    pub index: u32,
    pub version: u32,
}

impl Entity {
    /// Handle that never resolves (version 0 is never issued).
    pub const NULL: Entity = Entity {
        index: u32::MAX,
        version: 0,
    };

    pub fn is_null(self) -> bool {
        self.version == 0
    }
}

/// Entity location in storage (archetype, chunk slot within the archetype, row)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub chunk: u32,
    pub row: u32,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    version: u32,
    location: Option<EntityLocation>,
}

/// Entity → location indirection with LIFO slot recycling.
///
/// Every created handle is stamped with the store's current version, and every removal
/// batch advances that version, so a recycled index never reissues an older version.
#[derive(Debug)]
pub struct EntityStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    version: u32,
    alive: usize,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            version: 1,
            alive: 0,
        }
    }

    /// Allocate `count` handles. Free slots are reused (most recently freed first) before
    /// the slot table grows. Locations are filled in later by `set_location`.
    pub fn create(&mut self, count: usize, out: &mut Vec<Entity>) {
        out.reserve(count);
        let version = self.version;
        let mut remaining = count;

        while remaining > 0 {
            let Some(index) = self.free.pop() else { break };
            let slot = &mut self.slots[index as usize];
            slot.version = version;
            slot.location = None;
            out.push(Entity { index, version });
            remaining -= 1;
        }

        self.slots.reserve(remaining);
        for _ in 0..remaining {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                version,
                location: None,
            });
            out.push(Entity { index, version });
        }

        self.alive += count;
    }

    /// Location of a live handle; `None` for dead, stale or foreign handles.
    #[inline]
    pub fn resolve(&self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.slots.get(entity.index as usize)?;
        if slot.version != entity.version {
            return None;
        }
        slot.location
    }

    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.resolve(entity).is_some()
    }

    /// Record where a live handle's row now lives.
    #[inline]
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        let slot = &mut self.slots[entity.index as usize];
        debug_assert_eq!(slot.version, entity.version);
        slot.location = Some(location);
    }

    /// Patch only the chunk slot of a live handle (used when chunks are compacted).
    #[inline]
    pub fn set_chunk(&mut self, entity: Entity, chunk: u32) {
        if let Some(location) = self.slots[entity.index as usize].location.as_mut() {
            location.chunk = chunk;
        }
    }

    /// Free a batch of handles. Dead handles in the batch are ignored.
    /// Returns the number of slots actually freed.
    pub fn remove(&mut self, entities: &[Entity]) -> usize {
        let mut live: Vec<Entity> = Vec::with_capacity(entities.len());
        for &entity in entities {
            if self.resolve(entity).is_some() {
                self.detach(entity);
                live.push(entity);
            }
        }
        self.release(&live);
        live.len()
    }

    /// Make a live handle unresolvable without freeing its slot yet.
    #[inline]
    pub(crate) fn detach(&mut self, entity: Entity) {
        let slot = &mut self.slots[entity.index as usize];
        debug_assert_eq!(slot.version, entity.version);
        slot.location = None;
    }

    /// Free the slots of detached handles and advance the version once for the batch.
    pub(crate) fn release(&mut self, entities: &[Entity]) {
        if entities.is_empty() {
            return;
        }
        self.free.extend(entities.iter().map(|e| e.index));
        self.alive -= entities.len();
        self.version = self.version.wrapping_add(1).max(1);
        self.truncate_tail();
    }

    /// Drop free slots that sit at the end of the table.
    fn truncate_tail(&mut self) {
        let before = self.slots.len();
        while self.slots.last().is_some_and(|slot| slot.location.is_none()) {
            self.slots.pop();
        }
        if self.slots.len() != before {
            let len = self.slots.len() as u32;
            self.free.retain(|&index| index < len);
        }
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.alive
    }

    pub fn is_empty(&self) -> bool {
        self.alive == 0
    }

    /// Number of recyclable slots
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Size of the slot table
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Current stamping version
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.alive = 0;
        self.version = self.version.wrapping_add(1).max(1);
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(store: &mut EntityStore, entities: &[Entity]) {
        for (row, &e) in entities.iter().enumerate() {
            store.set_location(
                e,
                EntityLocation {
                    archetype: ArchetypeId(0),
                    chunk: 0,
                    row: row as u32,
                },
            );
        }
    }

    #[test]
    fn test_create_distinct() {
        let mut store = EntityStore::new();
        let mut out = Vec::new();
        store.create(100, &mut out);
        place(&mut store, &out);

        let mut indices: Vec<u32> = out.iter().map(|e| e.index).collect();
        indices.dedup();
        assert_eq!(indices.len(), 100);
        assert!(out.iter().all(|&e| store.is_alive(e)));
    }

    #[test]
    fn test_recycle_changes_version() {
        let mut store = EntityStore::new();
        let mut out = Vec::new();
        store.create(3, &mut out);
        place(&mut store, &out);

        assert_eq!(store.remove(&[out[1]]), 1);
        assert!(store.resolve(out[1]).is_none());

        let mut again = Vec::new();
        store.create(1, &mut again);
        assert_eq!(again[0].index, out[1].index);
        assert_ne!(again[0].version, out[1].version);
        assert!(store.resolve(out[1]).is_none());
    }

    #[test]
    fn test_lifo_recycling() {
        let mut store = EntityStore::new();
        let mut out = Vec::new();
        store.create(4, &mut out);
        place(&mut store, &out);

        store.remove(&[out[0]]);
        store.remove(&[out[1]]);

        let mut again = Vec::new();
        store.create(2, &mut again);
        assert_eq!(again[0].index, out[1].index);
        assert_eq!(again[1].index, out[0].index);
    }

    #[test]
    fn test_tail_truncation_keeps_versions_fresh() {
        let mut store = EntityStore::new();
        let mut out = Vec::new();
        store.create(3, &mut out);
        place(&mut store, &out);

        store.remove(&[out[2], out[1]]);
        assert_eq!(store.slot_count(), 1);
        assert_eq!(store.free_count(), 0);

        let mut again = Vec::new();
        store.create(1, &mut again);
        assert_eq!(again[0].index, 1);
        assert!(again[0].version > out[1].version);
    }

    #[test]
    fn test_remove_ignores_dead() {
        let mut store = EntityStore::new();
        let mut out = Vec::new();
        store.create(2, &mut out);
        place(&mut store, &out);

        assert_eq!(store.remove(&[out[0], out[0], Entity::NULL]), 1);
        assert_eq!(store.len(), 1);
    }
}
