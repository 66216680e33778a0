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

//! Snapshot / restore of every live entity
//!
//! The stream is an internal format with no stability promise across builds: a type table
//! (name hash, name, size) followed by one block per non-empty archetype holding its type
//! indices, entity count and one packed byte array per component type. Entity handles are
//! not stored; `restore` creates fresh entities and returns them in stream order.

use rustc_hash::FxHashMap;
use speedy::{Readable, Writable};
#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::ArchetypeId;
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::manager::EntityManager;
use crate::type_registry::ComponentTypeId;

const SNAPSHOT_MAGIC: u32 = 0x4345_4b53; // "SKEC"
const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Readable, Writable)]
struct SnapshotStream {
    magic: u32,
    format: u32,
    types: Vec<SnapshotType>,
    archetypes: Vec<SnapshotArchetype>,
}

#[derive(Debug, Readable, Writable)]
struct SnapshotType {
    stable_hash: u64,
    name: String,
    size: u32,
}

#[derive(Debug, Readable, Writable)]
struct SnapshotArchetype {
    /// Indices into the type table, anchor excluded
    types: Vec<u32>,
    count: u32,
    /// One `count * size` array per entry of `types`
    columns: Vec<Vec<u8>>,
}

/// An archetype block resolved against the target manager
struct RestorePlan<'a> {
    archetype: ArchetypeId,
    count: usize,
    columns: Vec<(ComponentTypeId, usize, &'a [u8])>,
}

impl EntityManager {
    /// Serialize every live entity's component values.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        #[cfg(feature = "profiling")]
        let span = info_span!("manager.snapshot", entities = self.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let mut stream = SnapshotStream {
            magic: SNAPSHOT_MAGIC,
            format: SNAPSHOT_FORMAT,
            types: Vec::new(),
            archetypes: Vec::new(),
        };
        let mut table: FxHashMap<ComponentTypeId, u32> = FxHashMap::default();

        for id in self.matching_archetypes(self.universal_query())? {
            let archetype = self.archetype(id)?;
            if archetype.is_empty() {
                continue;
            }
            let layout = archetype.layout();
            let mut block = SnapshotArchetype {
                types: Vec::with_capacity(layout.column_count() - 1),
                count: archetype.len() as u32,
                columns: Vec::with_capacity(layout.column_count() - 1),
            };
            for (column, &type_id) in layout.types().iter().enumerate().skip(1) {
                let index = match table.get(&type_id) {
                    Some(&index) => index,
                    None => {
                        let info = self
                            .registry()
                            .info(type_id)
                            .ok_or(EcsError::ComponentNotRegistered("<unknown component id>"))?;
                        let index = stream.types.len() as u32;
                        stream.types.push(SnapshotType {
                            stable_hash: info.stable_hash,
                            name: info.name.to_string(),
                            size: info.size as u32,
                        });
                        table.insert(type_id, index);
                        index
                    }
                };
                block.types.push(index);

                let mut bytes = Vec::with_capacity(archetype.len() * layout.size_at(column));
                for chunk in archetype.chunks() {
                    bytes.extend_from_slice(chunk.column(layout, column));
                }
                block.columns.push(bytes);
            }
            stream.archetypes.push(block);
        }

        stream
            .write_to_vec()
            .map_err(|e| EcsError::SerializationError(e.to_string()))
    }

    /// Recreate the entities of a snapshot in this manager.
    ///
    /// Every component type in the stream must already be registered here, matched by a hash
    /// of the type name. The stream is fully validated before any entity is created.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<Vec<Entity>> {
        #[cfg(feature = "profiling")]
        let span = info_span!("manager.restore", bytes = bytes.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let stream = SnapshotStream::read_from_buffer(bytes)
            .map_err(|e| EcsError::DeserializationError(e.to_string()))?;
        if stream.magic != SNAPSHOT_MAGIC || stream.format != SNAPSHOT_FORMAT {
            return Err(EcsError::DeserializationError(format!(
                "not a snapshot stream (magic {:#x}, format {})",
                stream.magic, stream.format
            )));
        }

        let mut types = Vec::with_capacity(stream.types.len());
        for entry in &stream.types {
            let id = self.registry().id_by_stable_hash(entry.stable_hash).ok_or_else(|| {
                EcsError::DeserializationError(format!("unknown component type {}", entry.name))
            })?;
            let size = self.registry().info(id).map_or(0, |info| info.size);
            if size != entry.size as usize {
                return Err(EcsError::DeserializationError(format!(
                    "component {} is {} bytes here, {} in the stream",
                    entry.name, size, entry.size
                )));
            }
            types.push((id, size));
        }

        let mut plans = Vec::with_capacity(stream.archetypes.len());
        for block in &stream.archetypes {
            plans.push(self.plan_block(block, &types)?);
        }

        let total = plans.iter().map(|plan| plan.count).sum();
        let mut created = Vec::with_capacity(total);
        for plan in &plans {
            let start = created.len();
            self.create_entities_into(plan.archetype, plan.count, &mut created)?;
            self.write_block(plan, &created[start..])?;
        }
        Ok(created)
    }

    fn plan_block<'a>(
        &mut self,
        block: &'a SnapshotArchetype,
        types: &[(ComponentTypeId, usize)],
    ) -> Result<RestorePlan<'a>> {
        if block.types.len() != block.columns.len() {
            return Err(EcsError::DeserializationError(
                "archetype block has mismatched type and column counts".to_string(),
            ));
        }
        let count = block.count as usize;
        let mut columns = Vec::with_capacity(block.types.len());
        for (&index, bytes) in block.types.iter().zip(&block.columns) {
            let &(type_id, size) = types.get(index as usize).ok_or_else(|| {
                EcsError::DeserializationError(format!("type index {index} out of range"))
            })?;
            if bytes.len() != count * size {
                return Err(EcsError::DeserializationError(format!(
                    "column of {} bytes for {count} entities of size {size}",
                    bytes.len()
                )));
            }
            columns.push((type_id, size, bytes.as_slice()));
        }
        let ids: Vec<ComponentTypeId> = columns.iter().map(|&(id, _, _)| id).collect();
        let archetype = self.create_archetype(&ids)?;
        Ok(RestorePlan {
            archetype,
            count,
            columns,
        })
    }

    /// Copy a block's columns into freshly created entities, one run at a time.
    fn write_block(&mut self, plan: &RestorePlan<'_>, entities: &[Entity]) -> Result<()> {
        let mut src_row = 0;
        let mut i = 0;
        while i < entities.len() {
            let (at, len) = self.run_at(&entities[i..]).ok_or(EcsError::EntityNotFound)?;
            let (store, _) = self.view_parts();
            let (layout, chunks) = store.get_mut(at.archetype).parts_mut();
            let chunk = &mut chunks[at.chunk as usize];
            let row = at.row as usize;
            for &(type_id, size, bytes) in &plan.columns {
                let column = layout
                    .index_of(type_id)
                    .ok_or(EcsError::ArchetypeNotFound(at.archetype))?;
                chunk.column_mut(layout, column)[row * size..(row + len) * size]
                    .copy_from_slice(&bytes[src_row * size..(src_row + len) * size]);
            }
            src_row += len;
            i += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ManagerConfig;
    use crate::pool::ChunkPool;
    use crate::type_registry::TypeRegistry;

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Health(u32);

    #[test]
    fn test_round_trip_into_fresh_manager() {
        let mut source = EntityManager::new();
        let mut originals = Vec::new();
        for i in 0..3000u32 {
            let e = if i % 3 == 0 {
                source.spawn((Health(i),))
            } else {
                source.spawn((Position { x: i as f32, y: 0.0 }, Health(i)))
            };
            originals.push(e.unwrap());
        }
        let bytes = source.snapshot().unwrap();

        let mut target = EntityManager::new();
        target.register::<Position>();
        target.register::<Health>();
        let restored = target.restore(&bytes).unwrap();
        assert_eq!(restored.len(), 3000);

        let mut healths: Vec<u32> = restored
            .iter()
            .map(|&e| target.get::<Health>(e).unwrap().0)
            .collect();
        healths.sort_unstable();
        assert_eq!(healths, (0..3000).collect::<Vec<_>>());
        for &e in &restored {
            if let Some(p) = target.get::<Position>(e) {
                assert_eq!(p.x as u32, target.get::<Health>(e).unwrap().0);
            }
        }
    }

    #[test]
    fn test_unknown_type_is_rejected_before_creation() {
        let mut source = EntityManager::new();
        source.spawn((Position { x: 1.0, y: 2.0 }, Health(3))).unwrap();
        let bytes = source.snapshot().unwrap();

        let mut target = EntityManager::new();
        target.register::<Health>();
        let err = target.restore(&bytes).unwrap_err();
        assert!(matches!(err, EcsError::DeserializationError(_)));
        assert!(target.is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut manager = EntityManager::new();
        assert!(matches!(
            manager.restore(&[1, 2, 3]),
            Err(EcsError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_shared_registry_restores_in_place() {
        let registry = Arc::new(TypeRegistry::new());
        let pool = Arc::new(ChunkPool::new());
        let mut manager = EntityManager::with_context(registry, pool, ManagerConfig::default());
        manager.spawn((Health(10),)).unwrap();
        let bytes = manager.snapshot().unwrap();
        let restored = manager.restore(&bytes).unwrap();
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.get::<Health>(restored[0]), Some(Health(10)));
    }
}
