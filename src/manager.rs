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

//! Entity manager
//!
//! Owns the entity store, the archetype store and the query store, and leases chunks from a
//! (possibly shared) [`ChunkPool`]. Every structural mutation goes through here.
//!
//! Batch operations walk their input in *runs*: maximal sequences of handles that sit in
//! consecutive rows of one chunk. Each run costs one bulk copy and one tail patch no matter
//! how long it is. Handles are re-resolved before each run, so a batch may freely contain
//! dead handles, duplicates, or entities an earlier run already moved.

use std::cell::RefCell;
use std::ops::Range;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use smallvec::SmallVec;
#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{Archetype, ArchetypeId, ArchetypeStore};
use crate::chunk::CHUNK_SIZE;
use crate::command::CommandBuffer;
use crate::component::{Bundle, Component, ComponentSet};
use crate::config::ManagerConfig;
use crate::entity::{Entity, EntityLocation, EntityStore};
use crate::error::{EcsError, Result};
use crate::iter::{ChunkCursor, ChunkIter, ChunkViewMut};
use crate::pool::ChunkPool;
use crate::query::{QueryDesc, QueryId, QueryStore};
use crate::type_registry::{ComponentTypeId, TypeRegistry, ENTITY_TYPE_ID};
use crate::utils::next_id;

/// Rows claimed in one archetype: `(chunk index, row range)` per touched chunk
type RowSpans = SmallVec<[(usize, Range<usize>); 4]>;

/// Storage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManagerStats {
    pub entities: usize,
    pub archetypes: usize,
    pub chunks: usize,
    pub queries: usize,
    /// Archetype matches cached across all queries
    pub cached_matches: usize,
    /// Bytes held by this manager's chunks
    pub chunk_memory: usize,
    /// Idle chunks in the (possibly shared) pool
    pub pooled_chunks: usize,
    /// Chunks leased from the pool by every manager sharing it
    pub leased_chunks: usize,
}

/// Central entity/component store
pub struct EntityManager {
    id: u64,
    config: ManagerConfig,
    registry: Arc<TypeRegistry>,
    pool: Arc<ChunkPool>,
    entities: EntityStore,
    archetypes: ArchetypeStore,
    /// Query cache, refreshed lazily from `&self` lookups
    queries: RefCell<QueryStore>,
    change_version: u64,
}

impl EntityManager {
    /// Create a manager with its own registry and pool.
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let pool = Arc::new(ChunkPool::with_max_pooled(config.max_pooled_chunks));
        Self::with_context(Arc::new(TypeRegistry::new()), pool, config)
    }

    /// Create a manager sharing a registry and a chunk pool with other managers.
    pub fn with_context(registry: Arc<TypeRegistry>, pool: Arc<ChunkPool>, config: ManagerConfig) -> Self {
        Self {
            id: next_id(),
            entities: EntityStore::with_capacity(config.initial_entity_capacity),
            archetypes: ArchetypeStore::with_capacity(
                Arc::clone(&registry),
                config.initial_archetype_capacity,
            ),
            queries: RefCell::new(QueryStore::new()),
            change_version: 0,
            registry,
            pool,
            config,
        }
    }

    /// Process-unique id; command buffers are bound to it.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entity_store(&self) -> &EntityStore {
        &self.entities
    }

    /// Version of the most recent value write.
    ///
    /// Record it, then ask `changed_since(recorded)` later to find writes made in between.
    pub fn change_version(&self) -> u64 {
        self.change_version
    }

    pub(crate) fn next_change_version(&mut self) -> u64 {
        self.change_version += 1;
        self.change_version
    }

    /// Skip `steps` versions, as if that many more calls had run.
    pub(crate) fn advance_change_version(&mut self, steps: u64) {
        self.change_version += steps;
    }

    pub(crate) fn view_parts(&mut self) -> (&mut ArchetypeStore, &TypeRegistry) {
        (&mut self.archetypes, &self.registry)
    }

    // ========== Types and archetypes ==========

    pub fn register<T: Component>(&self) -> ComponentTypeId {
        self.registry.register::<T>()
    }

    /// Resolve a type set to its archetype, creating it on first use.
    pub fn create_archetype(&mut self, types: &[ComponentTypeId]) -> Result<ArchetypeId> {
        self.archetypes.get_or_create(types)
    }

    /// Archetype for a tuple of component types
    pub fn archetype_of<S: ComponentSet>(&mut self) -> Result<ArchetypeId> {
        let types = S::register(&self.registry);
        self.archetypes.get_or_create(&types)
    }

    pub fn extend_archetype(&mut self, base: ArchetypeId, types: &[ComponentTypeId]) -> Result<ArchetypeId> {
        self.archetypes.extend(base, types)
    }

    pub fn exclude_archetype(&mut self, base: ArchetypeId, types: &[ComponentTypeId]) -> Result<ArchetypeId> {
        self.archetypes.exclude(base, types)
    }

    pub fn combine_archetypes(&mut self, a: ArchetypeId, b: ArchetypeId) -> Result<ArchetypeId> {
        self.archetypes.combine(a, b)
    }

    pub fn archetype(&self, id: ArchetypeId) -> Result<&Archetype> {
        self.archetypes.get_checked(id)
    }

    /// All archetypes, in creation order
    pub fn archetypes(&self) -> &[Archetype] {
        self.archetypes.archetypes()
    }

    pub fn archetype_store(&self) -> &ArchetypeStore {
        &self.archetypes
    }

    // ========== Entity lifecycle ==========

    pub fn create_entity(&mut self, archetype: ArchetypeId) -> Result<Entity> {
        let mut out = Vec::with_capacity(1);
        self.create_entities_into(archetype, 1, &mut out)?;
        out.pop().ok_or(EcsError::EntityNotFound)
    }

    pub fn create_entities(&mut self, archetype: ArchetypeId, count: usize) -> Result<Vec<Entity>> {
        let mut out = Vec::with_capacity(count);
        self.create_entities_into(archetype, count, &mut out)?;
        Ok(out)
    }

    /// Create `count` zero-initialised entities, appending their handles to `out`.
    ///
    /// Rows go to the first chunks with free space, then to freshly leased chunks.
    pub fn create_entities_into(
        &mut self,
        archetype: ArchetypeId,
        count: usize,
        out: &mut Vec<Entity>,
    ) -> Result<()> {
        self.archetypes.get_checked(archetype)?;
        if count == 0 {
            return Ok(());
        }
        #[cfg(feature = "profiling")]
        let span = info_span!("manager.create_entities", archetype = archetype.0, count);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let start = out.len();
        self.entities.create(count, out);
        let version = self.next_change_version();
        let spans = self.allocate_rows(archetype, count, version);
        self.place_handles(archetype, &spans, &out[start..]);
        Ok(())
    }

    /// Create one entity from a tuple of component values.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> Result<Entity> {
        let types = B::register(&self.registry);
        let archetype = self.archetypes.get_or_create(&types)?;
        let entity = self.create_entity(archetype)?;
        let at = self.entities.resolve(entity).ok_or(EcsError::EntityNotFound)?;

        let (layout, chunks) = self.archetypes.get_mut(at.archetype).parts_mut();
        let chunk = &mut chunks[at.chunk as usize];
        bundle.write_components(&types, |type_id, bytes| {
            if type_id == ENTITY_TYPE_ID {
                return;
            }
            if let Some(column) = layout.index_of(type_id) {
                chunk
                    .value_mut(layout, column, at.row as usize)
                    .copy_from_slice(bytes);
            }
        });
        Ok(entity)
    }

    /// Clone one entity's component values into `count` new entities of the same archetype.
    ///
    /// Returns no handles if `source` is dead.
    pub fn instantiate(&mut self, source: Entity, count: usize) -> Vec<Entity> {
        let mut out = Vec::with_capacity(count);
        self.instantiate_into(source, count, &mut out);
        out
    }

    pub fn instantiate_into(&mut self, source: Entity, count: usize, out: &mut Vec<Entity>) -> usize {
        let Some(at) = self.entities.resolve(source) else {
            return 0;
        };
        if count == 0 {
            return 0;
        }
        #[cfg(feature = "profiling")]
        let span = info_span!("manager.instantiate", archetype = at.archetype.0, count);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let prototype = {
            let Some(archetype) = self.archetypes.get(at.archetype) else {
                return 0;
            };
            archetype.chunks()[at.chunk as usize].read_prototype(archetype.layout(), at.row as usize)
        };

        let start = out.len();
        self.entities.create(count, out);
        let version = self.next_change_version();
        let spans = self.allocate_rows(at.archetype, count, version);
        {
            let (layout, chunks) = self.archetypes.get_mut(at.archetype).parts_mut();
            for (index, rows) in &spans {
                chunks[*index].replicate_prototype(layout, &prototype, rows.clone());
            }
        }
        self.place_handles(at.archetype, &spans, &out[start..]);
        count
    }

    pub fn destroy_entity(&mut self, entity: Entity) -> bool {
        self.destroy_entities(&[entity]) == 1
    }

    /// Destroy a batch of entities. Dead handles are skipped.
    ///
    /// Returns the number of entities destroyed.
    pub fn destroy_entities(&mut self, entities: &[Entity]) -> usize {
        #[cfg(feature = "profiling")]
        let span = info_span!("manager.destroy_entities", batch = entities.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let mut destroyed: Vec<Entity> = Vec::with_capacity(entities.len());
        let mut i = 0;
        while i < entities.len() {
            let Some((at, len)) = self.run_at(&entities[i..]) else {
                i += 1;
                continue;
            };
            self.remove_run(at, len);
            let run = &entities[i..i + len];
            for &entity in run {
                self.entities.detach(entity);
            }
            destroyed.extend_from_slice(run);
            i += len;
        }
        self.entities.release(&destroyed);
        destroyed.len()
    }

    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Current location of a live entity
    #[inline]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        self.entities.resolve(entity)
    }

    pub fn archetype_of_entity(&self, entity: Entity) -> Option<ArchetypeId> {
        self.entities.resolve(entity).map(|at| at.archetype)
    }

    // ========== Structural moves ==========

    pub fn move_entity(&mut self, entity: Entity, destination: ArchetypeId) -> Result<bool> {
        Ok(self.move_entities(&[entity], destination)? == 1)
    }

    /// Move entities to another archetype. Shared component values are kept, new ones are
    /// zeroed and dropped ones discarded.
    ///
    /// Returns the number of entities that changed archetype.
    pub fn move_entities(&mut self, entities: &[Entity], destination: ArchetypeId) -> Result<usize> {
        self.archetypes.get_checked(destination)?;
        #[cfg(feature = "profiling")]
        let span = info_span!("manager.move_entities", batch = entities.len(), destination = destination.0);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let version = self.next_change_version();
        let mut moved = 0;
        let mut i = 0;
        while i < entities.len() {
            let Some((at, len)) = self.run_at(&entities[i..]) else {
                i += 1;
                continue;
            };
            if at.archetype != destination {
                self.move_run(at, len, destination, None, version);
                moved += len;
            }
            i += len;
        }
        Ok(moved)
    }

    // ========== Component data ==========

    /// Add `T` to an entity. If it already has `T`, the value is overwritten and `false` is
    /// returned.
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<bool> {
        Ok(self.add_component_to(&[entity], value)? == 1)
    }

    /// Add `T` with the same value to every entity in the batch.
    ///
    /// Returns the number of entities that changed archetype.
    pub fn add_component_to<T: Component>(&mut self, entities: &[Entity], value: T) -> Result<usize> {
        let type_id = self.registry.register::<T>();
        self.add_component_raw(entities, type_id, Some(bytemuck::bytes_of(&value)))
    }

    /// Add edge for every source archetype in the batch that lacks `type_id`. Resolved before
    /// any row moves, so an oversize destination fails the whole batch untouched.
    fn add_destinations(
        &mut self,
        entities: &[Entity],
        type_id: ComponentTypeId,
    ) -> Result<SmallVec<[(ArchetypeId, ArchetypeId); 4]>> {
        let mut destinations: SmallVec<[(ArchetypeId, ArchetypeId); 4]> = SmallVec::new();
        for &entity in entities {
            let Some(at) = self.entities.resolve(entity) else {
                continue;
            };
            if destinations.iter().any(|&(source, _)| source == at.archetype)
                || self.archetypes.get_checked(at.archetype)?.has(type_id)
            {
                continue;
            }
            let destination = self.archetypes.with_component(at.archetype, type_id)?;
            destinations.push((at.archetype, destination));
        }
        Ok(destinations)
    }

    /// Untyped add. `value` of `None` leaves the new component zeroed.
    pub fn add_component_raw(
        &mut self,
        entities: &[Entity],
        type_id: ComponentTypeId,
        value: Option<&[u8]>,
    ) -> Result<usize> {
        if type_id == ENTITY_TYPE_ID {
            return Ok(0);
        }
        self.check_size(type_id, value)?;
        let destinations = self.add_destinations(entities, type_id)?;

        let version = self.next_change_version();
        let mut added = 0;
        let mut i = 0;
        while i < entities.len() {
            let Some((at, len)) = self.run_at(&entities[i..]) else {
                i += 1;
                continue;
            };
            if self.archetypes.get_checked(at.archetype)?.has(type_id) {
                if let Some(bytes) = value {
                    self.fill_run(at, len, type_id, bytes, version);
                }
            } else {
                let destination = destinations
                    .iter()
                    .find(|&&(source, _)| source == at.archetype)
                    .map(|&(_, destination)| destination)
                    .ok_or(EcsError::ArchetypeNotFound(at.archetype))?;
                self.move_run(at, len, destination, value.map(|bytes| (type_id, bytes)), version);
                added += len;
            }
            i += len;
        }
        Ok(added)
    }

    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<bool> {
        Ok(self.remove_component_from::<T>(&[entity])? == 1)
    }

    /// Remove `T` from every entity in the batch that has it.
    pub fn remove_component_from<T: Component>(&mut self, entities: &[Entity]) -> Result<usize> {
        match self.registry.id_of::<T>() {
            Some(type_id) => self.remove_component_raw(entities, type_id),
            None => Ok(0),
        }
    }

    pub fn remove_component_raw(&mut self, entities: &[Entity], type_id: ComponentTypeId) -> Result<usize> {
        if type_id == ENTITY_TYPE_ID {
            return Ok(0);
        }
        let version = self.next_change_version();
        let mut removed = 0;
        let mut i = 0;
        while i < entities.len() {
            let Some((at, len)) = self.run_at(&entities[i..]) else {
                i += 1;
                continue;
            };
            if self.archetypes.get_checked(at.archetype)?.has(type_id) {
                let destination = self.archetypes.without_component(at.archetype, type_id)?;
                self.move_run(at, len, destination, None, version);
                removed += len;
            }
            i += len;
        }
        Ok(removed)
    }

    /// Copy of a component value
    pub fn get<T: Component>(&self, entity: Entity) -> Option<T> {
        self.get_ref::<T>(entity).copied()
    }

    pub fn get_ref<T: Component>(&self, entity: Entity) -> Option<&T> {
        let (at, column) = self.column_of::<T>(entity)?;
        let archetype = self.archetypes.get(at.archetype)?;
        let bytes = archetype.chunks()[at.chunk as usize].value(archetype.layout(), column, at.row as usize);
        bytemuck::try_from_bytes(bytes).ok()
    }

    /// Mutable access; counts as a write to `T` in the entity's chunk.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let (at, column) = self.column_of::<T>(entity)?;
        let version = self.next_change_version();
        let archetype = self.archetypes.get_mut(at.archetype);
        archetype.record_write(at.chunk as usize, column, version);
        let (layout, chunks) = archetype.parts_mut();
        let bytes = chunks[at.chunk as usize].value_mut(layout, column, at.row as usize);
        bytemuck::try_from_bytes_mut(bytes).ok()
    }

    /// Overwrite a component value. Returns `false` if the entity is dead or lacks `T`.
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        match self.get_mut::<T>(entity) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Write the same value to every entity in the batch that has `T`.
    pub fn set_component_for<T: Component>(&mut self, entities: &[Entity], value: T) -> usize {
        match self.registry.id_of::<T>() {
            Some(type_id) if type_id != ENTITY_TYPE_ID => {
                let version = self.next_change_version();
                self.fill_runs(entities, type_id, bytemuck::bytes_of(&value), version)
            }
            _ => 0,
        }
    }

    /// Untyped batch write; `value` must have the registered size of `type_id`.
    pub fn set_component_raw(&mut self, entities: &[Entity], type_id: ComponentTypeId, value: &[u8]) -> Result<usize> {
        if type_id == ENTITY_TYPE_ID {
            return Ok(0);
        }
        self.check_size(type_id, Some(value))?;
        let version = self.next_change_version();
        Ok(self.fill_runs(entities, type_id, value, version))
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.column_of::<T>(entity).is_some()
    }

    // ========== Queries and iteration ==========

    /// Register (or find) the query with these include/exclude sets.
    pub fn query(&self, include: &[ComponentTypeId], exclude: &[ComponentTypeId]) -> QueryId {
        self.query_desc(QueryDesc::new(include, exclude))
    }

    pub fn query_desc(&self, desc: QueryDesc) -> QueryId {
        self.queries.borrow_mut().get_or_create(desc)
    }

    /// Typed query: `query_of::<(Position, Velocity), (Frozen,)>()`
    pub fn query_of<I: ComponentSet, E: ComponentSet>(&self) -> QueryId {
        let include = I::register(&self.registry);
        let exclude = E::register(&self.registry);
        self.query(&include, &exclude)
    }

    /// Query matching every archetype
    pub fn universal_query(&self) -> QueryId {
        self.query_desc(QueryDesc::universal())
    }

    /// Archetypes matched by a query, in creation order
    pub fn matching_archetypes(&self, query: QueryId) -> Result<Vec<ArchetypeId>> {
        self.queries
            .borrow_mut()
            .refresh(query, self.archetypes.archetypes())
            .map(<[ArchetypeId]>::to_vec)
            .ok_or(EcsError::QueryNotFound(query.0))
    }

    /// Number of live entities matched by a query
    pub fn entity_count(&self, query: QueryId) -> Result<usize> {
        Ok(self
            .matching_archetypes(query)?
            .into_iter()
            .filter_map(|id| self.archetypes.get(id))
            .map(Archetype::len)
            .sum())
    }

    /// True if one query requires a type the other requires or forbids
    pub fn queries_intersect(&self, a: QueryId, b: QueryId) -> Result<bool> {
        let queries = self.queries.borrow();
        let qa = queries.get(a).ok_or(EcsError::QueryNotFound(a.0))?;
        let qb = queries.get(b).ok_or(EcsError::QueryNotFound(b.0))?;
        Ok(qa.desc().intersects(qb.desc()))
    }

    /// Borrowing iterator over matched chunks
    pub fn chunks(&self, query: QueryId) -> Result<ChunkIter<'_>> {
        let matched = self.matching_archetypes(query)?;
        Ok(ChunkIter::new(self.archetypes.archetypes(), matched, &self.registry))
    }

    /// Visit every matched chunk mutably
    pub fn for_each_chunk<F>(&mut self, query: QueryId, mut f: F) -> Result<()>
    where
        F: FnMut(ChunkViewMut<'_>),
    {
        let matched = self.matching_archetypes(query)?;
        let version = self.next_change_version();
        let registry = &*self.registry;
        for id in matched {
            let (layout, chunks) = self.archetypes.get_mut(id).parts_mut();
            for (index, chunk) in chunks.iter_mut().enumerate() {
                f(ChunkViewMut::new(id, index, layout, chunk, registry, version));
            }
        }
        Ok(())
    }

    /// Visit every matched chunk mutably, chunks spread over the rayon pool
    #[cfg(feature = "parallel")]
    pub fn par_for_each_chunk<F>(&mut self, query: QueryId, f: F) -> Result<()>
    where
        F: Fn(ChunkViewMut<'_>) + Send + Sync,
    {
        let matched = self.matching_archetypes(query)?;
        #[cfg(feature = "profiling")]
        let span = info_span!("manager.par_for_each_chunk", archetypes = matched.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let version = self.next_change_version();
        let registry = &*self.registry;
        self.archetypes
            .archetypes_mut()
            .par_iter_mut()
            .filter(|archetype| matched.binary_search(&archetype.id()).is_ok())
            .flat_map(|archetype| {
                let id = archetype.id();
                let (layout, chunks) = archetype.parts_mut();
                chunks
                    .par_iter_mut()
                    .enumerate()
                    .map(move |(index, chunk)| ChunkViewMut::new(id, index, layout, chunk, registry, version))
            })
            .for_each(|view| f(view));
        Ok(())
    }

    /// Detached cursor over matched chunks, invalidated by structural changes
    pub fn cursor(&self, query: QueryId) -> Result<ChunkCursor> {
        let snapshot = self
            .matching_archetypes(query)?
            .into_iter()
            .filter_map(|id| self.archetypes.get(id))
            .map(|archetype| (archetype.id(), archetype.structural_version()))
            .collect();
        Ok(ChunkCursor::new(self.id, query, snapshot))
    }

    // ========== Deferred mutation ==========

    /// New command buffer bound to this manager
    pub fn command_buffer(&self) -> CommandBuffer {
        CommandBuffer::new(
            self.id,
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            self.config.coalesce_commands,
        )
    }

    // ========== Maintenance ==========

    pub fn stats(&self) -> ManagerStats {
        let chunks: usize = self.archetypes.archetypes().iter().map(Archetype::chunk_count).sum();
        ManagerStats {
            entities: self.entities.len(),
            archetypes: self.archetypes.len(),
            chunks,
            queries: self.queries.borrow().len(),
            cached_matches: self.queries.borrow().cached_matches(),
            chunk_memory: chunks * CHUNK_SIZE,
            pooled_chunks: self.pool.pooled(),
            leased_chunks: self.pool.leased(),
        }
    }

    /// Destroy every entity and return all chunks to the pool.
    ///
    /// Archetypes and queries stay registered.
    pub fn clear(&mut self) {
        self.release_all_chunks();
        self.entities.clear();
        self.change_version += 1;
    }

    fn release_all_chunks(&mut self) {
        for archetype in self.archetypes.archetypes_mut() {
            for buffer in archetype.drain_chunks() {
                self.pool.release(buffer);
            }
        }
    }

    // ========== Internal ==========

    /// Location of the first handle and how many of the following handles occupy the next
    /// rows of the same chunk. `None` if the first handle is dead.
    pub(crate) fn run_at(&self, entities: &[Entity]) -> Option<(EntityLocation, usize)> {
        let start = self.entities.resolve(*entities.first()?)?;
        let mut len = 1;
        for &entity in &entities[1..] {
            match self.entities.resolve(entity) {
                Some(at)
                    if at.archetype == start.archetype
                        && at.chunk == start.chunk
                        && at.row as usize == start.row as usize + len =>
                {
                    len += 1
                }
                _ => break,
            }
        }
        Some((start, len))
    }

    /// Claim `count` zeroed rows, first-fit over existing chunks, leasing new chunks for
    /// the rest. The claimed chunks are stamped with `version`.
    fn allocate_rows(&mut self, id: ArchetypeId, count: usize, version: u64) -> RowSpans {
        let mut spans = RowSpans::new();
        if count == 0 {
            return spans;
        }
        let archetype = self.archetypes.get_mut(id);
        archetype.bump_structural_version();
        archetype.add_entities(count);

        let mut remaining = count;
        let mut from = 0;
        while remaining > 0 {
            let index = match archetype.first_free_chunk(from) {
                Some(index) => index,
                None => archetype.push_chunk(self.pool.acquire()),
            };
            let (layout, chunks) = archetype.parts_mut();
            let chunk = &mut chunks[index];
            let n = chunk.free_rows(layout).min(remaining);
            let rows = chunk.push_rows(layout, n);
            chunk.stamp_all(version);
            spans.push((index, rows));
            remaining -= n;
            from = index + 1;
        }
        spans
    }

    /// Write handles into freshly claimed rows and point the store at them.
    fn place_handles(&mut self, id: ArchetypeId, spans: &RowSpans, handles: &[Entity]) {
        let (layout, chunks) = self.archetypes.get_mut(id).parts_mut();
        let mut next = 0;
        for (index, rows) in spans {
            let batch = &handles[next..next + rows.len()];
            chunks[*index]
                .entities_mut(layout, rows.clone())
                .copy_from_slice(batch);
            for (row, &entity) in rows.clone().zip(batch) {
                self.entities.set_location(
                    entity,
                    EntityLocation {
                        archetype: id,
                        chunk: *index as u32,
                        row: row as u32,
                    },
                );
            }
            next += rows.len();
        }
    }

    /// Copy-convert a run into `destination`, optionally broadcasting one component value
    /// over the new rows, then remove the run from its source chunk.
    fn move_run(
        &mut self,
        at: EntityLocation,
        len: usize,
        destination: ArchetypeId,
        init: Option<(ComponentTypeId, &[u8])>,
        version: u64,
    ) {
        let spans = self.allocate_rows(destination, len, version);
        {
            let (source, target) = self.archetypes.pair_mut(at.archetype, destination);
            let src_layout = source.layout();
            let src_chunk = &source.chunks()[at.chunk as usize];
            let (layout, chunks) = target.parts_mut();
            let init = init.and_then(|(type_id, bytes)| layout.index_of(type_id).map(|column| (column, bytes)));

            let mut src_row = at.row as usize;
            for (index, rows) in &spans {
                let chunk = &mut chunks[*index];
                chunk.copy_convert_from(layout, rows.start, src_chunk, src_layout, src_row, rows.len());
                if let Some((column, bytes)) = init {
                    chunk.fill_column(layout, column, rows.clone(), bytes);
                }
                for (row, &entity) in rows.clone().zip(&chunk.entities(layout)[rows.clone()]) {
                    self.entities.set_location(
                        entity,
                        EntityLocation {
                            archetype: destination,
                            chunk: *index as u32,
                            row: row as u32,
                        },
                    );
                }
                src_row += rows.len();
            }
        }
        self.remove_run(at, len);
    }

    /// Remove a run from its chunk, patch the hole from the tail, and return the chunk to
    /// the pool once it is empty.
    fn remove_run(&mut self, at: EntityLocation, len: usize) {
        let archetype = self.archetypes.get_mut(at.archetype);
        archetype.remove_entities(len);
        archetype.bump_structural_version();

        let index = at.chunk as usize;
        let (layout, chunks) = archetype.parts_mut();
        let chunk = &mut chunks[index];
        let patched = chunk.remove_rows(layout, at.row as usize, len);
        for row in patched {
            let entity = chunk.entities(layout)[row];
            self.entities.set_location(
                entity,
                EntityLocation {
                    archetype: at.archetype,
                    chunk: at.chunk,
                    row: row as u32,
                },
            );
        }

        if chunk.is_empty() {
            let (buffer, relocated) = archetype.take_chunk(index);
            if relocated {
                for &entity in archetype.chunks()[index].entities(archetype.layout()) {
                    self.entities.set_chunk(entity, index as u32);
                }
            }
            self.pool.release(buffer);
        }
    }

    /// Broadcast a value over a run's column. `false` if the archetype lacks the type.
    fn fill_run(&mut self, at: EntityLocation, len: usize, type_id: ComponentTypeId, value: &[u8], version: u64) -> bool {
        let archetype = self.archetypes.get_mut(at.archetype);
        let Some(column) = archetype.layout().index_of(type_id) else {
            return false;
        };
        archetype.record_write(at.chunk as usize, column, version);
        let (layout, chunks) = archetype.parts_mut();
        let row = at.row as usize;
        chunks[at.chunk as usize].fill_column(layout, column, row..row + len, value);
        true
    }

    fn fill_runs(&mut self, entities: &[Entity], type_id: ComponentTypeId, value: &[u8], version: u64) -> usize {
        let mut written = 0;
        let mut i = 0;
        while i < entities.len() {
            let Some((at, len)) = self.run_at(&entities[i..]) else {
                i += 1;
                continue;
            };
            if self.fill_run(at, len, type_id, value, version) {
                written += len;
            }
            i += len;
        }
        written
    }

    fn check_size(&self, type_id: ComponentTypeId, value: Option<&[u8]>) -> Result<()> {
        let info = self
            .registry
            .info(type_id)
            .ok_or(EcsError::ComponentNotRegistered("<unknown component id>"))?;
        match value {
            Some(bytes) if bytes.len() != info.size => Err(EcsError::ComponentSizeMismatch {
                expected: info.size,
                found: bytes.len(),
            }),
            _ => Ok(()),
        }
    }

    fn column_of<T: Component>(&self, entity: Entity) -> Option<(EntityLocation, usize)> {
        let type_id = self.registry.id_of::<T>()?;
        if type_id == ENTITY_TYPE_ID {
            return None;
        }
        let at = self.entities.resolve(entity)?;
        let column = self.archetypes.get(at.archetype)?.layout().index_of(type_id)?;
        Some((at, column))
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EntityManager {
    fn drop(&mut self) {
        self.release_all_chunks();
    }
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("id", &self.id)
            .field("entities", &self.entities.len())
            .field("archetypes", &self.archetypes.len())
            .field("change_version", &self.change_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Health(u32);

    /// Every chunk's `[0, count)` rows resolve back to themselves
    fn assert_contiguous(manager: &EntityManager) {
        for archetype in manager.archetypes() {
            let mut total = 0;
            for (index, chunk) in archetype.chunks().iter().enumerate() {
                assert!(!chunk.is_empty(), "empty chunk kept in {:?}", archetype.id());
                for (row, &entity) in chunk.entities(archetype.layout()).iter().enumerate() {
                    let at = manager.location(entity).expect("row holds a dead entity");
                    assert_eq!(at.archetype, archetype.id());
                    assert_eq!(at.chunk as usize, index);
                    assert_eq!(at.row as usize, row);
                }
                total += chunk.len();
            }
            assert_eq!(total, archetype.len());
        }
    }

    #[test]
    fn test_create_fills_chunks_first_fit() {
        let mut manager = EntityManager::new();
        let archetype = manager.archetype_of::<(Position, Velocity)>().unwrap();
        let capacity = manager.archetype(archetype).unwrap().chunk_capacity();

        let entities = manager.create_entities(archetype, capacity + 10).unwrap();
        assert_eq!(manager.archetype(archetype).unwrap().chunk_count(), 2);
        assert_eq!(manager.get::<Position>(entities[0]), Some(Position::default()));

        manager.destroy_entities(&entities[..5]);
        manager.create_entities(archetype, 5).unwrap();
        assert_eq!(manager.archetype(archetype).unwrap().chunk_count(), 2);
        assert_contiguous(&manager);
    }

    #[test]
    fn test_destroy_patches_tail_and_releases_chunks() {
        let mut manager = EntityManager::new();
        let archetype = manager.archetype_of::<(Health,)>().unwrap();
        let entities = manager.create_entities(archetype, 100).unwrap();
        for (i, &e) in entities.iter().enumerate() {
            manager.set(e, Health(i as u32));
        }

        // Every other entity, then a contiguous block
        let odd: Vec<Entity> = entities.iter().copied().skip(1).step_by(2).collect();
        assert_eq!(manager.destroy_entities(&odd), 50);
        assert_contiguous(&manager);
        for (i, &e) in entities.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(manager.get::<Health>(e), Some(Health(i as u32)));
            } else {
                assert!(!manager.is_alive(e));
            }
        }

        let leased = manager.pool().leased();
        assert_eq!(manager.destroy_entities(&entities), 50);
        assert_eq!(manager.archetype(archetype).unwrap().chunk_count(), 0);
        assert_eq!(manager.pool().leased(), leased - 1);
    }

    #[test]
    fn test_batch_with_duplicates_and_dead_handles() {
        let mut manager = EntityManager::new();
        let archetype = manager.archetype_of::<(Health,)>().unwrap();
        let entities = manager.create_entities(archetype, 4).unwrap();
        let batch = [entities[1], entities[1], Entity::NULL, entities[2], entities[1]];
        assert_eq!(manager.destroy_entities(&batch), 2);
        assert_eq!(manager.len(), 2);
        assert_contiguous(&manager);
    }

    #[test]
    fn test_add_remove_keeps_values() {
        let mut manager = EntityManager::new();
        let e = manager.spawn((Position { x: 1.0, y: 2.0 },)).unwrap();

        assert!(manager.add_component(e, Velocity { x: 3.0, y: 4.0 }).unwrap());
        assert_eq!(manager.get::<Position>(e), Some(Position { x: 1.0, y: 2.0 }));
        assert_eq!(manager.get::<Velocity>(e), Some(Velocity { x: 3.0, y: 4.0 }));

        // Adding again overwrites without a structural change
        assert!(!manager.add_component(e, Velocity { x: 5.0, y: 6.0 }).unwrap());
        assert_eq!(manager.get::<Velocity>(e), Some(Velocity { x: 5.0, y: 6.0 }));

        assert!(manager.remove_component::<Velocity>(e).unwrap());
        assert!(!manager.has::<Velocity>(e));
        assert_eq!(manager.get::<Position>(e), Some(Position { x: 1.0, y: 2.0 }));
        assert!(!manager.remove_component::<Velocity>(e).unwrap());
        assert_contiguous(&manager);
    }

    #[test]
    fn test_anchor_cannot_be_added_or_removed() {
        let mut manager = EntityManager::new();
        let e = manager.spawn((Health(1),)).unwrap();
        assert!(!manager.add_component(e, Entity::NULL).unwrap());
        assert!(!manager.remove_component::<Entity>(e).unwrap());
        assert!(!manager.has::<Entity>(e));
        assert_eq!(manager.get::<Health>(e), Some(Health(1)));
    }

    #[test]
    fn test_batch_add_moves_runs() {
        let mut manager = EntityManager::new();
        let archetype = manager.archetype_of::<(Position,)>().unwrap();
        let entities = manager.create_entities(archetype, 1000).unwrap();

        assert_eq!(manager.add_component_to(&entities, Health(9)).unwrap(), 1000);
        assert!(manager.archetype(archetype).unwrap().is_empty());
        assert!(entities.iter().all(|&e| manager.get::<Health>(e) == Some(Health(9))));
        assert_contiguous(&manager);
    }

    #[test]
    fn test_move_entities_zeroes_new_types() {
        let mut manager = EntityManager::new();
        let e = manager
            .spawn((Position { x: 1.0, y: 1.0 }, Health(3)))
            .unwrap();
        let target = manager.archetype_of::<(Position, Velocity)>().unwrap();
        assert!(manager.move_entity(e, target).unwrap());
        assert!(!manager.move_entity(e, target).unwrap());
        assert_eq!(manager.get::<Velocity>(e), Some(Velocity::default()));
        assert_eq!(manager.get::<Position>(e), Some(Position { x: 1.0, y: 1.0 }));
        assert!(!manager.has::<Health>(e));
    }

    #[test]
    fn test_instantiate_replicates_source() {
        let mut manager = EntityManager::new();
        let source = manager
            .spawn((Position { x: 7.0, y: 8.0 }, Health(42)))
            .unwrap();
        let copies = manager.instantiate(source, 2000);
        assert_eq!(copies.len(), 2000);
        assert!(copies
            .iter()
            .all(|&e| manager.get::<Health>(e) == Some(Health(42))
                && manager.get::<Position>(e) == Some(Position { x: 7.0, y: 8.0 })));
        assert_contiguous(&manager);

        manager.destroy_entity(source);
        assert!(manager.instantiate(source, 5).is_empty());
    }

    #[test]
    fn test_set_component_raw_checks_size() {
        let mut manager = EntityManager::new();
        let e = manager.spawn((Health(1),)).unwrap();
        let health = manager.register::<Health>();
        assert_eq!(
            manager.set_component_raw(&[e], health, &[0u8; 3]).unwrap_err(),
            EcsError::ComponentSizeMismatch {
                expected: 4,
                found: 3
            }
        );
        assert_eq!(manager.set_component_raw(&[e], health, &7u32.to_ne_bytes()).unwrap(), 1);
        assert_eq!(manager.get::<Health>(e), Some(Health(7)));
    }

    #[test]
    fn test_oversized_archetype_fails_before_mutation() {
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(C)]
        struct Big([u8; 12 * 1024]);
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(C)]
        struct Bigger([u8; 8 * 1024]);

        let mut manager = EntityManager::new();
        let e = manager.spawn((Big([1; 12 * 1024]),)).unwrap();
        let err = manager.add_component(e, Bigger([0; 8 * 1024])).unwrap_err();
        assert!(matches!(err, EcsError::ArchetypeTooLarge { .. }));
        assert!(manager.has::<Big>(e));
        assert!(!manager.has::<Bigger>(e));
        assert_contiguous(&manager);
    }

    #[test]
    fn test_batch_add_fails_before_moving_any_run() {
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(C)]
        struct Big([u8; 12 * 1024]);
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(C)]
        struct Bigger([u8; 6 * 1024]);

        let mut manager = EntityManager::new();
        let small = manager.spawn((Health(1),)).unwrap();
        let big = manager.spawn((Big([1; 12 * 1024]),)).unwrap();
        let small_archetype = manager.archetype_of_entity(small).unwrap();
        let version = manager.change_version();

        // `small` fits Bigger, `big` does not: nothing may move.
        let err = manager
            .add_component_to(&[small, big], Bigger([0; 6 * 1024]))
            .unwrap_err();
        assert!(matches!(err, EcsError::ArchetypeTooLarge { .. }));
        assert!(!manager.has::<Bigger>(small));
        assert_eq!(manager.get::<Health>(small), Some(Health(1)));
        assert_eq!(manager.archetype_of_entity(small), Some(small_archetype));
        assert!(manager.has::<Big>(big));
        assert_eq!(manager.change_version(), version);
        assert_contiguous(&manager);
    }

    #[test]
    fn test_queries_and_counts() {
        let mut manager = EntityManager::new();
        manager.spawn((Position::default(),)).unwrap();
        manager.spawn((Position::default(), Velocity::default())).unwrap();

        let moving = manager.query_of::<(Position, Velocity), ()>();
        let all_pos = manager.query_of::<(Position,), ()>();
        let still = manager.query_of::<(Position,), (Velocity,)>();
        assert_eq!(manager.entity_count(moving).unwrap(), 1);
        assert_eq!(manager.entity_count(all_pos).unwrap(), 2);
        assert_eq!(manager.entity_count(still).unwrap(), 1);
        assert!(manager.queries_intersect(moving, still).unwrap());
        assert_eq!(
            manager.entity_count(QueryId(99)).unwrap_err(),
            EcsError::QueryNotFound(99)
        );

        // New archetypes are picked up by existing queries
        manager.spawn((Position::default(), Health(1))).unwrap();
        assert_eq!(manager.entity_count(all_pos).unwrap(), 3);
        assert_eq!(manager.entity_count(still).unwrap(), 2);
    }

    #[test]
    fn test_for_each_chunk_writes() {
        let mut manager = EntityManager::new();
        let archetype = manager.archetype_of::<(Position, Velocity)>().unwrap();
        let entities = manager.create_entities(archetype, 3000).unwrap();
        manager.set_component_for(&entities, Velocity { x: 1.0, y: 2.0 });

        let query = manager.query_of::<(Position, Velocity), ()>();
        manager
            .for_each_chunk(query, |mut view| {
                let (positions, velocities) = view.column_pair_mut::<Position, Velocity>().unwrap();
                for (p, v) in positions.iter_mut().zip(velocities) {
                    p.x += v.x;
                    p.y += v.y;
                }
            })
            .unwrap();
        assert!(entities
            .iter()
            .all(|&e| manager.get::<Position>(e) == Some(Position { x: 1.0, y: 2.0 })));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_par_for_each_chunk() {
        let mut manager = EntityManager::new();
        let archetype = manager.archetype_of::<(Health,)>().unwrap();
        let entities = manager.create_entities(archetype, 10_000).unwrap();
        let query = manager.query_of::<(Health,), ()>();
        manager
            .par_for_each_chunk(query, |mut view| {
                view.column_mut::<Health>().unwrap().iter_mut().for_each(|h| h.0 += 1);
            })
            .unwrap();
        assert!(entities.iter().all(|&e| manager.get::<Health>(e) == Some(Health(1))));
    }

    #[test]
    fn test_clear_returns_chunks() {
        let pool = Arc::new(ChunkPool::new());
        let registry = Arc::new(TypeRegistry::new());
        let mut manager = EntityManager::with_context(registry, Arc::clone(&pool), ManagerConfig::default());
        let archetype = manager.archetype_of::<(Health,)>().unwrap();
        let entities = manager.create_entities(archetype, 10_000).unwrap();
        assert!(pool.leased() > 1);

        manager.clear();
        assert_eq!(pool.leased(), 0);
        assert!(manager.is_empty());
        assert!(!manager.is_alive(entities[0]));
        assert_eq!(manager.stats().chunks, 0);
    }

    #[test]
    fn test_drop_returns_chunks_to_shared_pool() {
        let pool = Arc::new(ChunkPool::new());
        let registry = Arc::new(TypeRegistry::new());
        {
            let mut a = EntityManager::with_context(Arc::clone(&registry), Arc::clone(&pool), ManagerConfig::default());
            let mut b = EntityManager::with_context(Arc::clone(&registry), Arc::clone(&pool), ManagerConfig::default());
            a.spawn((Health(1),)).unwrap();
            b.spawn((Health(2),)).unwrap();
            assert_eq!(pool.leased(), 2);
        }
        assert_eq!(pool.leased(), 0);
        assert_eq!(pool.pooled(), 2);
    }
}
