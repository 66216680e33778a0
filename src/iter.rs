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

//! Chunk enumeration
//!
//! Two flavours:
//! - [`ChunkIter`] borrows the manager, so the borrow checker rules out structural changes
//!   while it is alive.
//! - [`ChunkCursor`] is detached from the manager. It snapshots the structural version of
//!   every archetype it will visit and fails with [`EcsError::IteratorInvalidated`] if any of
//!   them moved on before the next step, or with [`EcsError::ChunkRecycled`] if the chunk it
//!   yielded last went back to the pool.

use crate::archetype::{Archetype, ArchetypeId};
use crate::chunk::{Chunk, ChunkLayout};
use crate::component::Component;
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::manager::EntityManager;
use crate::query::QueryId;
use crate::type_registry::{TypeRegistry, ENTITY_TYPE_ID};

/// Read-only view of one chunk
pub struct ChunkView<'a> {
    archetype: ArchetypeId,
    index: usize,
    layout: &'a ChunkLayout,
    chunk: &'a Chunk,
    registry: &'a TypeRegistry,
}

impl<'a> ChunkView<'a> {
    pub(crate) fn new(
        archetype: ArchetypeId,
        index: usize,
        layout: &'a ChunkLayout,
        chunk: &'a Chunk,
        registry: &'a TypeRegistry,
    ) -> Self {
        Self {
            archetype,
            index,
            layout,
            chunk,
            registry,
        }
    }

    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    /// Index of the chunk within its archetype
    pub fn chunk_index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn entities(&self) -> &'a [Entity] {
        self.chunk.entities(self.layout)
    }

    /// Typed column. `None` if the archetype lacks `T` or `T` is zero-sized.
    pub fn column<T: Component>(&self) -> Option<&'a [T]> {
        let column = column_index::<T>(self.registry, self.layout)?;
        bytemuck::try_cast_slice(self.chunk.column(self.layout, column)).ok()
    }

    pub fn has<T: Component>(&self) -> bool {
        column_index::<T>(self.registry, self.layout).is_some()
    }

    /// True if `T` was written in this chunk after `version` was observed
    pub fn changed_since<T: Component>(&self, version: u64) -> bool {
        column_index::<T>(self.registry, self.layout)
            .is_some_and(|column| self.chunk.changed_since(column, version))
    }
}

/// Mutable view of one chunk. Column writes stamp the chunk's change version; they never
/// count as structural changes.
pub struct ChunkViewMut<'a> {
    archetype: ArchetypeId,
    index: usize,
    layout: &'a ChunkLayout,
    chunk: &'a mut Chunk,
    registry: &'a TypeRegistry,
    version: u64,
}

impl std::fmt::Debug for ChunkViewMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkViewMut")
            .field("archetype", &self.archetype)
            .field("index", &self.index)
            .field("len", &self.chunk.len())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<'a> ChunkViewMut<'a> {
    pub(crate) fn new(
        archetype: ArchetypeId,
        index: usize,
        layout: &'a ChunkLayout,
        chunk: &'a mut Chunk,
        registry: &'a TypeRegistry,
        version: u64,
    ) -> Self {
        Self {
            archetype,
            index,
            layout,
            chunk,
            registry,
            version,
        }
    }

    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    pub fn chunk_index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        self.chunk.entities(self.layout)
    }

    pub fn column<T: Component>(&self) -> Option<&[T]> {
        let column = column_index::<T>(self.registry, self.layout)?;
        bytemuck::try_cast_slice(self.chunk.column(self.layout, column)).ok()
    }

    /// Typed mutable column; stamps the write version for `T` in this chunk
    pub fn column_mut<T: Component>(&mut self) -> Option<&mut [T]> {
        if std::mem::size_of::<T>() == 0 {
            return None;
        }
        let column = column_index::<T>(self.registry, self.layout)?;
        self.chunk.stamp(column, self.version);
        bytemuck::try_cast_slice_mut(self.chunk.column_mut(self.layout, column)).ok()
    }

    /// Write `W` while reading `R`. Stamps `W` only.
    pub fn column_pair_mut<W: Component, R: Component>(&mut self) -> Option<(&mut [W], &[R])> {
        if std::mem::size_of::<W>() == 0 || std::mem::size_of::<R>() == 0 {
            return None;
        }
        let write = column_index::<W>(self.registry, self.layout)?;
        let read = column_index::<R>(self.registry, self.layout)?;
        if write == read {
            return None;
        }
        self.chunk.stamp(write, self.version);
        let (w, r) = self.chunk.column_pair_mut(self.layout, write, read);
        Some((
            bytemuck::try_cast_slice_mut(w).ok()?,
            bytemuck::try_cast_slice(r).ok()?,
        ))
    }

    pub fn has<T: Component>(&self) -> bool {
        column_index::<T>(self.registry, self.layout).is_some()
    }

    pub fn changed_since<T: Component>(&self, version: u64) -> bool {
        column_index::<T>(self.registry, self.layout)
            .is_some_and(|column| self.chunk.changed_since(column, version))
    }

    /// Version stamped by writes through this view
    pub fn write_version(&self) -> u64 {
        self.version
    }
}

fn column_index<T: Component>(registry: &TypeRegistry, layout: &ChunkLayout) -> Option<usize> {
    let id = registry.id_of::<T>()?;
    if id == ENTITY_TYPE_ID {
        return None;
    }
    layout.index_of(id)
}

/// Borrowing iterator over the chunks of a query's archetypes
pub struct ChunkIter<'a> {
    archetypes: &'a [Archetype],
    matched: Vec<ArchetypeId>,
    registry: &'a TypeRegistry,
    archetype_index: usize,
    chunk_index: usize,
}

impl<'a> ChunkIter<'a> {
    pub(crate) fn new(
        archetypes: &'a [Archetype],
        matched: Vec<ArchetypeId>,
        registry: &'a TypeRegistry,
    ) -> Self {
        Self {
            archetypes,
            matched,
            registry,
            archetype_index: 0,
            chunk_index: 0,
        }
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = ChunkView<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = *self.matched.get(self.archetype_index)?;
            let archetype = &self.archetypes[id.index()];
            if self.chunk_index < archetype.chunk_count() {
                let chunk = self.chunk_index;
                self.chunk_index += 1;
                return Some(ChunkView::new(
                    id,
                    chunk,
                    archetype.layout(),
                    &archetype.chunks()[chunk],
                    self.registry,
                ));
            }
            self.archetype_index += 1;
            self.chunk_index = 0;
        }
    }
}

/// Detached pull iterator with a structural-change guard
#[derive(Debug, Clone)]
pub struct ChunkCursor {
    manager: u64,
    query: QueryId,
    snapshot: Vec<(ArchetypeId, u32)>,
    archetype_index: usize,
    chunk_index: usize,
    /// Archetype, chunk index, buffer address and reuse sequence of the chunk yielded last
    last: Option<(ArchetypeId, usize, usize, u32)>,
}

impl ChunkCursor {
    pub(crate) fn new(manager: u64, query: QueryId, snapshot: Vec<(ArchetypeId, u32)>) -> Self {
        Self {
            manager,
            query,
            snapshot,
            archetype_index: 0,
            chunk_index: 0,
            last: None,
        }
    }

    pub fn query(&self) -> QueryId {
        self.query
    }

    /// Advance to the next chunk.
    ///
    /// Fails if any archetype seen at creation had entities created, destroyed or moved
    /// since, or if the chunk yielded last was recycled.
    pub fn next<'m>(&mut self, manager: &'m mut EntityManager) -> Result<Option<ChunkViewMut<'m>>> {
        if manager.id() != self.manager {
            return Err(EcsError::WrongManager {
                expected: self.manager,
                found: manager.id(),
            });
        }
        self.validate(manager)?;

        let version = manager.next_change_version();
        let (store, registry) = manager.view_parts();
        loop {
            let Some(&(id, _)) = self.snapshot.get(self.archetype_index) else {
                self.last = None;
                return Ok(None);
            };
            if self.chunk_index < store.get_checked(id)?.chunk_count() {
                let chunk = self.chunk_index;
                self.chunk_index += 1;
                let (layout, chunks) = store.get_mut(id).parts_mut();
                let target = &mut chunks[chunk];
                self.last = Some((id, chunk, target.address(), target.sequence()));
                return Ok(Some(ChunkViewMut::new(id, chunk, layout, target, registry, version)));
            }
            self.archetype_index += 1;
            self.chunk_index = 0;
        }
    }

    fn validate(&self, manager: &EntityManager) -> Result<()> {
        // Checked first: a recycled chunk also bumps the structural version.
        if let Some((id, chunk, address, sequence)) = self.last {
            let current = manager
                .archetype(id)?
                .chunk(chunk)
                .map(|c| (c.address(), c.sequence()));
            if current != Some((address, sequence)) {
                return Err(EcsError::ChunkRecycled { archetype: id, chunk });
            }
        }
        for &(id, expected) in &self.snapshot {
            let found = manager.archetype(id)?.structural_version();
            if found != expected {
                return Err(EcsError::IteratorInvalidated {
                    archetype: id,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
}
