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

//! Archetype registry and per-archetype chunk lists
//!
//! An archetype is identified by its sorted, deduplicated component type set (the entity
//! anchor always first). Archetypes are created on first reference and never destroyed, so
//! an `ArchetypeId` is a stable index for the lifetime of its store.

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::chunk::{Chunk, ChunkBuffer, ChunkLayout};
use crate::error::{EcsError, Result};
use crate::hash::{hash_ids, DedupMap};
use crate::type_registry::{ComponentTypeId, TypeInfo, TypeRegistry, ENTITY_TYPE_ID};

/// Maximum number of component types in one archetype (anchor excluded)
pub const MAX_ARCHETYPE_COMPONENTS: usize = 64;

/// Stable archetype handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchetypeId(pub u32);

impl ArchetypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Component signature (sorted, anchor first)
pub type ArchetypeSignature = SmallVec<[ComponentTypeId; 8]>;

/// Archetype: chunked Structure of Arrays storage for one type set
pub struct Archetype {
    id: ArchetypeId,
    layout: ChunkLayout,
    chunks: Vec<Chunk>,
    entity_count: usize,
    structural_version: u32,
    /// Highest write version of each column among chunks already returned to the pool
    retired_versions: SmallVec<[u64; 8]>,
}

impl Archetype {
    fn new(id: ArchetypeId, layout: ChunkLayout) -> Self {
        let columns = layout.column_count();
        Self {
            id,
            layout,
            chunks: Vec::new(),
            entity_count: 0,
            structural_version: 0,
            retired_versions: SmallVec::from_elem(0, columns),
        }
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Sorted type ids, entity anchor first
    #[inline]
    pub fn signature(&self) -> &[ComponentTypeId] {
        self.layout.types()
    }

    /// Sorted component type ids without the anchor
    #[inline]
    pub fn component_types(&self) -> &[ComponentTypeId] {
        &self.layout.types()[1..]
    }

    #[inline]
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    #[inline]
    pub fn has(&self, type_id: ComponentTypeId) -> bool {
        self.layout.index_of(type_id).is_some()
    }

    /// Rows per chunk
    #[inline]
    pub fn chunk_capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Number of entities
    #[inline]
    pub fn len(&self) -> usize {
        self.entity_count
    }

    /// Check if archetype is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    #[inline]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[inline]
    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    #[inline]
    pub(crate) fn chunk_mut(&mut self, index: usize) -> &mut Chunk {
        &mut self.chunks[index]
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Counter bumped by every membership change (never by value writes)
    #[inline]
    pub fn structural_version(&self) -> u32 {
        self.structural_version
    }

    #[inline]
    pub(crate) fn bump_structural_version(&mut self) {
        self.structural_version = self.structural_version.wrapping_add(1);
    }

    /// Last write version of a column across all chunks
    pub fn type_version(&self, column: usize) -> u64 {
        self.chunks
            .iter()
            .map(|chunk| chunk.version(column))
            .fold(self.retired_versions[column], u64::max)
    }

    /// True if any chunk wrote `type_id` after `version` was observed
    pub fn changed_since(&self, type_id: ComponentTypeId, version: u64) -> bool {
        self.layout
            .index_of(type_id)
            .is_some_and(|column| self.type_version(column) > version)
    }

    /// Stamp a value write to one column of one chunk
    #[inline]
    pub(crate) fn record_write(&mut self, chunk: usize, column: usize, version: u64) {
        self.chunks[chunk].stamp(column, version);
    }

    /// Layout and chunks borrowed apart, for writing several chunks at once
    #[inline]
    pub(crate) fn parts_mut(&mut self) -> (&ChunkLayout, &mut [Chunk]) {
        (&self.layout, &mut self.chunks)
    }

    /// First chunk at or after `from` with a free row
    pub(crate) fn first_free_chunk(&self, from: usize) -> Option<usize> {
        let capacity = self.layout.capacity();
        self.chunks
            .iter()
            .skip(from)
            .position(|chunk| chunk.len() < capacity)
            .map(|i| i + from)
    }

    pub(crate) fn push_chunk(&mut self, buffer: ChunkBuffer) -> usize {
        self.chunks.push(Chunk::new(buffer, &self.layout));
        self.chunks.len() - 1
    }

    /// Detach an empty chunk. The last chunk takes its slot; returns the buffer and
    /// whether a chunk was moved into `index`.
    pub(crate) fn take_chunk(&mut self, index: usize) -> (ChunkBuffer, bool) {
        debug_assert!(self.chunks[index].is_empty());
        let chunk = self.chunks.swap_remove(index);
        self.retire_versions(&chunk);
        (chunk.into_buffer(), index < self.chunks.len())
    }

    #[inline]
    pub(crate) fn add_entities(&mut self, n: usize) {
        self.entity_count += n;
    }

    #[inline]
    pub(crate) fn remove_entities(&mut self, n: usize) {
        self.entity_count -= n;
    }

    pub(crate) fn drain_chunks(&mut self) -> Vec<ChunkBuffer> {
        self.entity_count = 0;
        self.bump_structural_version();
        let chunks = std::mem::take(&mut self.chunks);
        chunks
            .into_iter()
            .map(|chunk| {
                self.retire_versions(&chunk);
                chunk.into_buffer()
            })
            .collect()
    }

    fn retire_versions(&mut self, chunk: &Chunk) {
        for (column, retired) in self.retired_versions.iter_mut().enumerate() {
            *retired = (*retired).max(chunk.version(column));
        }
    }
}

impl std::fmt::Debug for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("types", &self.signature())
            .field("entities", &self.entity_count)
            .field("chunks", &self.chunks.len())
            .field("capacity", &self.layout.capacity())
            .finish()
    }
}

/// Deduplicating archetype registry
pub struct ArchetypeStore {
    registry: Arc<TypeRegistry>,
    archetypes: Vec<Archetype>,
    index: DedupMap<ArchetypeId>,
    /// Cache for single-type add (`true`) / remove (`false`) edges
    transitions: AHashMap<(ArchetypeId, ComponentTypeId, bool), ArchetypeId>,
}

impl ArchetypeStore {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self::with_capacity(registry, 64)
    }

    pub fn with_capacity(registry: Arc<TypeRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            archetypes: Vec::with_capacity(capacity),
            index: DedupMap::with_capacity(capacity),
            transitions: AHashMap::with_capacity(capacity * 2),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Resolve a type set to its archetype, creating it on first reference.
    ///
    /// Order and duplicates in `types` do not matter; the anchor may be included or not.
    pub fn get_or_create(&mut self, types: &[ComponentTypeId]) -> Result<ArchetypeId> {
        let signature = normalize(types);
        self.get_or_create_sorted(signature)
    }

    fn get_or_create_sorted(&mut self, signature: ArchetypeSignature) -> Result<ArchetypeId> {
        let code = hash_ids(signature.iter().map(|id| id.0));
        let archetypes = &self.archetypes;
        if let Some(id) = self
            .index
            .find(code, |id| archetypes[id.index()].signature() == signature.as_slice())
        {
            return Ok(id);
        }

        if signature.len() - 1 > MAX_ARCHETYPE_COMPONENTS {
            return Err(EcsError::TooManyComponents {
                count: signature.len() - 1,
                max: MAX_ARCHETYPE_COMPONENTS,
            });
        }

        let mut infos: SmallVec<[TypeInfo; 8]> = SmallVec::with_capacity(signature.len());
        for &type_id in &signature {
            let info = self
                .registry
                .info(type_id)
                .ok_or(EcsError::ComponentNotRegistered("<unknown component id>"))?;
            infos.push(info);
        }
        // Oversized archetypes fail here, before anything references them.
        let layout = ChunkLayout::new(&infos)?;

        let id = ArchetypeId(self.archetypes.len() as u32);
        #[cfg(feature = "profiling")]
        tracing::debug!(
            archetype = id.0,
            components = signature.len() - 1,
            capacity = layout.capacity(),
            "archetype registered"
        );
        self.archetypes.push(Archetype::new(id, layout));
        self.index.insert(code, id);
        Ok(id)
    }

    /// Archetype with the types of `base` plus `types`
    pub fn extend(&mut self, base: ArchetypeId, types: &[ComponentTypeId]) -> Result<ArchetypeId> {
        let mut signature: ArchetypeSignature = self.get_checked(base)?.signature().into();
        signature.extend_from_slice(types);
        self.get_or_create(&signature)
    }

    /// Archetype with the types of `base` minus `types` (the anchor is never removed)
    pub fn exclude(&mut self, base: ArchetypeId, types: &[ComponentTypeId]) -> Result<ArchetypeId> {
        let signature: ArchetypeSignature = self
            .get_checked(base)?
            .signature()
            .iter()
            .copied()
            .filter(|id| *id == ENTITY_TYPE_ID || !types.contains(id))
            .collect();
        self.get_or_create_sorted(signature)
    }

    /// Archetype with the union of both type sets
    pub fn combine(&mut self, a: ArchetypeId, b: ArchetypeId) -> Result<ArchetypeId> {
        let mut signature: ArchetypeSignature = self.get_checked(a)?.signature().into();
        signature.extend_from_slice(self.get_checked(b)?.signature());
        self.get_or_create(&signature)
    }

    /// Cached single-type add edge
    pub fn with_component(&mut self, base: ArchetypeId, type_id: ComponentTypeId) -> Result<ArchetypeId> {
        if let Some(&id) = self.transitions.get(&(base, type_id, true)) {
            return Ok(id);
        }
        let id = self.extend(base, &[type_id])?;
        self.transitions.insert((base, type_id, true), id);
        Ok(id)
    }

    /// Cached single-type remove edge
    pub fn without_component(&mut self, base: ArchetypeId, type_id: ComponentTypeId) -> Result<ArchetypeId> {
        if let Some(&id) = self.transitions.get(&(base, type_id, false)) {
            return Ok(id);
        }
        let id = self.exclude(base, &[type_id])?;
        self.transitions.insert((base, type_id, false), id);
        Ok(id)
    }

    /// Get archetype by ID
    #[inline]
    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index())
    }

    #[inline]
    pub fn get_checked(&self, id: ArchetypeId) -> Result<&Archetype> {
        self.archetypes
            .get(id.index())
            .ok_or(EcsError::ArchetypeNotFound(id))
    }

    /// Get archetype mutably
    #[inline]
    pub(crate) fn get_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }

    /// Borrow two distinct archetypes mutably
    pub(crate) fn pair_mut(&mut self, a: ArchetypeId, b: ArchetypeId) -> (&mut Archetype, &mut Archetype) {
        debug_assert_ne!(a, b);
        let (ai, bi) = (a.index(), b.index());
        if ai < bi {
            let (left, right) = self.archetypes.split_at_mut(bi);
            (&mut left[ai], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(ai);
            (&mut right[0], &mut left[bi])
        }
    }

    /// Get all archetypes, in creation order
    #[inline]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub(crate) fn archetypes_mut(&mut self) -> &mut [Archetype] {
        &mut self.archetypes
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }
}

/// Sort, dedup and anchor a type list.
pub fn normalize(types: &[ComponentTypeId]) -> ArchetypeSignature {
    let mut signature: ArchetypeSignature = SmallVec::with_capacity(types.len() + 1);
    signature.push(ENTITY_TYPE_ID);
    signature.extend(types.iter().copied().filter(|&id| id != ENTITY_TYPE_ID));
    signature[1..].sort_unstable();
    signature.dedup();
    signature
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CHUNK_SIZE;

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position([f32; 3]);

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Rotation([f32; 4]);

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Scale(f32);

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Blob([u8; CHUNK_SIZE / 2]);

    fn store() -> (ArchetypeStore, [ComponentTypeId; 3]) {
        let registry = Arc::new(TypeRegistry::new());
        let ids = [
            registry.register::<Position>(),
            registry.register::<Rotation>(),
            registry.register::<Scale>(),
        ];
        (ArchetypeStore::new(registry), ids)
    }

    #[test]
    fn test_archetype_identity_is_order_independent() {
        let (mut store, [p, r, s]) = store();
        let a = store.get_or_create(&[p, r, s]).unwrap();
        let b = store.get_or_create(&[s, p, r]).unwrap();
        let c = store.get_or_create(&[r, r, s, p, ENTITY_TYPE_ID]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(a).unwrap().signature(), &[ENTITY_TYPE_ID, p, r, s]);
    }

    #[test]
    fn test_extend_exclude_combine() {
        let (mut store, [p, r, s]) = store();
        let pos = store.get_or_create(&[p]).unwrap();
        let pos_rot = store.extend(pos, &[r]).unwrap();
        assert_eq!(store.get(pos_rot).unwrap().component_types(), &[p, r]);
        assert_eq!(store.exclude(pos_rot, &[r]).unwrap(), pos);

        let scale = store.get_or_create(&[s]).unwrap();
        let all = store.combine(pos_rot, scale).unwrap();
        assert_eq!(store.get(all).unwrap().component_types(), &[p, r, s]);

        assert_eq!(store.with_component(pos, r).unwrap(), pos_rot);
        assert_eq!(store.with_component(pos, r).unwrap(), pos_rot);
        assert_eq!(store.without_component(pos_rot, r).unwrap(), pos);
    }

    #[test]
    fn test_empty_archetype_holds_only_entities() {
        let (mut store, _) = store();
        let empty = store.get_or_create(&[]).unwrap();
        let archetype = store.get(empty).unwrap();
        assert!(archetype.component_types().is_empty());
        assert_eq!(archetype.chunk_capacity(), CHUNK_SIZE / 8);
    }

    #[test]
    fn test_oversized_fails_at_creation() {
        let (mut store, [p, ..]) = store();
        let blob = store.registry().register::<Blob>();
        let blob2 = store.registry().register::<[u8; CHUNK_SIZE / 2 + 1]>();
        let before = store.len();
        let err = store.get_or_create(&[blob, blob2, p]).unwrap_err();
        assert!(matches!(err, EcsError::ArchetypeTooLarge { component_count: 3, .. }));
        assert_eq!(store.len(), before);
    }

    #[test]
    fn test_foreign_id_is_rejected() {
        let (mut store, _) = store();
        assert_eq!(
            store.extend(ArchetypeId(42), &[]).unwrap_err(),
            EcsError::ArchetypeNotFound(ArchetypeId(42))
        );
    }
}
