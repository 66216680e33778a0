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

//! Fixed-size chunk storage
//!
//! A chunk is one 16 KiB, 64-byte aligned block holding up to `capacity` rows of a single
//! archetype in structure-of-arrays form: one contiguous sub-array per component type at an
//! offset computed once by [`ChunkLayout`]. The entity handle array always comes first.
//!
//! Rows `[0, count)` are always occupied. Removal patches the hole with rows taken from the
//! tail, and reports which rows received moved entities so the caller can fix indirection.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::type_registry::{ComponentTypeId, TypeInfo, ENTITY_TYPE_ID};
use crate::utils::{align_to, replicate};

/// Size of one chunk allocation in bytes
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Bytes available for row data. Chunk bookkeeping lives outside the block.
pub const CHUNK_PAYLOAD: usize = CHUNK_SIZE;

/// Alignment of every chunk allocation
pub const CHUNK_ALIGN: usize = 64;

#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct Block([u8; CHUNK_ALIGN]);

// SAFETY: `Block` is a byte array with no padding (size 64 == align 64).
unsafe impl Zeroable for Block {}
// SAFETY: every bit pattern of a byte array is valid.
unsafe impl Pod for Block {}

/// Owned, aligned 16 KiB allocation with a reuse sequence number.
///
/// The sequence number changes every time the pool takes the buffer back, so anything that
/// remembered `(buffer, sequence)` can tell the buffer was recycled.
pub struct ChunkBuffer {
    blocks: Box<[Block]>,
    sequence: u32,
}

impl ChunkBuffer {
    pub(crate) fn allocate() -> Self {
        Self {
            blocks: vec![Block::zeroed(); CHUNK_SIZE / CHUNK_ALIGN].into_boxed_slice(),
            sequence: 1,
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.blocks)
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.blocks)
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn bump_sequence(&mut self) {
        self.sequence = self.sequence.wrapping_add(1).max(1);
    }

    /// Address of the allocation, stable for the buffer's lifetime
    pub fn address(&self) -> usize {
        self.blocks.as_ptr() as usize
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Column offsets and row capacity for one archetype's chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    types: SmallVec<[ComponentTypeId; 8]>,
    sizes: SmallVec<[usize; 8]>,
    offsets: SmallVec<[usize; 8]>,
    capacity: usize,
    row_size: usize,
}

impl ChunkLayout {
    /// Compute the layout for `infos`, which must be sorted by id with the anchor first.
    pub fn new(infos: &[TypeInfo]) -> Result<Self> {
        debug_assert!(infos.first().is_some_and(|i| i.id == ENTITY_TYPE_ID));
        debug_assert!(infos.windows(2).all(|w| w[0].id < w[1].id));

        let row_size: usize = infos.iter().map(|i| i.size).sum();
        let mut capacity = CHUNK_PAYLOAD / row_size.max(1);
        while capacity > 0 && Self::footprint(infos, capacity) > CHUNK_PAYLOAD {
            capacity -= 1;
        }
        if capacity == 0 {
            return Err(EcsError::ArchetypeTooLarge {
                component_count: infos.len() - 1,
                footprint: row_size,
                payload: CHUNK_PAYLOAD,
            });
        }

        let mut offsets = SmallVec::with_capacity(infos.len());
        let mut offset = 0;
        for info in infos {
            offset = align_to(offset, info.align.min(CHUNK_ALIGN));
            offsets.push(offset);
            offset += info.size * capacity;
        }

        Ok(Self {
            types: infos.iter().map(|i| i.id).collect(),
            sizes: infos.iter().map(|i| i.size).collect(),
            offsets,
            capacity,
            row_size,
        })
    }

    fn footprint(infos: &[TypeInfo], capacity: usize) -> usize {
        infos.iter().fold(0, |offset, info| {
            align_to(offset, info.align.min(CHUNK_ALIGN)) + info.size * capacity
        })
    }

    /// Sorted type ids, anchor first
    #[inline]
    pub fn types(&self) -> &[ComponentTypeId] {
        &self.types
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per row across all columns
    #[inline]
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    #[inline]
    pub fn column_count(&self) -> usize {
        self.types.len()
    }

    /// Column index of a type
    #[inline]
    pub fn index_of(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.types.binary_search(&type_id).ok()
    }

    #[inline]
    pub fn size_at(&self, column: usize) -> usize {
        self.sizes[column]
    }

    #[inline]
    pub fn offset_at(&self, column: usize) -> usize {
        self.offsets[column]
    }

    /// Byte range of `rows` within a column
    #[inline]
    pub fn column_range(&self, column: usize, rows: Range<usize>) -> Range<usize> {
        let size = self.sizes[column];
        let base = self.offsets[column];
        base + rows.start * size..base + rows.end * size
    }
}

/// One leased buffer plus its occupancy and per-column write versions.
pub struct Chunk {
    buffer: ChunkBuffer,
    count: usize,
    versions: SmallVec<[u64; 8]>,
}

impl Chunk {
    pub fn new(buffer: ChunkBuffer, layout: &ChunkLayout) -> Self {
        Self {
            buffer,
            count: 0,
            versions: SmallVec::from_elem(0, layout.column_count()),
        }
    }

    /// Give the buffer back, typically to the pool
    pub fn into_buffer(self) -> ChunkBuffer {
        self.buffer
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn free_rows(&self, layout: &ChunkLayout) -> usize {
        layout.capacity() - self.count
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        self.buffer.sequence()
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.buffer.address()
    }

    /// Occupied entity handles
    #[inline]
    pub fn entities(&self, layout: &ChunkLayout) -> &[Entity] {
        bytemuck::cast_slice(self.column(layout, 0))
    }

    #[inline]
    pub(crate) fn entities_mut(&mut self, layout: &ChunkLayout, rows: Range<usize>) -> &mut [Entity] {
        let range = layout.column_range(0, rows);
        bytemuck::cast_slice_mut(&mut self.buffer.bytes_mut()[range])
    }

    /// Occupied bytes of one column
    #[inline]
    pub fn column(&self, layout: &ChunkLayout, column: usize) -> &[u8] {
        &self.buffer.bytes()[layout.column_range(column, 0..self.count)]
    }

    /// Occupied bytes of one column, mutable. Does not stamp a version.
    #[inline]
    pub fn column_mut(&mut self, layout: &ChunkLayout, column: usize) -> &mut [u8] {
        let range = layout.column_range(column, 0..self.count);
        &mut self.buffer.bytes_mut()[range]
    }

    /// One column mutably and another shared. The columns must differ.
    pub fn column_pair_mut(
        &mut self,
        layout: &ChunkLayout,
        write: usize,
        read: usize,
    ) -> (&mut [u8], &[u8]) {
        debug_assert_ne!(write, read);
        let w = layout.column_range(write, 0..self.count);
        let r = layout.column_range(read, 0..self.count);
        let bytes = self.buffer.bytes_mut();
        if write < read {
            let (head, tail) = bytes.split_at_mut(r.start);
            (&mut head[w], &tail[..r.len()])
        } else {
            let (head, tail) = bytes.split_at_mut(w.start);
            (&mut tail[..w.len()], &head[r])
        }
    }

    /// Broadcast one value over a row range of a column
    pub fn fill_column(&mut self, layout: &ChunkLayout, column: usize, rows: Range<usize>, value: &[u8]) {
        debug_assert!(rows.end <= self.count);
        debug_assert_eq!(value.len(), layout.size_at(column));
        let range = layout.column_range(column, rows);
        replicate(&mut self.buffer.bytes_mut()[range], value);
    }

    /// Bytes of one value
    #[inline]
    pub fn value(&self, layout: &ChunkLayout, column: usize, row: usize) -> &[u8] {
        debug_assert!(row < self.count);
        &self.buffer.bytes()[layout.column_range(column, row..row + 1)]
    }

    #[inline]
    pub fn value_mut(&mut self, layout: &ChunkLayout, column: usize, row: usize) -> &mut [u8] {
        debug_assert!(row < self.count);
        let range = layout.column_range(column, row..row + 1);
        &mut self.buffer.bytes_mut()[range]
    }

    /// Claim `n` rows at the end and zero them. Caller guarantees the space.
    pub fn push_rows(&mut self, layout: &ChunkLayout, n: usize) -> Range<usize> {
        debug_assert!(self.count + n <= layout.capacity());
        let rows = self.count..self.count + n;
        self.count += n;
        self.zero_rows(layout, rows.clone());
        rows
    }

    /// Zero every column of a row range
    pub fn zero_rows(&mut self, layout: &ChunkLayout, rows: Range<usize>) {
        let bytes = self.buffer.bytes_mut();
        for column in 0..layout.column_count() {
            bytes[layout.column_range(column, rows.clone())].fill(0);
        }
    }

    /// Copy rows between two chunks of the same archetype
    pub fn copy_rows_from(
        &mut self,
        layout: &ChunkLayout,
        src: &Chunk,
        src_row: usize,
        dst_row: usize,
        n: usize,
    ) {
        let src_bytes = src.buffer.bytes();
        let dst_bytes = self.buffer.bytes_mut();
        for column in 0..layout.column_count() {
            let from = layout.column_range(column, src_row..src_row + n);
            let to = layout.column_range(column, dst_row..dst_row + n);
            dst_bytes[to].copy_from_slice(&src_bytes[from]);
        }
    }

    /// Copy rows between chunks of different archetypes.
    ///
    /// Both type lists are sorted, so one merge walk pairs them: shared types are copied,
    /// destination-only types are zeroed and source-only types are dropped.
    pub fn copy_convert_from(
        &mut self,
        dst_layout: &ChunkLayout,
        dst_row: usize,
        src: &Chunk,
        src_layout: &ChunkLayout,
        src_row: usize,
        n: usize,
    ) {
        if dst_layout.types() == src_layout.types() {
            self.copy_rows_from(dst_layout, src, src_row, dst_row, n);
            return;
        }

        let src_bytes = src.buffer.bytes();
        let dst_bytes = self.buffer.bytes_mut();
        let src_types = src_layout.types();
        let mut s = 0;
        for (d, &dst_type) in dst_layout.types().iter().enumerate() {
            while s < src_types.len() && src_types[s] < dst_type {
                s += 1;
            }
            let to = dst_layout.column_range(d, dst_row..dst_row + n);
            if s < src_types.len() && src_types[s] == dst_type {
                let from = src_layout.column_range(s, src_row..src_row + n);
                dst_bytes[to].copy_from_slice(&src_bytes[from]);
                s += 1;
            } else {
                dst_bytes[to].fill(0);
            }
        }
    }

    /// Copy one row's values (entity handle excluded) into a packed prototype.
    pub fn read_prototype(&self, layout: &ChunkLayout, row: usize) -> SmallVec<[u8; 256]> {
        let mut proto = SmallVec::with_capacity(layout.row_size());
        for column in 1..layout.column_count() {
            proto.extend_from_slice(self.value(layout, column, row));
        }
        proto
    }

    /// Broadcast a prototype (from [`Chunk::read_prototype`] on the same layout) over `rows`.
    pub fn replicate_prototype(&mut self, layout: &ChunkLayout, proto: &[u8], rows: Range<usize>) {
        let bytes = self.buffer.bytes_mut();
        let mut at = 0;
        for column in 1..layout.column_count() {
            let size = layout.size_at(column);
            let value = &proto[at..at + size];
            at += size;
            replicate(&mut bytes[layout.column_range(column, rows.clone())], value);
        }
    }

    /// Remove `n` rows starting at `start`, refilling the hole from the tail.
    ///
    /// Returns the rows that now hold entities moved from the tail; their handles can be
    /// read back with [`Chunk::entities`].
    pub fn remove_rows(&mut self, layout: &ChunkLayout, start: usize, n: usize) -> Range<usize> {
        debug_assert!(start + n <= self.count);
        let after = self.count - (start + n);
        let moved = after.min(n);
        if moved > 0 {
            let src = self.count - moved;
            let bytes = self.buffer.bytes_mut();
            for column in 0..layout.column_count() {
                let from = layout.column_range(column, src..src + moved);
                let to = layout.column_range(column, start..start + moved);
                bytes.copy_within(from, to.start);
            }
        }
        self.count -= n;
        start..start + moved
    }

    /// Write version of a column
    #[inline]
    pub fn version(&self, column: usize) -> u64 {
        self.versions[column]
    }

    #[inline]
    pub fn stamp(&mut self, column: usize, version: u64) {
        self.versions[column] = version;
    }

    pub fn stamp_all(&mut self, version: u64) {
        self.versions.iter_mut().for_each(|v| *v = version);
    }

    /// True if the column was written after `version` was observed
    #[inline]
    pub fn changed_since(&self, column: usize, version: u64) -> bool {
        self.versions[column] > version
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("buffer", &self.buffer)
            .field("count", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_registry::TypeRegistry;

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Health(u32);

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Huge([u8; CHUNK_SIZE]);

    fn layout(registry: &TypeRegistry, ids: &[ComponentTypeId]) -> Result<ChunkLayout> {
        let mut all: Vec<ComponentTypeId> = vec![ENTITY_TYPE_ID];
        all.extend_from_slice(ids);
        all.sort();
        let infos: Vec<TypeInfo> = all.iter().map(|&id| registry.info(id).unwrap()).collect();
        ChunkLayout::new(&infos)
    }

    #[test]
    fn test_capacity_fits_payload() {
        let registry = TypeRegistry::new();
        let pos = registry.register::<Position>();
        let hp = registry.register::<Health>();
        let layout = layout(&registry, &[pos, hp]).unwrap();

        // 8 (entity) + 12 + 4 bytes per row
        assert_eq!(layout.row_size(), 24);
        assert_eq!(layout.capacity(), CHUNK_PAYLOAD / 24);
        let end = layout.offset_at(2) + layout.size_at(2) * layout.capacity();
        assert!(end <= CHUNK_PAYLOAD);
        assert!(layout.offset_at(1) >= layout.size_at(0) * layout.capacity());
    }

    #[test]
    fn test_oversized_layout_fails() {
        let registry = TypeRegistry::new();
        let huge = registry.register::<Huge>();
        assert!(matches!(
            layout(&registry, &[huge]),
            Err(EcsError::ArchetypeTooLarge { .. })
        ));
    }

    #[test]
    fn test_remove_rows_patches_from_tail() {
        let registry = TypeRegistry::new();
        let hp = registry.register::<Health>();
        let layout = layout(&registry, &[hp]).unwrap();
        let mut chunk = Chunk::new(ChunkBuffer::allocate(), &layout);

        let rows = chunk.push_rows(&layout, 5);
        for row in rows {
            chunk.entities_mut(&layout, row..row + 1)[0] = Entity {
                index: row as u32,
                version: 1,
            };
            chunk
                .value_mut(&layout, 1, row)
                .copy_from_slice(bytemuck::bytes_of(&Health(row as u32 * 10)));
        }

        let moved = chunk.remove_rows(&layout, 1, 2);
        assert_eq!(moved, 1..3);
        assert_eq!(chunk.len(), 3);
        let indices: Vec<u32> = chunk.entities(&layout).iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 3, 4]);
        let healths: &[Health] = bytemuck::cast_slice(chunk.column(&layout, 1));
        assert_eq!(healths, &[Health(0), Health(30), Health(40)]);

        // Removing the tail moves nothing
        let moved = chunk.remove_rows(&layout, 2, 1);
        assert!(moved.is_empty());
        assert_eq!(chunk.len(), 2);
    }

    #[test]
    fn test_copy_convert_zeroes_new_and_drops_missing() {
        let registry = TypeRegistry::new();
        let pos = registry.register::<Position>();
        let hp = registry.register::<Health>();
        let src_layout = layout(&registry, &[pos]).unwrap();
        let dst_layout = layout(&registry, &[hp, pos]).unwrap();

        let mut src = Chunk::new(ChunkBuffer::allocate(), &src_layout);
        src.push_rows(&src_layout, 1);
        let p = Position { x: 1.0, y: 2.0, z: 3.0 };
        src.value_mut(&src_layout, 1, 0)
            .copy_from_slice(bytemuck::bytes_of(&p));

        let mut dst = Chunk::new(ChunkBuffer::allocate(), &dst_layout);
        dst.push_rows(&dst_layout, 1);
        dst.value_mut(&dst_layout, 2, 0).fill(0xAB);
        dst.copy_convert_from(&dst_layout, 0, &src, &src_layout, 0, 1);

        let pos_col = dst_layout.index_of(pos).unwrap();
        let hp_col = dst_layout.index_of(hp).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<Position>(dst.value(&dst_layout, pos_col, 0)), p);
        assert_eq!(bytemuck::pod_read_unaligned::<Health>(dst.value(&dst_layout, hp_col, 0)), Health(0));
    }

    #[test]
    fn test_replicate_prototype() {
        let registry = TypeRegistry::new();
        let pos = registry.register::<Position>();
        let hp = registry.register::<Health>();
        let layout = layout(&registry, &[pos, hp]).unwrap();
        let mut chunk = Chunk::new(ChunkBuffer::allocate(), &layout);
        chunk.push_rows(&layout, 1);
        let p = Position { x: 4.0, y: 5.0, z: 6.0 };
        chunk.value_mut(&layout, 1, 0).copy_from_slice(bytemuck::bytes_of(&p));
        chunk.value_mut(&layout, 2, 0).copy_from_slice(bytemuck::bytes_of(&Health(7)));

        let proto = chunk.read_prototype(&layout, 0);
        let rows = chunk.push_rows(&layout, 100);
        chunk.replicate_prototype(&layout, &proto, rows);

        let positions: &[Position] = bytemuck::cast_slice(chunk.column(&layout, 1));
        let healths: &[Health] = bytemuck::cast_slice(chunk.column(&layout, 2));
        assert_eq!(positions.len(), 101);
        assert!(positions.iter().all(|&q| q == p));
        assert!(healths.iter().all(|&h| h == Health(7)));
    }

    #[test]
    fn test_versions() {
        let registry = TypeRegistry::new();
        let hp = registry.register::<Health>();
        let layout = layout(&registry, &[hp]).unwrap();
        let mut chunk = Chunk::new(ChunkBuffer::allocate(), &layout);
        assert!(!chunk.changed_since(1, 0));
        chunk.stamp(1, 5);
        assert!(chunk.changed_since(1, 4));
        assert!(!chunk.changed_since(1, 5));
        assert!(!chunk.changed_since(0, 0));
    }
}
