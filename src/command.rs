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

//! Deferred structural commands
//!
//! Records are packed into chunks leased from the manager's pool:
//!
//! ```text
//! [kind: u32][payload len: u32][payload ...][pad to 8]
//! ```
//!
//! Operations that target existing entities are written as a *destination* record
//! (destroy, move, add, remove, set) followed by one or more entity batch records. A batch
//! that would overflow a chunk is split; the follow-up batches are flagged as continuations
//! so playback still applies the whole call at once.

use std::sync::Arc;

use smallvec::SmallVec;
#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::ArchetypeId;
use crate::chunk::{ChunkBuffer, CHUNK_PAYLOAD, CHUNK_SIZE};
use crate::component::Component;
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::manager::EntityManager;
use crate::pool::ChunkPool;
use crate::type_registry::{ComponentTypeId, TypeRegistry};
use crate::utils::align_to;

const HEADER: usize = 8;
const RECORD_ALIGN: usize = 8;
const ENTITY_SIZE: usize = std::mem::size_of::<Entity>();
/// Entities that fit one batch record
const MAX_BATCH: usize = (CHUNK_SIZE - HEADER - 8) / ENTITY_SIZE;
const BATCH_CONTINUED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum RecordKind {
    CreateEntities = 1,
    Instantiate = 2,
    Destroy = 3,
    Move = 4,
    AddComponent = 5,
    RemoveComponent = 6,
    SetComponent = 7,
    EntityBatch = 8,
}

impl RecordKind {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::CreateEntities,
            2 => Self::Instantiate,
            3 => Self::Destroy,
            4 => Self::Move,
            5 => Self::AddComponent,
            6 => Self::RemoveComponent,
            7 => Self::SetComponent,
            8 => Self::EntityBatch,
            _ => return None,
        })
    }
}

/// Decoded record, borrowing from the buffer
#[derive(Debug, Clone, Copy)]
enum Record<'a> {
    CreateEntities { archetype: ArchetypeId, count: usize, calls: u32 },
    Instantiate { source: Entity, count: usize, calls: u32 },
    Destroy,
    Move { archetype: ArchetypeId },
    AddComponent { type_id: ComponentTypeId, value: Option<&'a [u8]> },
    RemoveComponent { type_id: ComponentTypeId },
    SetComponent { type_id: ComponentTypeId, value: &'a [u8] },
    EntityBatch { entities: &'a [Entity], continued: bool },
}

/// Position of a record in the chunk chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordRef {
    chunk: usize,
    offset: usize,
}

/// Deferred mutation log bound to one manager
pub struct CommandBuffer {
    manager: u64,
    registry: Arc<TypeRegistry>,
    pool: Arc<ChunkPool>,
    coalesce: bool,
    /// Leased chunks and the bytes used in each
    chunks: Vec<(ChunkBuffer, usize)>,
    records: usize,
    last: Option<RecordRef>,
    /// Destination the most recent batches apply to, while nothing else was recorded since
    open_destination: Option<RecordRef>,
    disposed: bool,
}

impl CommandBuffer {
    pub(crate) fn new(manager: u64, registry: Arc<TypeRegistry>, pool: Arc<ChunkPool>, coalesce: bool) -> Self {
        Self {
            manager,
            registry,
            pool,
            coalesce,
            chunks: Vec::new(),
            records: 0,
            last: None,
            open_destination: None,
            disposed: false,
        }
    }

    /// Id of the manager this buffer plays back on
    pub fn manager_id(&self) -> u64 {
        self.manager
    }

    /// Number of records (coalesced records count once)
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Chunks currently leased for record storage
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ========== Recording ==========

    pub fn create_entity(&mut self, archetype: ArchetypeId) -> Result<()> {
        self.create_entities(archetype, 1)
    }

    /// Record the creation of `count` entities. Consecutive creations in the same archetype
    /// merge into one record.
    pub fn create_entities(&mut self, archetype: ArchetypeId, count: usize) -> Result<()> {
        self.check_live()?;
        if count == 0 {
            return Ok(());
        }
        self.open_destination = None;
        let mut remaining = count;
        if let Some(at) = self.coalescible(RecordKind::CreateEntities, |payload| {
            read_u32(payload, 0) == archetype.0
        }) {
            remaining -= self.grow_count(at, 4, remaining);
            self.grow_count(at, 8, 1);
        }
        while remaining > 0 {
            let n = remaining.min(u32::MAX as usize);
            let payload = self.reserve(RecordKind::CreateEntities, 12)?;
            write_u32(payload, 0, archetype.0);
            write_u32(payload, 4, n as u32);
            write_u32(payload, 8, 1);
            remaining -= n;
        }
        Ok(())
    }

    /// Record `count` copies of `source`. Consecutive copies of the same source merge.
    pub fn instantiate(&mut self, source: Entity, count: usize) -> Result<()> {
        self.check_live()?;
        if count == 0 {
            return Ok(());
        }
        self.open_destination = None;
        let mut remaining = count;
        if let Some(at) = self.coalescible(RecordKind::Instantiate, |payload| {
            read_u32(payload, 0) == source.index && read_u32(payload, 4) == source.version
        }) {
            remaining -= self.grow_count(at, 8, remaining);
            self.grow_count(at, 12, 1);
        }
        while remaining > 0 {
            let n = remaining.min(u32::MAX as usize);
            let payload = self.reserve(RecordKind::Instantiate, 16)?;
            write_u32(payload, 0, source.index);
            write_u32(payload, 4, source.version);
            write_u32(payload, 8, n as u32);
            write_u32(payload, 12, 1);
            remaining -= n;
        }
        Ok(())
    }

    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        self.destroy_entities(&[entity])
    }

    pub fn destroy_entities(&mut self, entities: &[Entity]) -> Result<()> {
        self.targeted(RecordKind::Destroy, &[], entities)
    }

    pub fn move_entities(&mut self, entities: &[Entity], destination: ArchetypeId) -> Result<()> {
        let mut payload = [0u8; 8];
        write_u32(&mut payload, 0, destination.0);
        self.targeted(RecordKind::Move, &payload, entities)
    }

    pub fn add_component<T: Component>(&mut self, entities: &[Entity], value: T) -> Result<()> {
        let type_id = self.registry.register::<T>();
        self.add_component_raw(entities, type_id, Some(bytemuck::bytes_of(&value)))
    }

    /// Untyped add; `None` leaves the new component zeroed.
    pub fn add_component_raw(&mut self, entities: &[Entity], type_id: ComponentTypeId, value: Option<&[u8]>) -> Result<()> {
        let value = value.unwrap_or(&[]);
        let has_value = u32::from(!value.is_empty());
        let mut payload: SmallVec<[u8; 64]> = SmallVec::from_elem(0, 8);
        write_u32(&mut payload, 0, type_id.0);
        write_u32(&mut payload, 4, has_value);
        payload.extend_from_slice(value);
        self.targeted(RecordKind::AddComponent, &payload, entities)
    }

    pub fn remove_component<T: Component>(&mut self, entities: &[Entity]) -> Result<()> {
        let type_id = self.registry.register::<T>();
        self.remove_component_raw(entities, type_id)
    }

    pub fn remove_component_raw(&mut self, entities: &[Entity], type_id: ComponentTypeId) -> Result<()> {
        let mut payload = [0u8; 8];
        write_u32(&mut payload, 0, type_id.0);
        self.targeted(RecordKind::RemoveComponent, &payload, entities)
    }

    pub fn set_component<T: Component>(&mut self, entities: &[Entity], value: T) -> Result<()> {
        let type_id = self.registry.register::<T>();
        self.set_component_raw(entities, type_id, bytemuck::bytes_of(&value))
    }

    pub fn set_component_raw(&mut self, entities: &[Entity], type_id: ComponentTypeId, value: &[u8]) -> Result<()> {
        let mut payload: SmallVec<[u8; 64]> = SmallVec::from_elem(0, 8);
        write_u32(&mut payload, 0, type_id.0);
        payload.extend_from_slice(value);
        self.targeted(RecordKind::SetComponent, &payload, entities)
    }

    // ========== Playback ==========

    /// Replay every record, in order, on `manager`.
    ///
    /// Returns the handles of entities created or instantiated by the buffer, in record
    /// order. With `clear_after` the buffer is emptied (and its chunks returned) afterwards.
    pub fn playback(&mut self, manager: &mut EntityManager, clear_after: bool) -> Result<Vec<Entity>> {
        self.check_live()?;
        if manager.id() != self.manager {
            return Err(EcsError::WrongManager {
                expected: self.manager,
                found: manager.id(),
            });
        }
        #[cfg(feature = "profiling")]
        let span = info_span!("command_buffer.playback", records = self.records, chunks = self.chunks.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let mut created = Vec::new();
        let mut destination: Option<Record<'_>> = None;
        let mut pending: Vec<Entity> = Vec::new();

        for record in RecordIter::new(&self.chunks) {
            let record = record?;
            if let Record::EntityBatch { entities, continued } = record {
                if !continued {
                    apply_batch(manager, destination, &mut pending)?;
                }
                pending.extend_from_slice(entities);
                continue;
            }

            apply_batch(manager, destination, &mut pending)?;
            match record {
                // A merged record stands for `calls` direct calls; each would have taken a version.
                Record::CreateEntities { archetype, count, calls } => {
                    manager.create_entities_into(archetype, count, &mut created)?;
                    manager.advance_change_version(u64::from(calls.saturating_sub(1)));
                }
                Record::Instantiate { source, count, calls } => {
                    if manager.instantiate_into(source, count, &mut created) > 0 {
                        manager.advance_change_version(u64::from(calls.saturating_sub(1)));
                    }
                }
                other => destination = Some(other),
            }
        }
        apply_batch(manager, destination, &mut pending)?;

        if clear_after {
            self.release_chunks();
        }
        Ok(created)
    }

    /// Drop every record and return the storage chunks to the pool.
    pub fn clear(&mut self) -> Result<()> {
        self.check_live()?;
        self.release_chunks();
        Ok(())
    }

    /// Release storage and refuse any further use.
    pub fn dispose(&mut self) -> Result<()> {
        self.check_live()?;
        self.release_chunks();
        self.disposed = true;
        Ok(())
    }

    // ========== Internal ==========

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            Err(EcsError::CommandBufferDisposed)
        } else {
            Ok(())
        }
    }

    fn release_chunks(&mut self) {
        for (buffer, _) in self.chunks.drain(..) {
            self.pool.release(buffer);
        }
        self.records = 0;
        self.last = None;
        self.open_destination = None;
    }

    /// Append a record header and return its zeroed payload.
    fn reserve(&mut self, kind: RecordKind, payload: usize) -> Result<&mut [u8]> {
        let size = align_to(HEADER + payload, RECORD_ALIGN);
        if size > CHUNK_SIZE {
            return Err(EcsError::ArchetypeTooLarge {
                component_count: 1,
                footprint: payload,
                payload: CHUNK_PAYLOAD,
            });
        }
        let full = self
            .chunks
            .last()
            .map_or(true, |(_, used)| used + size > CHUNK_SIZE);
        if full {
            self.chunks.push((self.pool.acquire(), 0));
        }

        let chunk = self.chunks.len() - 1;
        let (buffer, used) = &mut self.chunks[chunk];
        let offset = *used;
        *used += size;
        self.records += 1;
        self.last = Some(RecordRef { chunk, offset });

        let record = &mut buffer.bytes_mut()[offset..offset + size];
        record.fill(0);
        write_u32(record, 0, kind as u32);
        write_u32(record, 4, payload as u32);
        Ok(&mut record[HEADER..HEADER + payload])
    }

    /// The last record, if coalescing is on and it is `kind` with a payload accepted by
    /// `same_target`.
    fn coalescible<F>(&self, kind: RecordKind, same_target: F) -> Option<RecordRef>
    where
        F: FnOnce(&[u8]) -> bool,
    {
        if !self.coalesce {
            return None;
        }
        let at = self.last?;
        let (last_kind, payload) = self.record_at(at);
        (last_kind == kind as u32 && same_target(payload)).then_some(at)
    }

    /// Add up to `extra` to the u32 count at `field` of a record; returns how much was added.
    fn grow_count(&mut self, at: RecordRef, field: usize, extra: usize) -> usize {
        let payload = &mut self.chunks[at.chunk].0.bytes_mut()[at.offset + HEADER..];
        let count = read_u32(payload, field) as usize;
        let added = extra.min(u32::MAX as usize - count);
        write_u32(payload, field, (count + added) as u32);
        added
    }

    fn record_at(&self, at: RecordRef) -> (u32, &[u8]) {
        let bytes = &self.chunks[at.chunk].0.bytes()[at.offset..];
        let kind = read_u32(bytes, 0);
        let len = read_u32(bytes, 4) as usize;
        (kind, &bytes[HEADER..HEADER + len])
    }

    /// Record a destination (reusing the open one if identical) followed by entity batches.
    fn targeted(&mut self, kind: RecordKind, payload: &[u8], entities: &[Entity]) -> Result<()> {
        self.check_live()?;
        if entities.is_empty() {
            return Ok(());
        }
        let reuse = self.coalesce
            && self.open_destination.is_some_and(|at| {
                let (open_kind, open_payload) = self.record_at(at);
                open_kind == kind as u32 && open_payload == payload
            });
        if !reuse {
            self.reserve(kind, payload.len())?.copy_from_slice(payload);
            self.open_destination = self.last;
        }

        for (i, batch) in entities.chunks(MAX_BATCH).enumerate() {
            let record = self.reserve(RecordKind::EntityBatch, 8 + batch.len() * ENTITY_SIZE)?;
            write_u32(record, 0, batch.len() as u32);
            write_u32(record, 4, if i > 0 { BATCH_CONTINUED } else { 0 });
            record[8..].copy_from_slice(bytemuck::cast_slice(batch));
        }
        Ok(())
    }
}

/// Apply the pending entity group to its destination and clear it.
fn apply_batch(manager: &mut EntityManager, destination: Option<Record<'_>>, pending: &mut Vec<Entity>) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    match destination {
        Some(Record::Destroy) => {
            manager.destroy_entities(pending);
        }
        Some(Record::Move { archetype }) => {
            manager.move_entities(pending, archetype)?;
        }
        Some(Record::AddComponent { type_id, value }) => {
            manager.add_component_raw(pending, type_id, value)?;
        }
        Some(Record::RemoveComponent { type_id }) => {
            manager.remove_component_raw(pending, type_id)?;
        }
        Some(Record::SetComponent { type_id, value }) => {
            manager.set_component_raw(pending, type_id, value)?;
        }
        _ => {
            return Err(EcsError::DeserializationError(
                "entity batch without a destination record".to_string(),
            ))
        }
    }
    pending.clear();
    Ok(())
}

struct RecordIter<'a> {
    chunks: &'a [(ChunkBuffer, usize)],
    chunk: usize,
    offset: usize,
}

impl<'a> RecordIter<'a> {
    fn new(chunks: &'a [(ChunkBuffer, usize)]) -> Self {
        Self {
            chunks,
            chunk: 0,
            offset: 0,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (buffer, used) = loop {
            let (buffer, used) = self.chunks.get(self.chunk)?;
            if self.offset < *used {
                break (buffer, *used);
            }
            self.chunk += 1;
            self.offset = 0;
        };

        let bytes = &buffer.bytes()[self.offset..used];
        let kind = read_u32(bytes, 0);
        let len = read_u32(bytes, 4) as usize;
        self.offset += align_to(HEADER + len, RECORD_ALIGN);
        Some(decode(kind, &bytes[HEADER..HEADER + len]))
    }
}

fn decode(kind: u32, payload: &[u8]) -> Result<Record<'_>> {
    let kind = RecordKind::from_u32(kind)
        .ok_or_else(|| EcsError::DeserializationError(format!("unknown command record kind {kind}")))?;
    Ok(match kind {
        RecordKind::CreateEntities => Record::CreateEntities {
            archetype: ArchetypeId(read_u32(payload, 0)),
            count: read_u32(payload, 4) as usize,
            calls: read_u32(payload, 8),
        },
        RecordKind::Instantiate => Record::Instantiate {
            source: Entity {
                index: read_u32(payload, 0),
                version: read_u32(payload, 4),
            },
            count: read_u32(payload, 8) as usize,
            calls: read_u32(payload, 12),
        },
        RecordKind::Destroy => Record::Destroy,
        RecordKind::Move => Record::Move {
            archetype: ArchetypeId(read_u32(payload, 0)),
        },
        RecordKind::AddComponent => Record::AddComponent {
            type_id: ComponentTypeId(read_u32(payload, 0)),
            value: (read_u32(payload, 4) != 0).then(|| &payload[8..]),
        },
        RecordKind::RemoveComponent => Record::RemoveComponent {
            type_id: ComponentTypeId(read_u32(payload, 0)),
        },
        RecordKind::SetComponent => Record::SetComponent {
            type_id: ComponentTypeId(read_u32(payload, 0)),
            value: &payload[8..],
        },
        RecordKind::EntityBatch => {
            let count = read_u32(payload, 0) as usize;
            let entities = bytemuck::try_cast_slice(&payload[8..8 + count * ENTITY_SIZE])
                .map_err(|e| EcsError::DeserializationError(format!("misaligned entity batch: {e}")))?;
            Record::EntityBatch {
                entities,
                continued: read_u32(payload, 4) & BATCH_CONTINUED != 0,
            }
        }
    })
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

#[inline]
fn write_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.release_chunks();
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("manager", &self.manager)
            .field("records", &self.records)
            .field("chunks", &self.chunks.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}
