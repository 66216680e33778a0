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

//! Error types

use std::fmt;

use crate::archetype::ArchetypeId;

/// ECS error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Entity not found (only reported by lookups that cannot answer with `None`)
    EntityNotFound,

    /// Archetype handle does not belong to this manager
    ArchetypeNotFound(ArchetypeId),

    /// Query handle does not belong to this manager
    QueryNotFound(u32),

    /// Component type was never registered
    ComponentNotRegistered(&'static str),

    /// Archetype footprint does not fit a single chunk
    ArchetypeTooLarge {
        component_count: usize,
        footprint: usize,
        payload: usize,
    },

    /// Archetype names more component types than supported
    TooManyComponents { count: usize, max: usize },

    /// Raw component bytes do not match the registered size
    ComponentSizeMismatch { expected: usize, found: usize },

    /// Structural change observed by an open iterator
    IteratorInvalidated {
        archetype: ArchetypeId,
        expected: u32,
        found: u32,
    },

    /// Chunk yielded by an open cursor was released or replaced before the next step
    ChunkRecycled { archetype: ArchetypeId, chunk: usize },

    /// Command buffer used after `dispose`
    CommandBufferDisposed,

    /// Command buffer played back on a manager other than the one that created it
    WrongManager { expected: u64, found: u64 },

    /// Serialization error
    SerializationError(String),

    /// Deserialization error
    DeserializationError(String),

    /// Configuration could not be parsed
    ConfigError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::EntityNotFound => write!(f, "Entity not found"),
            EcsError::ArchetypeNotFound(id) => write!(f, "Archetype not found: {id:?}"),
            EcsError::QueryNotFound(id) => write!(f, "Query not found: {id}"),
            EcsError::ComponentNotRegistered(name) => {
                write!(f, "Component type not registered: {name}")
            }
            EcsError::ArchetypeTooLarge {
                component_count,
                footprint,
                payload,
            } => write!(
                f,
                "Archetype with {component_count} components needs {footprint} bytes per entity, chunk payload is {payload}"
            ),
            EcsError::TooManyComponents { count, max } => {
                write!(f, "Too many components in archetype: {count} (max {max})")
            }
            EcsError::ComponentSizeMismatch { expected, found } => {
                write!(f, "Component size mismatch: expected {expected} bytes, found {found}")
            }
            EcsError::IteratorInvalidated {
                archetype,
                expected,
                found,
            } => write!(
                f,
                "Structural change during iteration of {archetype:?} (version {expected} -> {found})"
            ),
            EcsError::ChunkRecycled { archetype, chunk } => {
                write!(f, "Chunk {chunk} of {archetype:?} was recycled during iteration")
            }
            EcsError::CommandBufferDisposed => write!(f, "Command buffer used after dispose"),
            EcsError::WrongManager { expected, found } => write!(
                f,
                "Command buffer belongs to manager {expected}, played back on manager {found}"
            ),
            EcsError::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            EcsError::DeserializationError(msg) => write!(f, "Deserialization error: {msg}"),
            EcsError::ConfigError(msg) => write!(f, "Config error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

impl From<serde_json::Error> for EcsError {
    fn from(err: serde_json::Error) -> Self {
        EcsError::ConfigError(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;

impl EcsError {
    /// True for failures raised by the cooperative mutation-safety checks.
    pub fn is_concurrency_violation(&self) -> bool {
        matches!(
            self,
            EcsError::IteratorInvalidated { .. }
                | EcsError::ChunkRecycled { .. }
                | EcsError::CommandBufferDisposed
        )
    }
}
