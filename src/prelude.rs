//! Convenient re-exports of commonly used types.
//!
//! The prelude can be imported with:
//! ```
//! use chunk_ecs::prelude::*;
//! ```

pub use crate::archetype::ArchetypeId;
pub use crate::command::CommandBuffer;
pub use crate::component::{Bundle, Component, ComponentSet};
pub use crate::config::ManagerConfig;
pub use crate::entity::Entity;
pub use crate::error::{EcsError, Result};
pub use crate::iter::{ChunkView, ChunkViewMut};
pub use crate::manager::EntityManager;
pub use crate::pool::ChunkPool;
pub use crate::query::{QueryDesc, QueryId};
pub use crate::type_registry::{ComponentTypeId, TypeRegistry};
