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

//! Runtime component type registry
//!
//! Maps Rust types to small stable ids in registration order. The registry is an explicit
//! context object: every manager owns one, or several managers share one through an `Arc`
//! so that type ids agree between them.

use std::any::TypeId;
use std::hash::Hasher;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

use crate::component::Component;
use crate::entity::Entity;

/// Stable small id of a registered component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeId(pub u32);

impl ComponentTypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Anchor id for the per-row entity handle array. Every archetype starts with it.
pub const ENTITY_TYPE_ID: ComponentTypeId = ComponentTypeId(0);

/// Layout facts about a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub id: ComponentTypeId,
    pub type_id: TypeId,
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
    /// Content hash of the type name; survives process restarts of the same build.
    pub stable_hash: u64,
}

impl TypeInfo {
    fn of<T: 'static>(id: ComponentTypeId) -> Self {
        let name = std::any::type_name::<T>();
        Self {
            id,
            type_id: TypeId::of::<T>(),
            name,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            stable_hash: stable_name_hash(name),
        }
    }
}

/// Deterministic 64-bit hash of a type name.
pub fn stable_name_hash(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.write_u8(0xff);
    hasher.finish()
}

#[derive(Default)]
struct RegistryInner {
    infos: Vec<TypeInfo>,
    by_type: FxHashMap<TypeId, ComponentTypeId>,
    by_hash: FxHashMap<u64, ComponentTypeId>,
}

impl RegistryInner {
    fn push<T: 'static>(&mut self) -> ComponentTypeId {
        let id = ComponentTypeId(self.infos.len() as u32);
        let info = TypeInfo::of::<T>(id);
        self.by_type.insert(info.type_id, id);
        self.by_hash.insert(info.stable_hash, id);
        self.infos.push(info);
        id
    }
}

/// Registry for component types
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl TypeRegistry {
    /// Create new registry with the entity anchor pre-registered
    pub fn new() -> Self {
        let mut inner = RegistryInner::default();
        let anchor = inner.push::<Entity>();
        debug_assert_eq!(anchor, ENTITY_TYPE_ID);
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Register a type, returning its existing id if already known
    pub fn register<T: Component>(&self) -> ComponentTypeId {
        if let Some(id) = self.id_of::<T>() {
            return id;
        }
        let mut inner = self.inner.write();
        // Another thread may have won the race between the read and write lock.
        if let Some(&id) = inner.by_type.get(&TypeId::of::<T>()) {
            return id;
        }
        let id = inner.push::<T>();
        #[cfg(feature = "profiling")]
        tracing::debug!(
            component = std::any::type_name::<T>(),
            id = id.0,
            "component type registered"
        );
        id
    }

    /// Id of an already registered type
    pub fn id_of<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.inner.read().by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Id of the type whose name hashes to `stable_hash`
    pub fn id_by_stable_hash(&self, stable_hash: u64) -> Option<ComponentTypeId> {
        self.inner.read().by_hash.get(&stable_hash).copied()
    }

    /// Layout info by id
    pub fn info(&self, id: ComponentTypeId) -> Option<TypeInfo> {
        self.inner.read().infos.get(id.index()).copied()
    }

    /// Number of registered types, the anchor included
    pub fn len(&self) -> usize {
        self.inner.read().infos.len()
    }

    pub fn is_empty(&self) -> bool {
        // The anchor is always present.
        false
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Mass(f64);

    #[test]
    fn test_registration_order() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.len(), 1);

        let pos = registry.register::<Position>();
        let mass = registry.register::<Mass>();
        assert_eq!(pos, ComponentTypeId(1));
        assert_eq!(mass, ComponentTypeId(2));
        assert_eq!(registry.register::<Position>(), pos);
        assert_eq!(registry.id_of::<Mass>(), Some(mass));
        assert_eq!(registry.id_of::<u64>(), None);
    }

    #[test]
    fn test_info_and_stable_hash() {
        let registry = TypeRegistry::new();
        let id = registry.register::<Mass>();
        let info = registry.info(id).unwrap();
        assert_eq!(info.size, 8);
        assert_eq!(info.align, 8);
        assert_eq!(registry.id_by_stable_hash(info.stable_hash), Some(id));

        let anchor = registry.info(ENTITY_TYPE_ID).unwrap();
        assert_eq!(anchor.size, std::mem::size_of::<Entity>());
        assert_eq!(registry.register::<Entity>(), ENTITY_TYPE_ID);
    }
}
