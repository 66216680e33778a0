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

//! Component and Bundle traits
//!
//! Components are fixed-layout values attached to entities. Rows are copied, zero-filled
//! and broadcast as raw bytes, so every component must be plain old data.
//! Tuples of components name type sets (`ComponentSet`) and carry values (`Bundle`).

use bytemuck::Pod;
use smallvec::{smallvec, SmallVec};

use crate::type_registry::{ComponentTypeId, TypeRegistry};

/// Maximum number of components supported by tuple implementations
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Inline list of component type ids
pub type TypeSet = SmallVec<[ComponentTypeId; MAX_BUNDLE_COMPONENTS]>;

/// Marker trait for components
///
/// Components must be `Pod`: the zero bit pattern is a valid default, and moving a row is a
/// byte copy.
pub trait Component: Pod + Send + Sync + 'static {}

/// Automatically implement Component for all valid types
impl<T: Pod + Send + Sync + 'static> Component for T {}

/// A compile-time set of component types
pub trait ComponentSet: 'static {
    /// Register every member and return the ids in declaration order
    fn register(registry: &TypeRegistry) -> TypeSet;
}

/// Component values written together when spawning
pub trait Bundle: ComponentSet + Send + Sync {
    /// Hand each component's bytes to `sink`, in declaration order
    fn write_components<F>(&self, ids: &[ComponentTypeId], sink: F)
    where
        F: FnMut(ComponentTypeId, &[u8]);
}

impl ComponentSet for () {
    fn register(_registry: &TypeRegistry) -> TypeSet {
        SmallVec::new()
    }
}

// Macro for tuple implementations
macro_rules! impl_bundle {
    ($($T:ident),*) => {
        impl<$($T: Component),*> ComponentSet for ($($T,)*) {
            fn register(registry: &TypeRegistry) -> TypeSet {
                smallvec![$(registry.register::<$T>()),*]
            }
        }

        impl<$($T: Component),*> Bundle for ($($T,)*) {
            #[allow(non_snake_case)]
            fn write_components<Sink>(&self, ids: &[ComponentTypeId], mut sink: Sink)
            where
                Sink: FnMut(ComponentTypeId, &[u8]),
            {
                let ($($T,)*) = self;
                let mut i = 0;
                $(
                    sink(ids[i], bytemuck::bytes_of($T));
                    i += 1;
                )*
                let _ = i;
            }
        }
    };
}

// Implement for tuples of 1-8 components
impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);
