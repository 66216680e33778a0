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

//! Chunk ECS - archetype-based entity/component storage
//!
//! Entities sharing a component set live in the same archetype, packed into pooled 16 KiB
//! chunks laid out column by column. Queries cache their matching archetypes, iteration hands
//! out whole chunks, and command buffers record structural changes for later playback.

pub mod archetype;
pub mod chunk;
pub mod command;
pub mod component;
pub mod config;
pub mod entity;
pub mod error;
pub mod hash;
pub mod iter;
pub mod manager;
pub mod pool;
pub mod prelude;
pub mod query;
pub mod snapshot;
pub mod type_registry;
pub mod utils;


pub use archetype::*;
pub use chunk::*;
pub use command::*;
pub use component::*;
pub use config::*;
pub use entity::*;
pub use error::*;
pub use iter::*;
pub use manager::*;
pub use pool::*;
pub use query::*;
pub use type_registry::*;
