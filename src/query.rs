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

//! Query system with archetype filtering
//!
//! A query is a sorted include set and a sorted exclude set. Matching an archetype is one
//! merge walk over the three sorted lists. Each registered query caches the archetypes it
//! matched plus how many archetypes it has already tested; archetypes are append-only, so a
//! refresh only tests the ones created since.

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::TypeSet;
use crate::hash::{hash_ids, DedupMap};
use crate::type_registry::{ComponentTypeId, ENTITY_TYPE_ID};

/// Stable query handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u32);

impl QueryId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Include/exclude type sets, compared independent of declaration order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QueryDesc {
    include: TypeSet,
    exclude: TypeSet,
}

impl QueryDesc {
    pub fn new(include: &[ComponentTypeId], exclude: &[ComponentTypeId]) -> Self {
        Self {
            include: sorted_set(include),
            exclude: sorted_set(exclude),
        }
    }

    /// Matches every archetype
    pub fn universal() -> Self {
        Self::default()
    }

    pub fn include(&self) -> &[ComponentTypeId] {
        &self.include
    }

    pub fn exclude(&self) -> &[ComponentTypeId] {
        &self.exclude
    }

    pub fn is_universal(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    fn code(&self) -> u32 {
        hash_ids(
            self.include
                .iter()
                .map(|id| id.0)
                .chain(std::iter::once(u32::MAX))
                .chain(self.exclude.iter().map(|id| id.0)),
        )
    }

    /// Test a sorted archetype signature.
    ///
    /// Stops at the first missing required type or present excluded type.
    pub fn matches(&self, types: &[ComponentTypeId]) -> bool {
        if self.is_universal() {
            return true;
        }
        let mut t = 0;
        for &required in &self.include {
            while t < types.len() && types[t] < required {
                t += 1;
            }
            if t == types.len() || types[t] != required {
                return false;
            }
            t += 1;
        }

        let mut t = 0;
        for &forbidden in &self.exclude {
            while t < types.len() && types[t] < forbidden {
                t += 1;
            }
            if t < types.len() && types[t] == forbidden {
                return false;
            }
        }
        true
    }

    /// True if this query requires a type the other query requires or forbids.
    pub fn intersects(&self, other: &QueryDesc) -> bool {
        let (mut i, mut x) = (0, 0);
        for &required in &self.include {
            while i < other.include.len() && other.include[i] < required {
                i += 1;
            }
            while x < other.exclude.len() && other.exclude[x] < required {
                x += 1;
            }
            let in_include = i < other.include.len() && other.include[i] == required;
            let in_exclude = x < other.exclude.len() && other.exclude[x] == required;
            if in_include || in_exclude {
                return true;
            }
        }
        false
    }
}

fn sorted_set(ids: &[ComponentTypeId]) -> TypeSet {
    let mut set: TypeSet = ids
        .iter()
        .copied()
        .filter(|&id| id != ENTITY_TYPE_ID)
        .collect();
    set.sort_unstable();
    set.dedup();
    set
}

/// Registered query with its cached archetype matches
#[derive(Debug, Clone)]
pub struct Query {
    id: QueryId,
    desc: QueryDesc,
    matched: Vec<ArchetypeId>,
    seen_archetypes: usize,
}

impl Query {
    fn new(id: QueryId, desc: QueryDesc) -> Self {
        Self {
            id,
            desc,
            matched: Vec::new(),
            seen_archetypes: 0,
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn desc(&self) -> &QueryDesc {
        &self.desc
    }

    /// Cached matches as of the last refresh
    pub fn matched(&self) -> &[ArchetypeId] {
        &self.matched
    }

    /// Archetype count at the last refresh
    pub fn seen_archetypes(&self) -> usize {
        self.seen_archetypes
    }

    /// Test only archetypes created since the last refresh
    pub fn refresh(&mut self, archetypes: &[Archetype]) {
        if archetypes.len() <= self.seen_archetypes {
            return;
        }
        #[cfg(feature = "profiling")]
        let span = info_span!(
            "query.refresh",
            query = self.id.0,
            new_archetypes = archetypes.len() - self.seen_archetypes
        );
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        for archetype in &archetypes[self.seen_archetypes..] {
            if self.desc.matches(archetype.signature()) {
                self.matched.push(archetype.id());
            }
        }
        self.seen_archetypes = archetypes.len();
    }
}

/// Deduplicating query registry
#[derive(Debug, Default)]
pub struct QueryStore {
    queries: Vec<Query>,
    index: DedupMap<QueryId>,
}

impl QueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a descriptor to its query, registering it on first use
    pub fn get_or_create(&mut self, desc: QueryDesc) -> QueryId {
        let code = desc.code();
        let queries = &self.queries;
        if let Some(id) = self.index.find(code, |id| queries[id.index()].desc == desc) {
            return id;
        }

        let id = QueryId(self.queries.len() as u32);
        #[cfg(feature = "profiling")]
        tracing::debug!(
            query = id.0,
            include = desc.include.len(),
            exclude = desc.exclude.len(),
            "query registered"
        );
        self.queries.push(Query::new(id, desc));
        self.index.insert(code, id);
        id
    }

    pub fn get(&self, id: QueryId) -> Option<&Query> {
        self.queries.get(id.index())
    }

    /// Refresh one query against the current archetype list and return its matches
    pub fn refresh(&mut self, id: QueryId, archetypes: &[Archetype]) -> Option<&[ArchetypeId]> {
        let query = self.queries.get_mut(id.index())?;
        query.refresh(archetypes);
        Some(query.matched())
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Total cached archetype matches across all queries
    pub fn cached_matches(&self) -> usize {
        self.queries.iter().map(|q| q.matched.len()).sum()
    }
}
