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

//! Manager configuration

use serde::{Deserialize, Serialize};

use crate::error::{EcsError, Result};

/// Tuning knobs for an [`EntityManager`](crate::manager::EntityManager).
///
/// Missing fields take their default when parsed from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Entity slots reserved up front
    pub initial_entity_capacity: usize,
    /// Archetype slots reserved up front
    pub initial_archetype_capacity: usize,
    /// Idle chunks kept by a pool the manager creates itself (0 = keep all)
    pub max_pooled_chunks: usize,
    /// Merge repeated create/instantiate records in command buffers
    pub coalesce_commands: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            initial_entity_capacity: 1024,
            initial_archetype_capacity: 64,
            max_pooled_chunks: 0,
            coalesce_commands: true,
        }
    }
}

impl ManagerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EcsError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ManagerConfig::from_json(r#"{ "max_pooled_chunks": 32 }"#).unwrap();
        assert_eq!(config.max_pooled_chunks, 32);
        assert_eq!(config.initial_archetype_capacity, 64);
        assert!(config.coalesce_commands);
    }

    #[test]
    fn test_round_trip() {
        let config = ManagerConfig {
            coalesce_commands: false,
            ..Default::default()
        };
        let json = config.to_json().unwrap();
        assert_eq!(ManagerConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ManagerConfig::from_json("{ not json"),
            Err(EcsError::ConfigError(_))
        ));
    }
}
