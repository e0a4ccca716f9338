// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine configuration.

use crate::MarketError;
use serde::{Deserialize, Serialize};

/// Tunables for [`crate::Engine`].
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```
/// use kwh_market::EngineConfig;
///
/// let config = EngineConfig::from_toml_str("retry_cap = 5").unwrap();
/// assert_eq!(config.retry_cap, 5);
/// assert_eq!(config.short_token_len, 12);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Failed activations a buyer may report before an admin must step in.
    pub retry_cap: u32,
    /// Length of the id suffix embedded in callback payloads.
    pub short_token_len: usize,
    /// Entries kept by each short token cache.
    pub short_id_capacity: usize,
    /// Events buffered for the notification collaborator before dropping.
    pub event_buffer: usize,
    /// Compare-and-swap attempts before a racing write is reported as lost.
    pub cas_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_cap: 3,
            short_token_len: 12,
            short_id_capacity: 1024,
            event_buffer: 1024,
            cas_attempts: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, MarketError> {
        let config: EngineConfig =
            toml::from_str(input).map_err(|e| MarketError::validation(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        if self.short_token_len == 0 {
            return Err(MarketError::validation("short_token_len must be positive"));
        }
        if self.short_id_capacity == 0 {
            return Err(MarketError::validation("short_id_capacity must be positive"));
        }
        if self.event_buffer == 0 {
            return Err(MarketError::validation("event_buffer must be positive"));
        }
        if self.cas_attempts == 0 {
            return Err(MarketError::validation("cas_attempts must be positive"));
        }
        Ok(())
    }
}
