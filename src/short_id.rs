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

//! Short token resolution for size-limited callback payloads.
//!
//! Chat callback data has a hard byte ceiling, so buttons carry a fixed-length
//! suffix of the record id instead of the id itself. A bounded LRU cache maps
//! tokens back to full ids. Because the token is derived from the id, a miss
//! is never fatal: the resolver falls back to a suffix lookup in the owning
//! store, restricted to records the requesting actor may see, and re-caches
//! the result.
//!
//! Two ids sharing a suffix is a known limitation. A cached hit is only
//! returned when the actor may access it; otherwise the fallback narrows by
//! ownership first and then prefers the newest record.

use crate::base::{self, UserId};
use crate::MarketError;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tracing::debug;

/// Store-side checks backing the token cache.
pub trait SuffixLookup {
    /// Full id of the newest record ending in `suffix` that `actor` may access.
    fn lookup_suffix(&self, suffix: &str, actor: UserId) -> Result<Option<String>, MarketError>;

    /// Whether the record stored under `full_id` exists and `actor` may access it.
    fn accessible(&self, full_id: &str, actor: UserId) -> Result<bool, MarketError>;
}

/// Bounded token → id map with least-recently-used eviction.
#[derive(Debug)]
pub struct ShortIdResolver {
    cache: Mutex<LruCache<String, String>>,
    token_len: usize,
}

impl ShortIdResolver {
    pub fn new(capacity: usize, token_len: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            token_len: token_len.max(1),
        }
    }

    pub fn token_len(&self) -> usize {
        self.token_len
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Derives the token for `full_id` without caching it.
    pub fn derive<'a>(&self, full_id: &'a str) -> &'a str {
        base::suffix(full_id, self.token_len)
    }

    /// Derives, caches, and returns the token for `full_id`.
    pub fn issue(&self, full_id: &str) -> String {
        let token = self.derive(full_id).to_string();
        self.set(token.clone(), full_id.to_string());
        token
    }

    /// Inserts or refreshes a mapping, evicting the least recently used one when full.
    pub fn set(&self, token: String, full_id: String) {
        let mut cache = self.cache.lock();
        if cache.contains(&token) {
            cache.put(token, full_id);
        } else if let Some((evicted, _)) = cache.push(token, full_id) {
            debug!(token = %evicted, "evicted short token");
        }
    }

    /// Cache-only lookup.
    pub fn get(&self, token: &str) -> Option<String> {
        self.cache.lock().get(token).cloned()
    }

    /// Resolves `token` for `actor`, falling back to `lookup` on a miss.
    ///
    /// A cached id the actor may not access is treated as a miss, so a
    /// colliding foreign record never hides the actor's own and strangers see
    /// the same answer whether the token is warm or cold. Returns `Ok(None)`
    /// only when no record ending in the token is accessible to `actor`.
    pub fn resolve<L>(&self, token: &str, actor: UserId, lookup: &L) -> Result<Option<String>, MarketError>
    where
        L: SuffixLookup + ?Sized,
    {
        if let Some(full_id) = self.get(token) {
            if lookup.accessible(&full_id, actor)? {
                return Ok(Some(full_id));
            }
            debug!(token, actor = %actor, "cached short token not accessible to actor");
        } else {
            debug!(token, actor = %actor, "short token cache miss, falling back to store");
        }

        let suffix = self.derive(token);
        let found = lookup.lookup_suffix(suffix, actor)?;
        if let Some(full_id) = &found {
            self.set(token.to_string(), full_id.clone());
        }
        Ok(found)
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
