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

//! Seller announcements.
//!
//! The engine only reads announcements: it needs the seller to pair with a
//! buyer and the pricing to bill the session.

use crate::base::{AnnouncementId, UserId};
use crate::pricing::PricingConfig;
use crate::short_id::SuffixLookup;
use crate::MarketError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: AnnouncementId,
    pub seller_id: UserId,
    pub pricing: PricingConfig,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub connector_types: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Announcement {
    pub fn new(seller_id: UserId, pricing: PricingConfig) -> Self {
        Self {
            id: AnnouncementId::generate(),
            seller_id,
            pricing,
            location: String::new(),
            connector_types: Vec::new(),
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Active announcements are public; inactive ones only their seller sees.
    pub fn is_visible_to(&self, user: UserId) -> bool {
        self.active || self.seller_id == user
    }
}

/// Read side of the announcement collection.
pub trait AnnouncementStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`MarketError::Validation`] if an announcement with the same id exists.
    fn insert(&self, announcement: Announcement) -> Result<(), MarketError>;

    fn get(&self, id: &AnnouncementId) -> Result<Option<Announcement>, MarketError>;

    /// Newest announcement whose id ends with `suffix` and that `actor` may see.
    fn find_visible_by_suffix(
        &self,
        suffix: &str,
        actor: UserId,
    ) -> Result<Option<AnnouncementId>, MarketError>;

    fn all(&self) -> Result<Vec<Announcement>, MarketError>;
}

/// Short token checks over the announcements an actor may see.
pub struct VisibleAnnouncements<'a>(pub &'a dyn AnnouncementStore);

impl SuffixLookup for VisibleAnnouncements<'_> {
    fn lookup_suffix(&self, suffix: &str, actor: UserId) -> Result<Option<String>, MarketError> {
        Ok(self.0.find_visible_by_suffix(suffix, actor)?.map(|id| id.0))
    }

    fn accessible(&self, full_id: &str, actor: UserId) -> Result<bool, MarketError> {
        Ok(self
            .0
            .get(&AnnouncementId::from(full_id))?
            .is_some_and(|announcement| announcement.is_visible_to(actor)))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAnnouncementStore {
    announcements: DashMap<AnnouncementId, Announcement>,
}

impl InMemoryAnnouncementStore {
    pub fn new() -> Self {
        Self {
            announcements: DashMap::new(),
        }
    }

    /// Marks an announcement inactive. Existing transactions keep working.
    pub fn deactivate(&self, id: &AnnouncementId) -> Result<(), MarketError> {
        let mut announcement = self.announcements.get_mut(id).ok_or(MarketError::NotFound)?;
        announcement.active = false;
        Ok(())
    }
}

impl AnnouncementStore for InMemoryAnnouncementStore {
    fn insert(&self, announcement: Announcement) -> Result<(), MarketError> {
        match self.announcements.entry(announcement.id.clone()) {
            Entry::Occupied(_) => Err(MarketError::validation("announcement already exists")),
            Entry::Vacant(entry) => {
                entry.insert(announcement);
                Ok(())
            }
        }
    }

    fn get(&self, id: &AnnouncementId) -> Result<Option<Announcement>, MarketError> {
        Ok(self.announcements.get(id).map(|entry| entry.value().clone()))
    }

    fn find_visible_by_suffix(
        &self,
        suffix: &str,
        actor: UserId,
    ) -> Result<Option<AnnouncementId>, MarketError> {
        Ok(self
            .announcements
            .iter()
            .filter(|entry| entry.key().as_str().ends_with(suffix) && entry.is_visible_to(actor))
            .max_by_key(|entry| entry.created_at)
            .map(|entry| entry.key().clone()))
    }

    fn all(&self) -> Result<Vec<Announcement>, MarketError> {
        Ok(self
            .announcements
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn announcement(id: &str, seller: i64) -> Announcement {
        Announcement {
            id: AnnouncementId::from(id),
            ..Announcement::new(UserId(seller), PricingConfig::fixed(dec!(0.35)))
        }
    }

    #[test]
    fn inactive_announcement_is_hidden_from_buyers() {
        let store = InMemoryAnnouncementStore::new();
        store.insert(announcement("ann-00ff", 1)).unwrap();
        assert!(store.find_visible_by_suffix("00ff", UserId(2)).unwrap().is_some());

        store.deactivate(&"ann-00ff".into()).unwrap();
        assert!(store.find_visible_by_suffix("00ff", UserId(2)).unwrap().is_none());
        assert!(store.find_visible_by_suffix("00ff", UserId(1)).unwrap().is_some());
    }

    #[test]
    fn duplicate_announcement_is_rejected() {
        let store = InMemoryAnnouncementStore::new();
        store.insert(announcement("a", 1)).unwrap();
        assert!(matches!(
            store.insert(announcement("a", 2)),
            Err(MarketError::Validation(_))
        ));
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{
            "id": "ann-1",
            "seller_id": 42,
            "pricing": {
                "pricing_type": "graduated",
                "tiers": [{"limit": "30", "price": "0.35"}, {"limit": null, "price": "0.25"}],
                "minimum_kwh": "10"
            }
        }"#;
        let announcement: Announcement = serde_json::from_str(json).unwrap();
        assert!(announcement.active);
        assert_eq!(announcement.seller_id, UserId(42));
        assert_eq!(announcement.pricing.minimum_kwh, Some(dec!(10)));
        assert!(announcement.pricing.validate().is_ok());
    }
}
