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


//! Short token resolution against real stores.

use chrono::{Duration, Utc};
use kwh_market::{
    Announcement, AnnouncementId, AnnouncementStore, InMemoryAnnouncementStore,
    InMemoryTransactionStore, MarketError, OwnedTransactions, PricingConfig, ShortIdResolver,
    Transaction, TransactionId, UserId, VisibleAnnouncements,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::thread;

fn make_announcement(id: &str, seller: i64, minutes_ago: i64, active: bool) -> Announcement {
    Announcement {
        id: AnnouncementId::from(id),
        active,
        created_at: Utc::now() - Duration::minutes(minutes_ago),
        ..Announcement::new(UserId(seller), PricingConfig::fixed(dec!(0.30)))
    }
}

fn make_document(id: &str, seller: i64, buyer: i64, minutes_ago: i64) -> Transaction {
    let created = Utc::now() - Duration::minutes(minutes_ago);
    serde_json::from_value(serde_json::json!({
        "transaction_id": id,
        "announcement_id": "ann",
        "seller_id": seller,
        "buyer_id": buyer,
        "status": "pending_seller",
        "scheduled_date": "tomorrow",
        "location": "",
        "brand": "",
        "connector": "Type 2",
        "created_at": created,
        "updated_at": created,
    }))
    .unwrap()
}

#[test]
fn cold_cache_resolves_through_store() {
    let store = InMemoryAnnouncementStore::new();
    store.insert(make_announcement("ann-0001cafe", 1, 0, true)).unwrap();
    let resolver = ShortIdResolver::new(8, 8);

    let resolved = resolver.resolve("0001cafe", UserId(2), &VisibleAnnouncements(&store)).unwrap();

    assert_eq!(resolved.as_deref(), Some("ann-0001cafe"));
    assert_eq!(resolver.get("0001cafe").as_deref(), Some("ann-0001cafe"));
}

#[test]
fn collision_prefers_newest_visible_record() {
    let store = InMemoryAnnouncementStore::new();
    store.insert(make_announcement("old-0000beef", 1, 30, true)).unwrap();
    store.insert(make_announcement("new-0000beef", 1, 5, true)).unwrap();
    store.insert(make_announcement("hid-0000beef", 3, 1, false)).unwrap();
    let lookup = VisibleAnnouncements(&store);

    let buyer = ShortIdResolver::new(8, 8);
    assert_eq!(
        buyer.resolve("0000beef", UserId(2), &lookup).unwrap().as_deref(),
        Some("new-0000beef")
    );

    // The owner of the inactive one still sees it, and it is the newest.
    let owner = ShortIdResolver::new(8, 8);
    assert_eq!(
        owner.resolve("0000beef", UserId(3), &lookup).unwrap().as_deref(),
        Some("hid-0000beef")
    );
}

#[test]
fn transaction_lookup_is_scoped_to_parties() {
    let store = InMemoryTransactionStore::from_documents([
        make_document("tx-a-00aa11bb", 1, 2, 10),
        make_document("tx-b-00aa11bb", 4, 5, 1),
    ])
    .unwrap();
    let lookup = OwnedTransactions(&store);
    let resolver = ShortIdResolver::new(8, 8);

    assert_eq!(
        resolver.resolve("00aa11bb", UserId(2), &lookup).unwrap().as_deref(),
        Some("tx-a-00aa11bb")
    );
    assert_eq!(
        resolver.resolve("00aa11bb", UserId(5), &lookup).unwrap().as_deref(),
        Some("tx-b-00aa11bb")
    );
    assert_eq!(resolver.resolve("00aa11bb", UserId(9), &lookup).unwrap(), None);
}

#[test]
fn warm_collision_does_not_hide_own_record() {
    let store = InMemoryTransactionStore::from_documents([
        make_document("aaaa-00beef00beef", 10, 20, 10),
        make_document("bbbb-00beef00beef", 30, 40, 1),
    ])
    .unwrap();
    let lookup = OwnedTransactions(&store);
    let resolver = ShortIdResolver::new(8, 12);
    resolver.issue("aaaa-00beef00beef");

    assert_eq!(
        resolver.resolve("00beef00beef", UserId(30), &lookup).unwrap().as_deref(),
        Some("bbbb-00beef00beef")
    );
    assert_eq!(resolver.resolve("00beef00beef", UserId(99), &lookup).unwrap(), None);
    assert_eq!(
        resolver.resolve("00beef00beef", UserId(20), &lookup).unwrap().as_deref(),
        Some("aaaa-00beef00beef")
    );
}

#[test]
fn warm_hidden_announcement_is_not_returned_to_others() {
    let store = InMemoryAnnouncementStore::new();
    store.insert(make_announcement("ann-0000f00d", 1, 0, true)).unwrap();
    let lookup = VisibleAnnouncements(&store);
    let resolver = ShortIdResolver::new(8, 8);
    resolver.issue("ann-0000f00d");

    store.deactivate(&AnnouncementId::from("ann-0000f00d")).unwrap();

    assert_eq!(resolver.resolve("0000f00d", UserId(2), &lookup).unwrap(), None);
    assert_eq!(
        resolver.resolve("0000f00d", UserId(1), &lookup).unwrap().as_deref(),
        Some("ann-0000f00d")
    );
}

#[test]
fn duplicate_documents_are_rejected() {
    let result = InMemoryTransactionStore::from_documents([
        make_document("same", 1, 2, 0),
        make_document("same", 1, 2, 0),
    ]);
    assert!(matches!(result, Err(MarketError::DuplicateTransaction)));
}

#[test]
fn issued_token_matches_id_suffix() {
    let id = TransactionId::generate();
    let resolver = ShortIdResolver::new(4, 12);
    let token = resolver.issue(id.as_str());
    assert_eq!(token, id.short_token(12));
    assert!(id.as_str().ends_with(&token));
}

#[test]
fn cache_stays_bounded_under_concurrent_use() {
    let resolver = Arc::new(ShortIdResolver::new(16, 6));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let resolver = Arc::clone(&resolver);
            thread::spawn(move || {
                for i in 0..500 {
                    let id = format!("worker{worker}-{i:06}");
                    let token = resolver.issue(&id);
                    let _ = resolver.get(&token);
                    assert!(resolver.len() <= 16);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(resolver.len(), 16);
}
