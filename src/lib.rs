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

//! # KWh Market
//!
//! Transaction lifecycle for a peer-to-peer EV charging marketplace. A seller
//! publishes an announcement with a pricing schedule, a buyer requests a
//! session, and both sides walk the transaction from request through
//! charging, meter declaration, and payment, with disputes and cancellation
//! along the way.
//!
//! ## Core Components
//!
//! - [`Engine`]: validates, applies, and persists every actor action
//! - [`transition::RULES`]: the table of legal `(status, action) -> status` edges
//! - [`PricingConfig`]: fixed and graduated per-KWh pricing with a billing floor
//! - [`ShortIdResolver`]: LRU-backed short tokens for callback payloads
//! - [`DomainEvent`]: what happened, for the notification layer
//!
//! ## Example
//!
//! ```
//! use kwh_market::{Action, Announcement, Command, Engine, PricingConfig, SessionRequest, TransactionStatus, UserId};
//! use rust_decimal_macros::dec;
//!
//! let engine = Engine::new();
//! let seller = UserId(1);
//! let buyer = UserId(2);
//!
//! let announcement = engine
//!     .publish_announcement(Announcement::new(seller, PricingConfig::fixed(dec!(0.35))))
//!     .unwrap();
//! let token = engine.announcement_token(&announcement);
//! let tx = engine.request_session(buyer, &token, SessionRequest::default()).unwrap();
//!
//! let id = tx.id().as_str().to_string();
//! for (actor, command) in [
//!     (seller, Command::Accept),
//!     (buyer, Command::ConfirmArrival),
//!     (seller, Command::ActivateCharging),
//!     (buyer, Command::ConfirmChargingStarted),
//!     (buyer, Command::FinishCharging),
//!     (buyer, Command::AttachPhoto { photo_ref: "meter.jpg".into() }),
//!     (buyer, Command::DeclareKwh { kwh: dec!(50) }),
//!     (seller, Command::ConfirmKwh),
//!     (buyer, Command::DeclarePayment),
//!     (seller, Command::ConfirmPayment),
//! ] {
//!     engine.process(Action::new(actor, id.as_str(), command)).unwrap();
//! }
//!
//! let tx = engine.get_transaction(tx.id()).unwrap().unwrap();
//! assert_eq!(tx.status(), TransactionStatus::Completed);
//! assert_eq!(tx.total_amount(), Some(dec!(17.50)));
//! ```
//!
//! ## Thread Safety
//!
//! Actions on the same transaction may arrive concurrently. Writes go through
//! a compare-and-swap on the document revision, so a late duplicate either
//! reports [`Outcome::AlreadyApplied`] or fails with
//! [`MarketError::InvalidTransition`], and never overwrites the winner.

pub mod announcement;
mod base;
pub mod config;
mod engine;
pub mod error;
pub mod event;
pub mod interaction;
pub mod issue;
pub mod pricing;
pub mod short_id;
pub mod stats;
pub mod store;
mod transaction;
pub mod transition;

pub use announcement::{Announcement, AnnouncementStore, InMemoryAnnouncementStore, VisibleAnnouncements};
pub use base::{AnnouncementId, TransactionId, UserId};
pub use config::EngineConfig;
pub use engine::{Action, Engine, Outcome, RoleFilter};
pub use error::MarketError;
pub use event::{DomainEvent, EventContext, TransitionEvent};
pub use interaction::{InteractionContexts, PendingInput};
pub use issue::{Issue, IssueLog};
pub use pricing::{PriceQuote, PricingConfig, PricingScheme, PricingTier, format_amount};
pub use short_id::{ShortIdResolver, SuffixLookup};
pub use stats::TransactionStats;
pub use store::{InMemoryTransactionStore, OwnedTransactions, Swap, TransactionStore};
pub use transaction::{Party, SessionRequest, Transaction, TransactionStatus};
pub use transition::{ActionKind, Command};
