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

//! Transaction lifecycle engine.
//!
//! The [`Engine`] is the entry point for every actor action. Each call is an
//! independent unit of work:
//!
//! 1. resolve the reference (full id or short token) to a transaction,
//! 2. run the command through [`Transaction::apply`] on a private copy,
//! 3. persist the copy with a compare-and-swap on the document revision,
//! 4. publish a [`DomainEvent`] for the notification collaborator.
//!
//! If the swap loses to a concurrent write the engine re-reads and re-applies.
//! When the winner already performed the same action the loser reports
//! [`Outcome::AlreadyApplied`]; otherwise it gets
//! [`MarketError::InvalidTransition`] carrying the current status.
//!
//! # Thread Safety
//!
//! The engine holds no lock across actions. Stores are shared behind [`Arc`]
//! and the short token caches sit behind their own mutexes.

use crate::announcement::{Announcement, AnnouncementStore, InMemoryAnnouncementStore, VisibleAnnouncements};
use crate::base::{AnnouncementId, TransactionId, UserId};
use crate::config::EngineConfig;
use crate::event::{DomainEvent, EventBus, EventContext, TransitionEvent};
use crate::interaction::InteractionContexts;
use crate::issue::Issue;
use crate::short_id::ShortIdResolver;
use crate::stats::TransactionStats;
use crate::store::{InMemoryTransactionStore, OwnedTransactions, Swap, TransactionStore};
use crate::transaction::{Applied, SessionRequest, Transaction, TransactionStatus, TransitionContext};
use crate::transition::Command;
use crate::MarketError;
use chrono::Utc;
use crossbeam::channel::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An inbound actor action as delivered by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub actor: UserId,
    /// Full transaction id or short token.
    pub reference: String,
    pub command: Command,
}

impl Action {
    pub fn new(actor: UserId, reference: impl Into<String>, command: Command) -> Self {
        Self {
            actor,
            reference: reference.into(),
            command,
        }
    }
}

/// Successful result of [`Engine::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The transition ran and was persisted.
    Applied(Transaction),
    /// The transaction was already in the target state; nothing changed.
    AlreadyApplied(Transaction),
}

impl Outcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Outcome::Applied(tx) | Outcome::AlreadyApplied(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            Outcome::Applied(tx) | Outcome::AlreadyApplied(tx) => tx,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }
}

/// Which side of a transaction a user query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    Seller,
    Buyer,
    All,
}

impl RoleFilter {
    fn matches(&self, transaction: &Transaction, user: UserId) -> bool {
        match self {
            RoleFilter::Seller => transaction.seller_id() == user,
            RoleFilter::Buyer => transaction.buyer_id() == user,
            RoleFilter::All => transaction.involves(user),
        }
    }
}

/// Drives transactions through their lifecycle.
///
/// # Invariants
///
/// - Only the seller or buyer of a transaction can act on it, and only along
///   an edge of [`crate::transition::RULES`].
/// - Price and total are computed once, at KWh declaration, and never again.
/// - `completed` and `cancelled` accept no further transitions.
/// - Repeating an action that already took effect succeeds without change.
pub struct Engine {
    config: EngineConfig,
    transactions: Arc<dyn TransactionStore>,
    announcements: Arc<dyn AnnouncementStore>,
    transaction_tokens: ShortIdResolver,
    announcement_tokens: ShortIdResolver,
    events: EventBus,
}

impl Engine {
    /// Creates an engine with in-memory stores and default configuration.
    pub fn new() -> Self {
        Self::build(
            EngineConfig::default(),
            Arc::new(InMemoryTransactionStore::new()),
            Arc::new(InMemoryAnnouncementStore::new()),
        )
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, MarketError> {
        Self::with_stores(
            config,
            Arc::new(InMemoryTransactionStore::new()),
            Arc::new(InMemoryAnnouncementStore::new()),
        )
    }

    /// Creates an engine over caller-provided stores.
    pub fn with_stores(
        config: EngineConfig,
        transactions: Arc<dyn TransactionStore>,
        announcements: Arc<dyn AnnouncementStore>,
    ) -> Result<Self, MarketError> {
        config.validate()?;
        Ok(Self::build(config, transactions, announcements))
    }

    fn build(
        config: EngineConfig,
        transactions: Arc<dyn TransactionStore>,
        announcements: Arc<dyn AnnouncementStore>,
    ) -> Self {
        Engine {
            transaction_tokens: ShortIdResolver::new(config.short_id_capacity, config.short_token_len),
            announcement_tokens: ShortIdResolver::new(config.short_id_capacity, config.short_token_len),
            events: EventBus::bounded(config.event_buffer),
            config,
            transactions,
            announcements,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receiver for domain events. Every receiver competes for the same events.
    pub fn events(&self) -> Receiver<DomainEvent> {
        self.events.subscribe()
    }

    pub fn transaction_store(&self) -> &dyn TransactionStore {
        self.transactions.as_ref()
    }

    pub fn announcement_store(&self) -> &dyn AnnouncementStore {
        self.announcements.as_ref()
    }

    // === Announcements ===

    /// Validates and stores a seller's announcement.
    ///
    /// # Errors
    ///
    /// [`MarketError::Validation`] for a malformed pricing schedule or a reused id.
    pub fn publish_announcement(&self, announcement: Announcement) -> Result<AnnouncementId, MarketError> {
        announcement.pricing.validate()?;
        let id = announcement.id.clone();
        self.announcements.insert(announcement)?;
        self.announcement_tokens.issue(id.as_str());
        info!(announcement = %id, "announcement published");
        Ok(id)
    }

    /// Short token to embed in callback data for an announcement.
    pub fn announcement_token(&self, id: &AnnouncementId) -> String {
        self.announcement_tokens.issue(id.as_str())
    }

    /// Resolves a full id or short token to an announcement `actor` may see.
    ///
    /// # Errors
    ///
    /// [`MarketError::NotFound`] if nothing visible to `actor` matches.
    pub fn resolve_announcement(&self, actor: UserId, reference: &str) -> Result<Announcement, MarketError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MarketError::NotFound);
        }

        let announcement = match self.announcements.get(&AnnouncementId::from(reference))? {
            Some(announcement) => announcement,
            None => {
                let lookup = VisibleAnnouncements(self.announcements.as_ref());
                let id = self
                    .announcement_tokens
                    .resolve(reference, actor, &lookup)?
                    .ok_or(MarketError::NotFound)?;
                self.announcements
                    .get(&AnnouncementId(id))?
                    .ok_or(MarketError::NotFound)?
            }
        };

        if !announcement.is_visible_to(actor) {
            return Err(MarketError::NotFound);
        }
        Ok(announcement)
    }

    // === Transactions ===

    /// Short token to embed in callback data for a transaction.
    pub fn transaction_token(&self, id: &TransactionId) -> String {
        self.transaction_tokens.issue(id.as_str())
    }

    /// Opens a transaction in `pending_seller` for `buyer` on an announcement.
    ///
    /// # Errors
    ///
    /// - [`MarketError::NotFound`] - announcement does not resolve for the buyer.
    /// - [`MarketError::Validation`] - buyer is the seller, or the announcement is inactive.
    pub fn request_session(
        &self,
        buyer: UserId,
        announcement_ref: &str,
        request: SessionRequest,
    ) -> Result<Transaction, MarketError> {
        let announcement = self.resolve_announcement(buyer, announcement_ref)?;
        if announcement.seller_id == buyer {
            return Err(MarketError::validation("sellers cannot book their own announcement"));
        }
        if !announcement.active {
            return Err(MarketError::validation("announcement is not active"));
        }

        let transaction = Transaction::new(
            TransactionId::generate(),
            announcement.id.clone(),
            announcement.seller_id,
            buyer,
            request,
        );
        self.transactions.insert(transaction.clone())?;
        self.transaction_tokens.issue(transaction.id().as_str());

        info!(
            transaction = %transaction.id(),
            announcement = %announcement.id,
            seller = %transaction.seller_id(),
            buyer = %buyer,
            "session requested"
        );
        self.events.publish(DomainEvent::Created {
            transaction_id: transaction.id().clone(),
            seller_id: transaction.seller_id(),
            buyer_id: buyer,
            timestamp: transaction.created_at(),
        });
        Ok(transaction)
    }

    /// Applies an actor's action.
    ///
    /// # Errors
    ///
    /// - [`MarketError::NotFound`] - reference does not resolve for the actor.
    /// - [`MarketError::Unauthorized`] - actor may not take this action.
    /// - [`MarketError::InvalidTransition`] - action is not legal from the current status.
    /// - [`MarketError::Validation`] - malformed payload.
    /// - [`MarketError::RetryLimitExceeded`] - needs an administrator; an
    ///   [`DomainEvent::EscalationRequired`] is published.
    pub fn process(&self, action: Action) -> Result<Outcome, MarketError> {
        let Action {
            actor,
            reference,
            command,
        } = action;
        let kind = command.kind();
        let mut current = self.locate(actor, &reference)?;

        let pricing = match command {
            Command::DeclareKwh { .. } => self
                .announcements
                .get(current.announcement_id())?
                .map(|announcement| announcement.pricing),
            _ => None,
        };

        for _ in 0..self.config.cas_attempts {
            let now = Utc::now();
            let ctx = TransitionContext {
                retry_cap: self.config.retry_cap,
                pricing: pricing.as_ref(),
                now,
            };

            let mut updated = current.clone();
            let applied = match updated.apply(actor, &command, &ctx) {
                Ok(applied) => applied,
                Err(MarketError::RetryLimitExceeded { retries }) => {
                    warn!(
                        transaction = %current.id(),
                        retries,
                        "charging activation retries exhausted, escalating"
                    );
                    self.events.publish(DomainEvent::EscalationRequired {
                        transaction_id: current.id().clone(),
                        retry_count: retries,
                        timestamp: now,
                    });
                    return Err(MarketError::RetryLimitExceeded { retries });
                }
                Err(e) => {
                    warn!(
                        transaction = %current.id(),
                        actor = %actor,
                        action = %kind,
                        status = %current.status(),
                        error = %e,
                        "action rejected"
                    );
                    return Err(e);
                }
            };

            let (previous, context) = match applied {
                Applied::Duplicate => {
                    debug!(transaction = %current.id(), action = %kind, "duplicate action ignored");
                    return Ok(Outcome::AlreadyApplied(current));
                }
                Applied::Changed { previous, context } => (previous, context),
            };

            match self.transactions.compare_and_swap(current.revision(), updated)? {
                Swap::Swapped(stored) => {
                    self.announce(actor, previous, &stored, context);
                    return Ok(Outcome::Applied(stored));
                }
                Swap::Conflict(latest) => {
                    debug!(
                        transaction = %latest.id(),
                        action = %kind,
                        status = %latest.status(),
                        "lost compare-and-swap, re-evaluating"
                    );
                    current = latest;
                }
            }
        }

        Err(MarketError::InvalidTransition {
            current: current.status(),
            action: kind,
        })
    }

    /// Completes a pending input with the actor's free-form reply.
    ///
    /// The expectation is consumed, and restored if the reply was malformed so
    /// the actor can try again.
    ///
    /// # Errors
    ///
    /// [`MarketError::NotFound`] if nothing is pending for `actor`, otherwise
    /// whatever [`Engine::process`] returns.
    pub fn process_reply(
        &self,
        contexts: &InteractionContexts,
        actor: UserId,
        reply: &str,
    ) -> Result<Outcome, MarketError> {
        let pending = contexts.take(actor).ok_or(MarketError::NotFound)?;
        let reference = pending.transaction_id().as_str().to_string();

        let result = pending
            .clone()
            .into_command(reply)
            .and_then(|command| self.process(Action::new(actor, reference, command)));

        if let Err(MarketError::Validation(_)) = &result {
            contexts.expect(actor, pending);
        }
        result
    }

    /// Appends an issue without changing the status. Allowed in every state,
    /// including after completion or cancellation.
    ///
    /// # Errors
    ///
    /// - [`MarketError::NotFound`] - reference does not resolve for the actor.
    /// - [`MarketError::Unauthorized`] - actor is not a party.
    /// - [`MarketError::Validation`] - empty description.
    pub fn append_issue(
        &self,
        actor: UserId,
        reference: &str,
        description: &str,
    ) -> Result<Transaction, MarketError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(MarketError::validation("issue description is required"));
        }
        let mut current = self.locate(actor, reference)?;
        if !current.involves(actor) {
            return Err(MarketError::Unauthorized);
        }

        for _ in 0..self.config.cas_attempts {
            let issue = Issue::new(description, actor);
            if current.issues().repeats_last(&issue) {
                return Ok(current);
            }

            let mut updated = current.clone();
            updated.append_issue(issue.clone(), issue.timestamp);
            match self.transactions.compare_and_swap(current.revision(), updated)? {
                Swap::Swapped(stored) => {
                    info!(transaction = %stored.id(), reporter = %actor, "issue appended");
                    self.events.publish(DomainEvent::IssueAppended {
                        transaction_id: stored.id().clone(),
                        status: stored.status(),
                        issue,
                    });
                    return Ok(stored);
                }
                Swap::Conflict(latest) => current = latest,
            }
        }

        Err(MarketError::Storage("issue append kept losing concurrent writes".into()))
    }

    /// Resolves a reference to a transaction `actor` is a party to.
    ///
    /// # Errors
    ///
    /// [`MarketError::NotFound`] if it does not resolve or `actor` is not a party.
    pub fn resolve_transaction(&self, actor: UserId, reference: &str) -> Result<Transaction, MarketError> {
        let transaction = self.locate(actor, reference)?;
        if !transaction.involves(actor) {
            return Err(MarketError::NotFound);
        }
        Ok(transaction)
    }

    /// Full id first, then short token with the ownership-scoped fallback.
    fn locate(&self, actor: UserId, reference: &str) -> Result<Transaction, MarketError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MarketError::NotFound);
        }
        if let Some(transaction) = self.transactions.get(&TransactionId::from(reference))? {
            return Ok(transaction);
        }

        let lookup = OwnedTransactions(self.transactions.as_ref());
        let id = self
            .transaction_tokens
            .resolve(reference, actor, &lookup)?
            .ok_or(MarketError::NotFound)?;
        self.transactions
            .get(&TransactionId(id))?
            .ok_or(MarketError::NotFound)
    }

    fn announce(
        &self,
        actor: UserId,
        previous: TransactionStatus,
        stored: &Transaction,
        context: EventContext,
    ) {
        let status = stored.status();
        match status {
            TransactionStatus::Completed | TransactionStatus::Cancelled | TransactionStatus::Disputed => {
                info!(transaction = %stored.id(), from = %previous, to = %status, actor = %actor, "transition")
            }
            _ => debug!(transaction = %stored.id(), from = %previous, to = %status, actor = %actor, "transition"),
        }

        self.events.publish(DomainEvent::Transitioned(TransitionEvent {
            transaction_id: stored.id().clone(),
            previous_status: previous,
            new_status: status,
            actor_id: actor,
            timestamp: stored.updated_at(),
            context,
        }));

        if status == TransactionStatus::Completed {
            self.events.publish(DomainEvent::FeedbackRequested {
                transaction_id: stored.id().clone(),
                seller_id: stored.seller_id(),
                buyer_id: stored.buyer_id(),
            });
        }
    }

    // === Queries ===

    pub fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, MarketError> {
        self.transactions.get(id)
    }

    /// Transactions `user` takes part in with the given role, newest first.
    pub fn get_user_transactions(&self, user: UserId, role: RoleFilter) -> Result<Vec<Transaction>, MarketError> {
        let mut transactions: Vec<_> = self
            .transactions
            .for_user(user)?
            .into_iter()
            .filter(|tx| role.matches(tx, user))
            .collect();
        transactions.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then_with(|| b.id().cmp(a.id())));
        Ok(transactions)
    }

    /// Non-terminal transactions, oldest first.
    pub fn get_pending_transactions(&self) -> Result<Vec<Transaction>, MarketError> {
        let mut transactions = self.transactions.open()?;
        transactions.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id().cmp(b.id())));
        Ok(transactions)
    }

    pub fn get_transaction_stats(&self) -> Result<TransactionStats, MarketError> {
        Ok(self.transactions.all()?.iter().collect())
    }

    pub fn get_user_stats(&self, user: UserId) -> Result<TransactionStats, MarketError> {
        Ok(self.transactions.for_user(user)?.iter().collect())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
