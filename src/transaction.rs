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

//! Charging transactions and their state machine.
//!
//! A [`Transaction`] is created in [`TransactionStatus::PendingSeller`] when a
//! buyer requests a session and then only changes through
//! [`Transaction::apply`], which consults the table in
//! [`crate::transition`]. Once `completed` or `cancelled` the status never
//! changes again; only the issue log may still grow.

use crate::base::{AnnouncementId, TransactionId, UserId};
use crate::event::EventContext;
use crate::issue::{Issue, IssueLog};
use crate::pricing::{PriceQuote, PricingConfig, PricingTier};
use crate::transition::{self, ActionKind, Command, ToState};
use crate::MarketError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status. The serialized names are stored verbatim in documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    PendingSeller,
    Confirmed,
    BuyerArrived,
    ChargingStarted,
    ChargingInProgress,
    ChargingCompleted,
    PhotoUploaded,
    KwhDeclared,
    PaymentRequested,
    PaymentDeclared,
    Completed,
    Disputed,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 13] = [
        TransactionStatus::PendingSeller,
        TransactionStatus::Confirmed,
        TransactionStatus::BuyerArrived,
        TransactionStatus::ChargingStarted,
        TransactionStatus::ChargingInProgress,
        TransactionStatus::ChargingCompleted,
        TransactionStatus::PhotoUploaded,
        TransactionStatus::KwhDeclared,
        TransactionStatus::PaymentRequested,
        TransactionStatus::PaymentDeclared,
        TransactionStatus::Completed,
        TransactionStatus::Disputed,
        TransactionStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::PendingSeller => "pending_seller",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::BuyerArrived => "buyer_arrived",
            TransactionStatus::ChargingStarted => "charging_started",
            TransactionStatus::ChargingInProgress => "charging_in_progress",
            TransactionStatus::ChargingCompleted => "charging_completed",
            TransactionStatus::PhotoUploaded => "photo_uploaded",
            TransactionStatus::KwhDeclared => "kwh_declared",
            TransactionStatus::PaymentRequested => "payment_requested",
            TransactionStatus::PaymentDeclared => "payment_declared",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Disputed => "disputed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| MarketError::validation(format!("unknown status '{s}'")))
    }
}

/// Which side of the transaction an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Seller,
    Buyer,
}

/// Session logistics supplied with a buyer's request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub scheduled_date: String,
    pub location: String,
    pub brand: String,
    pub connector: String,
}

/// Inputs a transition may need besides the command itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransitionContext<'a> {
    pub retry_cap: u32,
    pub pricing: Option<&'a PricingConfig>,
    pub now: DateTime<Utc>,
}

/// What [`Transaction::apply`] did.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Applied {
    Changed {
        previous: TransactionStatus,
        context: EventContext,
    },
    /// The action had already been applied; nothing changed.
    Duplicate,
}

/// One buyer/seller pairing around one charging session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    transaction_id: TransactionId,
    announcement_id: AnnouncementId,
    seller_id: UserId,
    buyer_id: UserId,
    status: TransactionStatus,
    /// Status the transaction was in when the current dispute was opened.
    #[serde(default)]
    status_before_dispute: Option<TransactionStatus>,
    /// Party that proposed closing the current dispute and awaits the other side.
    #[serde(default)]
    resolution_proposed_by: Option<Party>,
    scheduled_date: String,
    location: String,
    brand: String,
    connector: String,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    photo_ref: Option<String>,
    /// Billed quantity; exceeds `actual_kwh` only when the minimum floor applied.
    #[serde(default)]
    declared_kwh: Option<Decimal>,
    #[serde(default)]
    actual_kwh: Option<Decimal>,
    #[serde(default)]
    price_per_kwh: Option<Decimal>,
    #[serde(default)]
    total_amount: Option<Decimal>,
    #[serde(default)]
    applied_tier: Option<PricingTier>,
    #[serde(default)]
    issues: IssueLog,
    #[serde(default)]
    cancellation_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every write; used for compare-and-swap.
    #[serde(default)]
    revision: u64,
}

impl Transaction {
    pub(crate) fn new(
        transaction_id: TransactionId,
        announcement_id: AnnouncementId,
        seller_id: UserId,
        buyer_id: UserId,
        request: SessionRequest,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id,
            announcement_id,
            seller_id,
            buyer_id,
            status: TransactionStatus::PendingSeller,
            status_before_dispute: None,
            resolution_proposed_by: None,
            scheduled_date: request.scheduled_date,
            location: request.location,
            brand: request.brand,
            connector: request.connector,
            retry_count: 0,
            photo_ref: None,
            declared_kwh: None,
            actual_kwh: None,
            price_per_kwh: None,
            total_amount: None,
            applied_tier: None,
            issues: IssueLog::new(),
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn announcement_id(&self) -> &AnnouncementId {
        &self.announcement_id
    }

    pub fn seller_id(&self) -> UserId {
        self.seller_id
    }

    pub fn buyer_id(&self) -> UserId {
        self.buyer_id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn status_before_dispute(&self) -> Option<TransactionStatus> {
        self.status_before_dispute
    }

    pub fn resolution_proposed_by(&self) -> Option<Party> {
        self.resolution_proposed_by
    }

    pub fn scheduled_date(&self) -> &str {
        &self.scheduled_date
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn brand(&self) -> &str {
        &self.brand
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn photo_ref(&self) -> Option<&str> {
        self.photo_ref.as_deref()
    }

    pub fn declared_kwh(&self) -> Option<Decimal> {
        self.declared_kwh
    }

    pub fn actual_kwh(&self) -> Option<Decimal> {
        self.actual_kwh
    }

    pub fn price_per_kwh(&self) -> Option<Decimal> {
        self.price_per_kwh
    }

    pub fn total_amount(&self) -> Option<Decimal> {
        self.total_amount
    }

    pub fn applied_tier(&self) -> Option<PricingTier> {
        self.applied_tier
    }

    pub fn issues(&self) -> &IssueLog {
        &self.issues
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn party_of(&self, user: UserId) -> Option<Party> {
        if user == self.seller_id {
            Some(Party::Seller)
        } else if user == self.buyer_id {
            Some(Party::Buyer)
        } else {
            None
        }
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.party_of(user).is_some()
    }

    /// For store implementations: stamps the revision a write lands with.
    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Appends an issue without touching the status. Allowed in every state.
    pub(crate) fn append_issue(&mut self, issue: Issue, now: DateTime<Utc>) {
        self.issues.append(issue);
        self.updated_at = now;
    }

    /// Runs `command` for `actor` against the transition table.
    ///
    /// On error the transaction is left untouched.
    ///
    /// # Errors
    ///
    /// - [`MarketError::Unauthorized`] - actor is not a party, or not the party for this edge.
    /// - [`MarketError::InvalidTransition`] - no edge from the current status.
    /// - [`MarketError::RetryLimitExceeded`] - activation retries exhausted.
    /// - [`MarketError::Validation`] - malformed payload.
    /// - [`MarketError::NotFound`] - KWh declared without the announcement's pricing.
    pub(crate) fn apply(
        &mut self,
        actor: UserId,
        command: &Command,
        ctx: &TransitionContext<'_>,
    ) -> Result<Applied, MarketError> {
        let party = self.party_of(actor).ok_or(MarketError::Unauthorized)?;
        let action = command.kind();

        let Some(rule) = transition::lookup(self.status, action) else {
            if self.already_applied(action, party) {
                return Ok(Applied::Duplicate);
            }
            if !transition::permits(action, party) {
                return Err(MarketError::Unauthorized);
            }
            return Err(MarketError::InvalidTransition {
                current: self.status,
                action,
            });
        };

        if !rule.actors.allows(party) {
            return Err(MarketError::Unauthorized);
        }

        let previous = self.status;
        let next = match rule.to {
            ToState::Exactly(status) => status,
            ToState::RetrySame => previous,
            ToState::Resume => self.status_before_dispute.ok_or(MarketError::InvalidTransition {
                current: previous,
                action,
            })?,
            ToState::Mutual(status) => match self.resolution_proposed_by {
                Some(proposer) if proposer != party => status,
                _ => previous,
            },
        };

        let context = match command {
            Command::Accept
            | Command::ConfirmArrival
            | Command::ConfirmChargingStarted
            | Command::FinishCharging
            | Command::ConfirmKwh
            | Command::DeclarePayment
            | Command::ConfirmPayment => EventContext::None,
            Command::ActivateCharging => {
                if self.retry_count >= ctx.retry_cap {
                    return Err(MarketError::RetryLimitExceeded {
                        retries: self.retry_count,
                    });
                }
                EventContext::None
            }
            Command::Reject { reason } | Command::Cancel { reason } => {
                let reason = required(reason, "cancellation reason")?;
                self.cancellation_reason = Some(reason.clone());
                EventContext::Cancelled { reason }
            }
            Command::ReportChargingFailure { description } => {
                if self.retry_count >= ctx.retry_cap {
                    return Err(MarketError::RetryLimitExceeded {
                        retries: self.retry_count,
                    });
                }
                let description = if description.trim().is_empty() {
                    "charging did not start".to_string()
                } else {
                    description.trim().to_string()
                };
                self.retry_count += 1;
                self.issues.append(Issue::new(description, actor));
                EventContext::RetryRecorded {
                    retry_count: self.retry_count,
                    retries_left: ctx.retry_cap - self.retry_count,
                }
            }
            Command::AttachPhoto { photo_ref } => {
                let photo_ref = required(photo_ref, "photo reference")?;
                self.photo_ref = Some(photo_ref.clone());
                EventContext::PhotoAttached { photo_ref }
            }
            Command::DeclareKwh { kwh } => {
                if self.total_amount.is_some() {
                    return Err(MarketError::InvalidTransition {
                        current: previous,
                        action,
                    });
                }
                let pricing = ctx.pricing.ok_or(MarketError::NotFound)?;
                let quote = pricing.quote(*kwh)?;
                self.freeze_quote(&quote);
                EventContext::PriceFrozen { quote }
            }
            Command::DisputeKwh { reason }
            | Command::DenyPayment { reason }
            | Command::RaiseIssue {
                description: reason,
            } => {
                let issue = Issue::new(required(reason, "issue description")?, actor);
                if previous == TransactionStatus::Disputed && self.issues.repeats_last(&issue) {
                    return Ok(Applied::Duplicate);
                }
                if previous != TransactionStatus::Disputed {
                    self.status_before_dispute = Some(previous);
                }
                self.issues.append(issue.clone());
                EventContext::IssueRecorded { issue }
            }
            Command::ResolveDispute { note } => {
                if self.resolution_proposed_by == Some(party) {
                    return Ok(Applied::Duplicate);
                }
                let issue = Issue::new(required(note, "resolution note")?, actor);
                self.issues.append(issue.clone());
                if next == previous {
                    self.resolution_proposed_by = Some(party);
                    EventContext::ResolutionProposed { issue }
                } else {
                    self.status_before_dispute = None;
                    EventContext::IssueRecorded { issue }
                }
            }
            Command::ResumeAfterDispute { note } => {
                let issue = Issue::new(required(note, "resume note")?, actor);
                self.issues.append(issue.clone());
                self.status_before_dispute = None;
                EventContext::IssueRecorded { issue }
            }
        };

        if next != TransactionStatus::Disputed {
            self.resolution_proposed_by = None;
        }
        self.status = next;
        self.updated_at = ctx.now;
        if next == TransactionStatus::Completed {
            self.completed_at = Some(ctx.now);
        }

        Ok(Applied::Changed { previous, context })
    }

    /// Whether the transaction already sits where `action` would have put it.
    fn already_applied(&self, action: ActionKind, party: Party) -> bool {
        transition::landing_rules(self.status, action, party).any(|rule| {
            self.status != TransactionStatus::Disputed
                || match rule.from {
                    transition::FromState::Exactly(from) => self.status_before_dispute == Some(from),
                    transition::FromState::AnyOpen => true,
                }
        })
    }

    fn freeze_quote(&mut self, quote: &PriceQuote) {
        self.actual_kwh = Some(quote.actual_kwh);
        self.declared_kwh = Some(quote.billed_kwh);
        self.price_per_kwh = Some(quote.price_per_kwh);
        self.total_amount = Some(quote.total_amount);
        self.applied_tier = quote.applied_tier;
    }
}

fn required(value: &str, what: &str) -> Result<String, MarketError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(MarketError::validation(format!("{what} is required")));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SELLER: UserId = UserId(10);
    const BUYER: UserId = UserId(20);

    fn transaction() -> Transaction {
        Transaction::new(
            TransactionId::from("tx-1"),
            AnnouncementId::from("ann-1"),
            SELLER,
            BUYER,
            SessionRequest::default(),
        )
    }

    fn ctx(pricing: Option<&PricingConfig>) -> TransitionContext<'_> {
        TransitionContext {
            retry_cap: 3,
            pricing,
            now: Utc::now(),
        }
    }

    fn walk(tx: &mut Transaction, steps: &[(UserId, Command)]) {
        let pricing = PricingConfig::fixed(dec!(0.35));
        for (actor, command) in steps {
            tx.apply(*actor, command, &ctx(Some(&pricing))).unwrap();
        }
    }

    fn to_kwh_declared(tx: &mut Transaction) {
        walk(
            tx,
            &[
                (SELLER, Command::Accept),
                (BUYER, Command::ConfirmArrival),
                (SELLER, Command::ActivateCharging),
                (BUYER, Command::ConfirmChargingStarted),
                (BUYER, Command::FinishCharging),
                (BUYER, Command::AttachPhoto { photo_ref: "photo-1".into() }),
                (BUYER, Command::DeclareKwh { kwh: dec!(50) }),
            ],
        );
    }

    #[test]
    fn status_strings_are_verbatim() {
        assert_eq!(
            serde_json::to_string(&TransactionStatus::ChargingInProgress).unwrap(),
            "\"charging_in_progress\""
        );
        for status in TransactionStatus::ALL {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.to_string())
            );
        }
        assert!("paid".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn stranger_is_unauthorized() {
        let mut tx = transaction();
        let result = tx.apply(UserId(99), &Command::Accept, &ctx(None));
        assert_eq!(result, Err(MarketError::Unauthorized));
        assert_eq!(tx.status(), TransactionStatus::PendingSeller);
    }

    #[test]
    fn buyer_cannot_accept_own_request() {
        let mut tx = transaction();
        let result = tx.apply(BUYER, &Command::Accept, &ctx(None));
        assert_eq!(result, Err(MarketError::Unauthorized));
    }

    #[test]
    fn reject_records_reason() {
        let mut tx = transaction();
        tx.apply(SELLER, &Command::Reject { reason: " busy ".into() }, &ctx(None))
            .unwrap();
        assert_eq!(tx.status(), TransactionStatus::Cancelled);
        assert_eq!(tx.cancellation_reason(), Some("busy"));
    }

    #[test]
    fn empty_reason_is_rejected_without_change() {
        let mut tx = transaction();
        let result = tx.apply(SELLER, &Command::Reject { reason: "  ".into() }, &ctx(None));
        assert!(matches!(result, Err(MarketError::Validation(_))));
        assert_eq!(tx.status(), TransactionStatus::PendingSeller);
        assert_eq!(tx.cancellation_reason(), None);
    }

    #[test]
    fn duplicate_accept_is_noop() {
        let mut tx = transaction();
        walk(&mut tx, &[(SELLER, Command::Accept)]);
        let updated_at = tx.updated_at();

        let result = tx.apply(SELLER, &Command::Accept, &ctx(None));
        assert_eq!(result, Ok(Applied::Duplicate));
        assert_eq!(tx.status(), TransactionStatus::Confirmed);
        assert_eq!(tx.updated_at(), updated_at);
    }

    #[test]
    fn declare_kwh_freezes_quote() {
        let mut tx = transaction();
        to_kwh_declared(&mut tx);
        assert_eq!(tx.status(), TransactionStatus::KwhDeclared);
        assert_eq!(tx.total_amount(), Some(dec!(17.50)));
        assert_eq!(tx.price_per_kwh(), Some(dec!(0.35)));
        assert_eq!(tx.declared_kwh(), Some(dec!(50)));
        assert_eq!(tx.actual_kwh(), Some(dec!(50)));
    }

    #[test]
    fn declare_kwh_without_pricing_is_not_found() {
        let mut tx = transaction();
        walk(
            &mut tx,
            &[
                (SELLER, Command::Accept),
                (BUYER, Command::ConfirmArrival),
                (SELLER, Command::ActivateCharging),
                (BUYER, Command::ConfirmChargingStarted),
                (BUYER, Command::FinishCharging),
                (BUYER, Command::AttachPhoto { photo_ref: "p".into() }),
            ],
        );
        let result = tx.apply(BUYER, &Command::DeclareKwh { kwh: dec!(5) }, &ctx(None));
        assert_eq!(result, Err(MarketError::NotFound));
        assert_eq!(tx.status(), TransactionStatus::PhotoUploaded);
    }

    #[test]
    fn dispute_saves_prior_status_and_resume_restores_it() {
        let mut tx = transaction();
        to_kwh_declared(&mut tx);
        tx.apply(SELLER, &Command::DisputeKwh { reason: "meter shows 40".into() }, &ctx(None))
            .unwrap();
        assert_eq!(tx.status(), TransactionStatus::Disputed);
        assert_eq!(tx.status_before_dispute(), Some(TransactionStatus::KwhDeclared));
        assert_eq!(tx.issues().last().unwrap().reported_by, SELLER);

        tx.apply(BUYER, &Command::ResumeAfterDispute { note: "agreed".into() }, &ctx(None))
            .unwrap();
        assert_eq!(tx.status(), TransactionStatus::KwhDeclared);
        assert_eq!(tx.status_before_dispute(), None);
        assert_eq!(tx.total_amount(), Some(dec!(17.50)));
    }

    #[test]
    fn second_issue_keeps_original_prior_status() {
        let mut tx = transaction();
        walk(&mut tx, &[(SELLER, Command::Accept)]);
        tx.apply(BUYER, &Command::RaiseIssue { description: "no answer".into() }, &ctx(None))
            .unwrap();
        tx.apply(SELLER, &Command::RaiseIssue { description: "buyer late".into() }, &ctx(None))
            .unwrap();
        assert_eq!(tx.status_before_dispute(), Some(TransactionStatus::Confirmed));
        assert_eq!(tx.issues().len(), 2);
    }

    #[test]
    fn repeated_issue_is_duplicate() {
        let mut tx = transaction();
        let raise = Command::RaiseIssue {
            description: "no answer".into(),
        };
        tx.apply(BUYER, &raise, &ctx(None)).unwrap();
        assert_eq!(tx.apply(BUYER, &raise, &ctx(None)), Ok(Applied::Duplicate));
        assert_eq!(tx.issues().len(), 1);
    }

    #[test]
    fn dispute_kwh_duplicate_detected_through_prior_status() {
        let mut tx = transaction();
        to_kwh_declared(&mut tx);
        let dispute = Command::DisputeKwh {
            reason: "too high".into(),
        };
        tx.apply(SELLER, &dispute, &ctx(None)).unwrap();
        assert_eq!(tx.apply(SELLER, &dispute, &ctx(None)), Ok(Applied::Duplicate));
    }

    #[test]
    fn one_sided_resolution_stays_disputed() {
        let mut tx = transaction();
        to_kwh_declared(&mut tx);
        tx.apply(SELLER, &Command::DisputeKwh { reason: "too high".into() }, &ctx(None))
            .unwrap();

        let applied = tx
            .apply(BUYER, &Command::ResolveDispute { note: "trust me".into() }, &ctx(None))
            .unwrap();

        assert!(matches!(
            applied,
            Applied::Changed {
                previous: TransactionStatus::Disputed,
                context: EventContext::ResolutionProposed { .. },
            }
        ));
        assert_eq!(tx.status(), TransactionStatus::Disputed);
        assert_eq!(tx.resolution_proposed_by(), Some(Party::Buyer));
        assert_eq!(tx.status_before_dispute(), Some(TransactionStatus::KwhDeclared));
        assert_eq!(tx.completed_at(), None);
    }

    #[test]
    fn second_party_completes_resolution() {
        let mut tx = transaction();
        to_kwh_declared(&mut tx);
        tx.apply(SELLER, &Command::DisputeKwh { reason: "too high".into() }, &ctx(None))
            .unwrap();
        tx.apply(BUYER, &Command::ResolveDispute { note: "refund 2".into() }, &ctx(None))
            .unwrap();
        tx.apply(SELLER, &Command::ResolveDispute { note: "agreed".into() }, &ctx(None))
            .unwrap();

        assert_eq!(tx.status(), TransactionStatus::Completed);
        assert_eq!(tx.resolution_proposed_by(), None);
        assert_eq!(tx.status_before_dispute(), None);
        assert_eq!(tx.total_amount(), Some(dec!(17.50)));
        assert_eq!(tx.issues().len(), 3);
        assert!(tx.completed_at().is_some());
    }

    #[test]
    fn repeated_resolution_from_same_party_is_duplicate() {
        let mut tx = transaction();
        to_kwh_declared(&mut tx);
        tx.apply(SELLER, &Command::DisputeKwh { reason: "too high".into() }, &ctx(None))
            .unwrap();
        let resolve = Command::ResolveDispute {
            note: "settled".into(),
        };
        tx.apply(SELLER, &resolve, &ctx(None)).unwrap();
        let before = tx.clone();

        assert_eq!(tx.apply(SELLER, &resolve, &ctx(None)), Ok(Applied::Duplicate));
        assert_eq!(tx, before);

        tx.apply(BUYER, &resolve, &ctx(None)).unwrap();
        assert_eq!(tx.apply(BUYER, &resolve, &ctx(None)), Ok(Applied::Duplicate));
        assert_eq!(tx.status(), TransactionStatus::Completed);
    }

    #[test]
    fn resume_withdraws_pending_resolution() {
        let mut tx = transaction();
        to_kwh_declared(&mut tx);
        tx.apply(SELLER, &Command::DisputeKwh { reason: "too high".into() }, &ctx(None))
            .unwrap();
        tx.apply(SELLER, &Command::ResolveDispute { note: "fine".into() }, &ctx(None))
            .unwrap();
        tx.apply(BUYER, &Command::ResumeAfterDispute { note: "redo reading".into() }, &ctx(None))
            .unwrap();

        assert_eq!(tx.status(), TransactionStatus::KwhDeclared);
        assert_eq!(tx.resolution_proposed_by(), None);
    }

    #[test]
    fn terminal_transaction_rejects_everything_but_duplicates() {
        let mut tx = transaction();
        tx.apply(SELLER, &Command::Reject { reason: "no".into() }, &ctx(None))
            .unwrap();

        assert_eq!(
            tx.apply(SELLER, &Command::Reject { reason: "no".into() }, &ctx(None)),
            Ok(Applied::Duplicate)
        );
        assert_eq!(
            tx.apply(SELLER, &Command::Accept, &ctx(None)),
            Err(MarketError::InvalidTransition {
                current: TransactionStatus::Cancelled,
                action: ActionKind::Accept,
            })
        );
        assert!(matches!(
            tx.apply(BUYER, &Command::RaiseIssue { description: "x".into() }, &ctx(None)),
            Err(MarketError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn identical_failure_reports_each_count_a_retry() {
        let mut tx = transaction();
        walk(
            &mut tx,
            &[
                (SELLER, Command::Accept),
                (BUYER, Command::ConfirmArrival),
                (SELLER, Command::ActivateCharging),
            ],
        );
        let failure = Command::ReportChargingFailure {
            description: "no power at the plug".into(),
        };
        tx.apply(BUYER, &failure, &ctx(None)).unwrap();
        let applied = tx.apply(BUYER, &failure, &ctx(None)).unwrap();

        assert!(matches!(
            applied,
            Applied::Changed {
                context: EventContext::RetryRecorded { retry_count: 2, retries_left: 1 },
                ..
            }
        ));
        assert_eq!(tx.retry_count(), 2);
        assert_eq!(tx.issues().len(), 2);
    }

    #[test]
    fn retry_limit_leaves_transaction_in_place() {
        let mut tx = transaction();
        walk(
            &mut tx,
            &[
                (SELLER, Command::Accept),
                (BUYER, Command::ConfirmArrival),
                (SELLER, Command::ActivateCharging),
            ],
        );
        let failure = Command::ReportChargingFailure {
            description: String::new(),
        };
        for attempt in 1..=3 {
            tx.apply(BUYER, &failure, &ctx(None)).unwrap();
            assert_eq!(tx.retry_count(), attempt);
        }
        let before = tx.clone();
        assert_eq!(
            tx.apply(BUYER, &failure, &ctx(None)),
            Err(MarketError::RetryLimitExceeded { retries: 3 })
        );
        assert_eq!(tx, before);
        assert_eq!(tx.status(), TransactionStatus::ChargingStarted);
        assert_eq!(tx.issues().len(), 3);
        assert_eq!(tx.issues().last().unwrap().description, "charging did not start");
    }

    #[test]
    fn document_round_trips_through_json() {
        let mut tx = transaction();
        to_kwh_declared(&mut tx);
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["status"], "kwh_declared");
        assert_eq!(json["total_amount"], "17.50");

        let restored: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(restored, tx);
    }
}
