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

//! The transition table.
//!
//! [`RULES`] is the single authority on which actor may move a transaction
//! from which status to which. Rows are matched in order, so the narrower
//! rows for an action come before its catch-all row.
//!
//! ```text
//!  pending_seller ──accept──► confirmed ──arrive──► buyer_arrived ──activate──► charging_started
//!        │                                                                      │    ▲
//!      reject                                                       confirm flow│    │report failure
//!        ▼                                                                      ▼    │ (retry ≤ cap)
//!    cancelled                                  charging_completed ◄──finish── charging_in_progress
//!                                                     │
//!                                                   photo
//!                                                     ▼
//!  completed ◄──confirm── payment_declared ◄──paid── payment_requested ◄──confirm── kwh_declared ◄──declare── photo_uploaded
//!      ▲                        │                                                        │
//!      │                       deny                                                   dispute
//!      │                        ▼                                                        ▼
//!      └──resolve (both parties)─────────────────── disputed ◄──────────────────────────┘
//! ```

use crate::interaction::parse_reading;
use crate::transaction::{Party, TransactionStatus};
use crate::MarketError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Payload-free name of an action, used for table lookup and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Accept,
    Reject,
    ConfirmArrival,
    ActivateCharging,
    ConfirmChargingStarted,
    ReportChargingFailure,
    FinishCharging,
    AttachPhoto,
    DeclareKwh,
    ConfirmKwh,
    DisputeKwh,
    DeclarePayment,
    ConfirmPayment,
    DenyPayment,
    RaiseIssue,
    ResolveDispute,
    ResumeAfterDispute,
    Cancel,
}

impl ActionKind {
    pub const ALL: [ActionKind; 18] = [
        ActionKind::Accept,
        ActionKind::Reject,
        ActionKind::ConfirmArrival,
        ActionKind::ActivateCharging,
        ActionKind::ConfirmChargingStarted,
        ActionKind::ReportChargingFailure,
        ActionKind::FinishCharging,
        ActionKind::AttachPhoto,
        ActionKind::DeclareKwh,
        ActionKind::ConfirmKwh,
        ActionKind::DisputeKwh,
        ActionKind::DeclarePayment,
        ActionKind::ConfirmPayment,
        ActionKind::DenyPayment,
        ActionKind::RaiseIssue,
        ActionKind::ResolveDispute,
        ActionKind::ResumeAfterDispute,
        ActionKind::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Accept => "accept",
            ActionKind::Reject => "reject",
            ActionKind::ConfirmArrival => "confirm_arrival",
            ActionKind::ActivateCharging => "activate_charging",
            ActionKind::ConfirmChargingStarted => "confirm_charging_started",
            ActionKind::ReportChargingFailure => "report_charging_failure",
            ActionKind::FinishCharging => "finish_charging",
            ActionKind::AttachPhoto => "attach_photo",
            ActionKind::DeclareKwh => "declare_kwh",
            ActionKind::ConfirmKwh => "confirm_kwh",
            ActionKind::DisputeKwh => "dispute_kwh",
            ActionKind::DeclarePayment => "declare_payment",
            ActionKind::ConfirmPayment => "confirm_payment",
            ActionKind::DenyPayment => "deny_payment",
            ActionKind::RaiseIssue => "raise_issue",
            ActionKind::ResolveDispute => "resolve_dispute",
            ActionKind::ResumeAfterDispute => "resume_after_dispute",
            ActionKind::Cancel => "cancel",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| MarketError::validation(format!("unknown action '{s}'")))
    }
}

/// An actor's requested transition together with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Accept,
    Reject { reason: String },
    ConfirmArrival,
    ActivateCharging,
    ConfirmChargingStarted,
    /// Counts one activation retry per delivery, even when the description
    /// repeats the previous report: consecutive failures usually carry the
    /// same text, so a retried tap cannot be told apart from a real second
    /// failure. Transports that redeliver should dedupe before calling in.
    ReportChargingFailure { description: String },
    FinishCharging,
    AttachPhoto { photo_ref: String },
    DeclareKwh { kwh: Decimal },
    ConfirmKwh,
    DisputeKwh { reason: String },
    DeclarePayment,
    ConfirmPayment,
    DenyPayment { reason: String },
    RaiseIssue { description: String },
    ResolveDispute { note: String },
    ResumeAfterDispute { note: String },
    Cancel { reason: String },
}

impl Command {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Accept => ActionKind::Accept,
            Self::Reject { .. } => ActionKind::Reject,
            Self::ConfirmArrival => ActionKind::ConfirmArrival,
            Self::ActivateCharging => ActionKind::ActivateCharging,
            Self::ConfirmChargingStarted => ActionKind::ConfirmChargingStarted,
            Self::ReportChargingFailure { .. } => ActionKind::ReportChargingFailure,
            Self::FinishCharging => ActionKind::FinishCharging,
            Self::AttachPhoto { .. } => ActionKind::AttachPhoto,
            Self::DeclareKwh { .. } => ActionKind::DeclareKwh,
            Self::ConfirmKwh => ActionKind::ConfirmKwh,
            Self::DisputeKwh { .. } => ActionKind::DisputeKwh,
            Self::DeclarePayment => ActionKind::DeclarePayment,
            Self::ConfirmPayment => ActionKind::ConfirmPayment,
            Self::DenyPayment { .. } => ActionKind::DenyPayment,
            Self::RaiseIssue { .. } => ActionKind::RaiseIssue,
            Self::ResolveDispute { .. } => ActionKind::ResolveDispute,
            Self::ResumeAfterDispute { .. } => ActionKind::ResumeAfterDispute,
            Self::Cancel { .. } => ActionKind::Cancel,
        }
    }

    /// Builds a command from its kind and raw payload text, as carried in a
    /// callback or a replayed row. Payload-free kinds ignore `payload`.
    ///
    /// # Errors
    ///
    /// [`MarketError::Validation`] if a KWh payload is not a number.
    pub fn from_parts(kind: ActionKind, payload: &str) -> Result<Command, MarketError> {
        let text = payload.trim().to_string();
        Ok(match kind {
            ActionKind::Accept => Command::Accept,
            ActionKind::Reject => Command::Reject { reason: text },
            ActionKind::ConfirmArrival => Command::ConfirmArrival,
            ActionKind::ActivateCharging => Command::ActivateCharging,
            ActionKind::ConfirmChargingStarted => Command::ConfirmChargingStarted,
            ActionKind::ReportChargingFailure => Command::ReportChargingFailure { description: text },
            ActionKind::FinishCharging => Command::FinishCharging,
            ActionKind::AttachPhoto => Command::AttachPhoto { photo_ref: text },
            ActionKind::DeclareKwh => Command::DeclareKwh {
                kwh: parse_reading(&text)?,
            },
            ActionKind::ConfirmKwh => Command::ConfirmKwh,
            ActionKind::DisputeKwh => Command::DisputeKwh { reason: text },
            ActionKind::DeclarePayment => Command::DeclarePayment,
            ActionKind::ConfirmPayment => Command::ConfirmPayment,
            ActionKind::DenyPayment => Command::DenyPayment { reason: text },
            ActionKind::RaiseIssue => Command::RaiseIssue { description: text },
            ActionKind::ResolveDispute => Command::ResolveDispute { note: text },
            ActionKind::ResumeAfterDispute => Command::ResumeAfterDispute { note: text },
            ActionKind::Cancel => Command::Cancel { reason: text },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FromState {
    Exactly(TransactionStatus),
    /// Any status that is not terminal.
    AnyOpen,
}

impl FromState {
    pub fn matches(&self, status: TransactionStatus) -> bool {
        match self {
            FromState::Exactly(expected) => *expected == status,
            FromState::AnyOpen => !status.is_terminal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToState {
    Exactly(TransactionStatus),
    /// Stay in place and count a retry.
    RetrySame,
    /// Return to the status saved when the dispute was opened.
    Resume,
    /// Move there once both parties have taken the action. The first one is
    /// recorded as a proposal and the status stays put.
    Mutual(TransactionStatus),
}

impl ToState {
    /// Status this rule ends in when it does not depend on the document.
    pub fn target(&self) -> Option<TransactionStatus> {
        match self {
            ToState::Exactly(status) | ToState::Mutual(status) => Some(*status),
            ToState::RetrySame | ToState::Resume => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actors {
    Seller,
    Buyer,
    Either,
}

impl Actors {
    pub fn allows(&self, party: Party) -> bool {
        matches!(
            (self, party),
            (Actors::Either, _) | (Actors::Seller, Party::Seller) | (Actors::Buyer, Party::Buyer)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub from: FromState,
    pub action: ActionKind,
    pub to: ToState,
    pub actors: Actors,
}

const fn rule(from: FromState, action: ActionKind, to: ToState, actors: Actors) -> Rule {
    Rule {
        from,
        action,
        to,
        actors,
    }
}

use ActionKind as A;
use FromState::{AnyOpen, Exactly as At};
use ToState::{Exactly as To, Mutual, Resume, RetrySame};
use TransactionStatus as S;

pub const RULES: &[Rule] = &[
    rule(At(S::PendingSeller), A::Accept, To(S::Confirmed), Actors::Seller),
    rule(At(S::PendingSeller), A::Reject, To(S::Cancelled), Actors::Seller),
    rule(At(S::Confirmed), A::ConfirmArrival, To(S::BuyerArrived), Actors::Buyer),
    rule(At(S::BuyerArrived), A::ActivateCharging, To(S::ChargingStarted), Actors::Seller),
    rule(At(S::ChargingStarted), A::ConfirmChargingStarted, To(S::ChargingInProgress), Actors::Buyer),
    rule(At(S::ChargingStarted), A::ReportChargingFailure, RetrySame, Actors::Buyer),
    rule(At(S::ChargingInProgress), A::FinishCharging, To(S::ChargingCompleted), Actors::Buyer),
    rule(At(S::ChargingCompleted), A::AttachPhoto, To(S::PhotoUploaded), Actors::Buyer),
    rule(At(S::PhotoUploaded), A::DeclareKwh, To(S::KwhDeclared), Actors::Buyer),
    rule(At(S::KwhDeclared), A::ConfirmKwh, To(S::PaymentRequested), Actors::Seller),
    rule(At(S::KwhDeclared), A::DisputeKwh, To(S::Disputed), Actors::Seller),
    rule(At(S::PaymentRequested), A::DeclarePayment, To(S::PaymentDeclared), Actors::Buyer),
    rule(At(S::PaymentDeclared), A::ConfirmPayment, To(S::Completed), Actors::Seller),
    rule(At(S::PaymentDeclared), A::DenyPayment, To(S::Disputed), Actors::Seller),
    rule(AnyOpen, A::RaiseIssue, To(S::Disputed), Actors::Either),
    rule(At(S::Disputed), A::ResolveDispute, Mutual(S::Completed), Actors::Either),
    rule(At(S::Disputed), A::ResumeAfterDispute, Resume, Actors::Either),
    rule(At(S::PendingSeller), A::Cancel, To(S::Cancelled), Actors::Either),
    rule(At(S::Confirmed), A::Cancel, To(S::Cancelled), Actors::Either),
    rule(AnyOpen, A::Cancel, To(S::Cancelled), Actors::Seller),
];

/// First rule for `action` whose source matches `status`.
pub fn lookup(status: TransactionStatus, action: ActionKind) -> Option<&'static Rule> {
    RULES
        .iter()
        .find(|rule| rule.action == action && rule.from.matches(status))
}

/// Returns `true` if `party` may trigger `action` from at least one status.
pub fn permits(action: ActionKind, party: Party) -> bool {
    RULES
        .iter()
        .any(|rule| rule.action == action && rule.actors.allows(party))
}

/// Rules for `action` that `party` may use and that land in `status`.
///
/// A transaction already sitting in one of these targets has most likely
/// seen this exact action before.
pub fn landing_rules(
    status: TransactionStatus,
    action: ActionKind,
    party: Party,
) -> impl Iterator<Item = &'static Rule> {
    RULES.iter().filter(move |rule| {
        rule.action == action && rule.actors.allows(party) && rule.to.target() == Some(status)
    })
}
