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

//! Per-actor "what am I waiting for" state.
//!
//! Some actions need free-form input the chat delivers as a separate message
//! (a photo, a meter reading, a reason). Each actor has at most one pending
//! input, bound to the transaction it belongs to.

use crate::base::{TransactionId, UserId};
use crate::transition::Command;
use crate::MarketError;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingInput {
    PhotoUpload { transaction_id: TransactionId },
    KwhReading { transaction_id: TransactionId },
    IssueDescription { transaction_id: TransactionId },
    KwhDisputeReason { transaction_id: TransactionId },
    PaymentDenialReason { transaction_id: TransactionId },
    CancellationReason { transaction_id: TransactionId },
}

impl PendingInput {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::PhotoUpload { transaction_id }
            | Self::KwhReading { transaction_id }
            | Self::IssueDescription { transaction_id }
            | Self::KwhDisputeReason { transaction_id }
            | Self::PaymentDenialReason { transaction_id }
            | Self::CancellationReason { transaction_id } => transaction_id,
        }
    }

    /// Turns the actor's reply into the command it completes.
    ///
    /// # Errors
    ///
    /// [`MarketError::Validation`] if the reply is empty or, for a reading,
    /// not a number.
    pub fn into_command(self, reply: &str) -> Result<Command, MarketError> {
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(MarketError::validation("reply is empty"));
        }
        let text = reply.to_string();
        Ok(match self {
            Self::PhotoUpload { .. } => Command::AttachPhoto { photo_ref: text },
            Self::KwhReading { .. } => Command::DeclareKwh {
                kwh: parse_reading(reply)?,
            },
            Self::IssueDescription { .. } => Command::RaiseIssue { description: text },
            Self::KwhDisputeReason { .. } => Command::DisputeKwh { reason: text },
            Self::PaymentDenialReason { .. } => Command::DenyPayment { reason: text },
            Self::CancellationReason { .. } => Command::Cancel { reason: text },
        })
    }
}

/// Accepts both `12.5` and the comma form `12,5`.
pub(crate) fn parse_reading(reply: &str) -> Result<Decimal, MarketError> {
    Decimal::from_str(&reply.replace(',', "."))
        .map_err(|_| MarketError::validation(format!("'{reply}' is not a kwh reading")))
}

/// Pending inputs keyed by actor.
#[derive(Debug, Default)]
pub struct InteractionContexts {
    pending: DashMap<UserId, PendingInput>,
}

impl InteractionContexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records what `actor` is expected to send next, replacing any previous expectation.
    pub fn expect(&self, actor: UserId, input: PendingInput) -> Option<PendingInput> {
        self.pending.insert(actor, input)
    }

    pub fn peek(&self, actor: UserId) -> Option<PendingInput> {
        self.pending.get(&actor).map(|entry| entry.value().clone())
    }

    /// Removes and returns the expectation, so a reply is consumed once.
    pub fn take(&self, actor: UserId) -> Option<PendingInput> {
        self.pending.remove(&actor).map(|(_, input)| input)
    }

    /// Drops every expectation bound to `transaction_id`.
    pub fn clear_transaction(&self, transaction_id: &TransactionId) {
        self.pending
            .retain(|_, input| input.transaction_id() != transaction_id);
    }

    pub fn clear(&self, actor: UserId) {
        self.pending.remove(&actor);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn take_consumes_expectation() {
        let contexts = InteractionContexts::new();
        let input = PendingInput::KwhReading {
            transaction_id: "tx".into(),
        };
        assert_eq!(contexts.expect(UserId(1), input.clone()), None);
        assert_eq!(contexts.peek(UserId(1)), Some(input.clone()));
        assert_eq!(contexts.take(UserId(1)), Some(input));
        assert_eq!(contexts.take(UserId(1)), None);
    }

    #[test]
    fn expectations_are_scoped_per_actor() {
        let contexts = InteractionContexts::new();
        contexts.expect(UserId(1), PendingInput::PhotoUpload { transaction_id: "a".into() });
        contexts.expect(UserId(2), PendingInput::CancellationReason { transaction_id: "b".into() });
        contexts.expect(UserId(3), PendingInput::IssueDescription { transaction_id: "a".into() });

        contexts.clear_transaction(&"a".into());
        assert_eq!(contexts.len(), 1);
        assert!(contexts.peek(UserId(2)).is_some());
    }

    #[test]
    fn reading_reply_becomes_declare_command() {
        let input = PendingInput::KwhReading {
            transaction_id: "tx".into(),
        };
        assert_eq!(
            input.clone().into_command(" 12,5 ").unwrap(),
            Command::DeclareKwh { kwh: dec!(12.5) }
        );
        assert!(matches!(
            input.into_command("lots"),
            Err(MarketError::Validation(_))
        ));
    }

    #[test]
    fn empty_reply_is_rejected() {
        let input = PendingInput::PhotoUpload {
            transaction_id: "tx".into(),
        };
        assert!(input.into_command("   ").is_err());
    }
}
