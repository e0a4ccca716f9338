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

//! Domain events for the notification collaborator.
//!
//! The engine never composes or sends chat messages. It publishes one
//! [`DomainEvent`] per persisted change on a bounded channel and leaves the
//! decision of who to message, and with what, to the consumer.

use crate::base::{TransactionId, UserId};
use crate::issue::Issue;
use crate::pricing::PriceQuote;
use crate::transaction::TransactionStatus;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Transition-specific data attached to a [`TransitionEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventContext {
    None,
    Cancelled { reason: String },
    RetryRecorded { retry_count: u32, retries_left: u32 },
    PhotoAttached { photo_ref: String },
    PriceFrozen { quote: PriceQuote },
    IssueRecorded { issue: Issue },
    /// One party asked to close the dispute; the other still has to agree.
    ResolutionProposed { issue: Issue },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub transaction_id: TransactionId,
    pub previous_status: TransactionStatus,
    pub new_status: TransactionStatus,
    pub actor_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub context: EventContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A buyer requested a session; the seller must answer.
    Created {
        transaction_id: TransactionId,
        seller_id: UserId,
        buyer_id: UserId,
        timestamp: DateTime<Utc>,
    },
    Transitioned(TransitionEvent),
    /// Issue appended outside of a status change.
    IssueAppended {
        transaction_id: TransactionId,
        status: TransactionStatus,
        issue: Issue,
    },
    /// A session completed; both parties may now leave feedback.
    FeedbackRequested {
        transaction_id: TransactionId,
        seller_id: UserId,
        buyer_id: UserId,
    },
    /// Activation retries are exhausted and an administrator has to step in.
    EscalationRequired {
        transaction_id: TransactionId,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::Created { transaction_id, .. }
            | Self::IssueAppended { transaction_id, .. }
            | Self::FeedbackRequested { transaction_id, .. }
            | Self::EscalationRequired { transaction_id, .. } => transaction_id,
            Self::Transitioned(event) => &event.transaction_id,
        }
    }
}

/// Bounded event channel. Publishing never blocks.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: Sender<DomainEvent>,
    receiver: Receiver<DomainEvent>,
}

impl EventBus {
    pub(crate) fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        Self { sender, receiver }
    }

    /// Publishes `event`, dropping it when the buffer is full.
    ///
    /// The change it describes is already persisted, so a slow consumer can
    /// re-read state instead of blocking the engine.
    pub(crate) fn publish(&self, event: DomainEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(transaction = %event.transaction_id(), "event buffer full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<DomainEvent> {
        self.receiver.clone()
    }
}
