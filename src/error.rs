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

//! Error types for marketplace transaction processing.

use crate::transaction::TransactionStatus;
use crate::transition::ActionKind;
use thiserror::Error;

/// Marketplace processing errors.
///
/// None of these mutate state: a rejected action leaves the transaction
/// exactly as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    /// Caller is not a party entitled to trigger this transition
    #[error("caller is not authorized for this action")]
    Unauthorized,

    /// Action is not legal from the current status and is not a duplicate
    #[error("cannot {action} while transaction is {current}")]
    InvalidTransition {
        current: TransactionStatus,
        action: ActionKind,
    },

    /// Reference does not resolve to a record the caller may access
    #[error("record not found")]
    NotFound,

    /// Malformed input (non-positive KWh, empty photo reference, bad pricing)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Activation retries exhausted, manual intervention required
    #[error("charging activation retry limit exceeded after {retries} attempts")]
    RetryLimitExceeded { retries: u32 },

    /// Duplicate transaction ID
    #[error("duplicate transaction ID")]
    DuplicateTransaction,

    /// Backing store failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl MarketError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns `true` for errors the caller should surface as a plain rejection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::NotFound | Self::Validation(_) | Self::InvalidTransition { .. }
        )
    }
}
