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

//! Aggregate counts for reporting.

use crate::transaction::{Transaction, TransactionStatus};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub total: usize,
    /// Not yet completed or cancelled (includes disputed).
    pub pending: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub disputed: usize,
    pub by_status: BTreeMap<TransactionStatus, usize>,
    /// Billed KWh over completed transactions.
    pub billed_kwh: Decimal,
    /// Billed amount over completed transactions, unrounded. Saturates at [`Decimal::MAX`].
    pub billed_amount: Decimal,
}

impl TransactionStats {
    pub fn record(&mut self, transaction: &Transaction) {
        let status = transaction.status();
        self.total += 1;
        *self.by_status.entry(status).or_default() += 1;

        match status {
            TransactionStatus::Completed => {
                self.completed += 1;
                self.billed_kwh = self
                    .billed_kwh
                    .saturating_add(transaction.declared_kwh().unwrap_or_default());
                self.billed_amount = self
                    .billed_amount
                    .saturating_add(transaction.total_amount().unwrap_or_default());
            }
            TransactionStatus::Cancelled => self.cancelled += 1,
            TransactionStatus::Disputed => {
                self.disputed += 1;
                self.pending += 1;
            }
            _ => self.pending += 1,
        }
    }
}

impl<'a> FromIterator<&'a Transaction> for TransactionStats {
    fn from_iter<I: IntoIterator<Item = &'a Transaction>>(iter: I) -> Self {
        let mut stats = TransactionStats::default();
        for transaction in iter {
            stats.record(transaction);
        }
        stats
    }
}
